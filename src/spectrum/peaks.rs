use std::ops::Range;
use std::sync::OnceLock;

use mzpeaks::prelude::*;
use mzpeaks::{CentroidPeak, IndexType, PeakSet, Tolerance};
use thiserror::Error;

use crate::filter::{self, FilterConfig};

/// Intensities below this value are treated as absent when a reader strips
/// zero-intensity peaks.
pub const ZERO_EQUIVALENT_INTENSITY: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpectrumError {
    #[error("The m/z array has {mz} entries but the intensity array has {intensity}")]
    LengthMismatch { mz: usize, intensity: usize },
    #[error("Intensity {value} at position {index} is negative or not a number")]
    InvalidIntensity { value: f64, index: usize },
}

/// A centroided spectrum stored as parallel m/z and intensity arrays in
/// ascending m/z order.
///
/// The base peak and total intensity are computed on first use and cached.
#[derive(Debug, Clone, Default)]
pub struct Spectrum {
    mz: Vec<f64>,
    intensity: Vec<f64>,
    base_peak: OnceLock<Option<usize>>,
    total_intensity: OnceLock<f64>,
}

impl PartialEq for Spectrum {
    fn eq(&self, other: &Self) -> bool {
        self.mz == other.mz && self.intensity == other.intensity
    }
}

impl Spectrum {
    /// Build a spectrum from parallel arrays, co-sorting them by m/z if they
    /// are not already in ascending order. Equal m/z values keep their input order.
    pub fn new(mz: Vec<f64>, intensity: Vec<f64>) -> Result<Self, SpectrumError> {
        if mz.len() != intensity.len() {
            return Err(SpectrumError::LengthMismatch {
                mz: mz.len(),
                intensity: intensity.len(),
            });
        }
        if let Some((index, value)) = intensity
            .iter()
            .enumerate()
            .find(|(_, v)| v.is_nan() || **v < 0.0)
        {
            return Err(SpectrumError::InvalidIntensity {
                value: *value,
                index,
            });
        }
        let (mz, intensity) = if is_sorted(&mz) {
            (mz, intensity)
        } else {
            co_sort(mz, intensity)
        };
        Ok(Self::from_sorted_parts(mz, intensity))
    }

    pub(crate) fn from_sorted_parts(mz: Vec<f64>, intensity: Vec<f64>) -> Self {
        debug_assert_eq!(mz.len(), intensity.len());
        debug_assert!(is_sorted(&mz));
        Self {
            mz,
            intensity,
            base_peak: OnceLock::new(),
            total_intensity: OnceLock::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn mz(&self) -> &[f64] {
        &self.mz
    }

    pub fn intensity(&self) -> &[f64] {
        &self.intensity
    }

    /// The number of peaks in the spectrum
    pub fn size(&self) -> usize {
        self.mz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mz.is_empty()
    }

    pub fn first_mz(&self) -> Option<f64> {
        self.mz.first().copied()
    }

    pub fn last_mz(&self) -> Option<f64> {
        self.mz.last().copied()
    }

    fn base_peak_index(&self) -> Option<usize> {
        *self.base_peak.get_or_init(|| {
            // The first of several equally intense peaks wins
            self.intensity
                .iter()
                .enumerate()
                .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
                    Some((_, bv)) if bv >= *v => best,
                    _ => Some((i, *v)),
                })
                .map(|(i, _)| i)
        })
    }

    /// The most intense peak in the spectrum
    pub fn base_peak(&self) -> Option<CentroidPeak> {
        self.base_peak_index().map(|i| {
            CentroidPeak::new(self.mz[i], self.intensity[i] as f32, i as IndexType)
        })
    }

    pub fn base_peak_mz(&self) -> Option<f64> {
        self.base_peak_index().map(|i| self.mz[i])
    }

    pub fn base_peak_intensity(&self) -> Option<f64> {
        self.base_peak_index().map(|i| self.intensity[i])
    }

    pub fn total_intensity(&self) -> f64 {
        *self
            .total_intensity
            .get_or_init(|| self.intensity.iter().sum())
    }

    pub fn iter(&self) -> impl Iterator<Item = CentroidPeak> + '_ {
        self.mz
            .iter()
            .zip(self.intensity.iter())
            .enumerate()
            .map(|(i, (mz, inten))| CentroidPeak::new(*mz, *inten as f32, i as IndexType))
    }

    /// Copy the spectrum into an indexed [`PeakSet`] for tolerance-based searches
    pub fn to_peak_set(&self) -> PeakSet {
        PeakSet::new(self.iter().collect())
    }

    /// Drop every peak whose intensity is below `threshold`
    pub fn strip_zero_intensity(self, threshold: f64) -> Self {
        if !self.intensity.iter().any(|i| *i < threshold) {
            return self;
        }
        let (mz, intensity): (Vec<f64>, Vec<f64>) = self
            .mz
            .into_iter()
            .zip(self.intensity)
            .filter(|(_, i)| *i >= threshold)
            .unzip();
        Self::from_sorted_parts(mz, intensity)
    }

    /// Find the index of the peak whose m/z is closest to `mz`
    pub fn closest_peak_index(&self, mz: f64) -> Option<usize> {
        if self.mz.is_empty() {
            return None;
        }
        let i = self.mz.partition_point(|v| *v < mz);
        if i == 0 {
            Some(0)
        } else if i == self.mz.len() {
            Some(i - 1)
        } else if (self.mz[i] - mz).abs() < (mz - self.mz[i - 1]).abs() {
            Some(i)
        } else {
            Some(i - 1)
        }
    }

    /// The index range of peaks within `tolerance` of `mz`
    pub fn peaks_within(&self, mz: f64, tolerance: Tolerance) -> Range<usize> {
        let (low, high) = tolerance.bounds(mz);
        let start = self.mz.partition_point(|v| *v < low);
        let end = self.mz.partition_point(|v| *v <= high);
        start..end.max(start)
    }

    pub fn sum_intensity_within(&self, mz: f64, tolerance: Tolerance) -> f64 {
        self.intensity[self.peaks_within(mz, tolerance)].iter().sum()
    }

    /// Apply a [`FilterConfig`] to a copy of this spectrum
    pub fn filtered(&self, config: &FilterConfig) -> Spectrum {
        filter::filter(self, config)
    }

    pub fn into_arrays(self) -> (Vec<f64>, Vec<f64>) {
        (self.mz, self.intensity)
    }
}

pub(crate) fn is_sorted(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

/// Sort the paired arrays by the first, keeping equal keys in input order
pub(crate) fn co_sort(mz: Vec<f64>, intensity: Vec<f64>) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = mz.into_iter().zip(intensity).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    pairs.into_iter().unzip()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_construction_sorts() {
        let spec = Spectrum::new(vec![3.0, 1.0, 2.0], vec![30.0, 10.0, 20.0]).unwrap();
        assert_eq!(spec.mz(), &[1.0, 2.0, 3.0]);
        assert_eq!(spec.intensity(), &[10.0, 20.0, 30.0]);
        assert!(is_sorted(spec.mz()));
    }

    #[test]
    fn test_length_mismatch() {
        let err = Spectrum::new(vec![1.0, 2.0], vec![1.0]).unwrap_err();
        assert_eq!(err, SpectrumError::LengthMismatch { mz: 2, intensity: 1 });
        assert!(Spectrum::new(vec![1.0], vec![-1.0]).is_err());
    }

    #[test]
    fn test_summaries() {
        let spec = Spectrum::new(vec![100.0, 200.0, 300.0], vec![5.0, 50.0, 50.0]).unwrap();
        assert_eq!(spec.base_peak_mz(), Some(200.0));
        assert_eq!(spec.base_peak_intensity(), Some(50.0));
        assert_eq!(spec.total_intensity(), 105.0);
        assert_eq!(spec.first_mz(), Some(100.0));
        assert_eq!(spec.last_mz(), Some(300.0));
        let bp = spec.base_peak().unwrap();
        assert_eq!(bp.index, 1);

        let empty = Spectrum::empty();
        assert!(empty.base_peak().is_none());
        assert_eq!(empty.total_intensity(), 0.0);
    }

    #[test]
    fn test_strip_zero() {
        let spec = Spectrum::new(vec![1.0, 2.0, 3.0, 4.0], vec![0.0, 1.0, 0.001, 3.0]).unwrap();
        let spec = spec.strip_zero_intensity(ZERO_EQUIVALENT_INTENSITY);
        assert_eq!(spec.mz(), &[2.0, 4.0]);
        assert_eq!(spec.intensity(), &[1.0, 3.0]);
    }

    #[test]
    fn test_closest_and_within() {
        let spec = Spectrum::new(vec![100.0, 100.001, 200.0], vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(spec.closest_peak_index(0.0), Some(0));
        assert_eq!(spec.closest_peak_index(160.0), Some(2));
        assert_eq!(spec.closest_peak_index(500.0), Some(2));
        assert_eq!(spec.peaks_within(100.0, Tolerance::PPM(20.0)), 0..2);
        assert_eq!(spec.sum_intensity_within(100.0, Tolerance::PPM(20.0)), 3.0);
        assert!(spec.peaks_within(150.0, Tolerance::Da(0.5)).is_empty());

        let peaks = spec.to_peak_set();
        assert!(peaks.has_peak(200.0, Tolerance::PPM(5.0)).is_some());
    }
}
