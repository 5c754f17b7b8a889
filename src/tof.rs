//! Reconstruct spectra from time-of-flight sub-scans.
//!
//! Ion mobility instruments record many sparse sub-scans per frame. Each one is
//! a list of time-of-flight bin indices with integer intensities. The merger
//! sums them into one index array, translates indices to m/z through the
//! instrument's calibration table and then coalesces near-coincident m/z
//! values into intensity-weighted centroids.
use std::ops::Add;

use log::trace;
use mzpeaks::Tolerance;
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::spectrum::Spectrum;

/// The default m/z coalescing tolerance
pub const DEFAULT_MZ_TOLERANCE: Tolerance = Tolerance::PPM(10.0);

/// The default index grouping window. Indices within this many units of the
/// first index of a cluster are collapsed together.
pub const DEFAULT_INDEX_WINDOW: u32 = 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TofMergeError {
    #[error("The index array has {indices} entries but the intensity array has {intensities}")]
    LengthMismatch { indices: usize, intensities: usize },
    #[error("Index {index} at position {position} does not increase strictly")]
    UnsortedIndices { index: u32, position: usize },
    #[error("Index {index} is outside the calibration table of {size} entries")]
    IndexOutOfCalibration { index: u32, size: usize },
    #[error("The calibration table is not ascending at index {0}")]
    InvalidCalibration(usize),
    #[error("Index {index} converts to a smaller m/z than the index before it")]
    NonMonotonicConverter { index: u32 },
}

/// One sparse time-of-flight sub-scan, with strictly increasing bin indices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TofRawFrame {
    indices: Vec<u32>,
    intensities: Vec<u32>,
}

impl TofRawFrame {
    pub fn new(indices: Vec<u32>, intensities: Vec<u32>) -> Result<Self, TofMergeError> {
        if indices.len() != intensities.len() {
            return Err(TofMergeError::LengthMismatch {
                indices: indices.len(),
                intensities: intensities.len(),
            });
        }
        if let Some(position) = indices.windows(2).position(|w| w[0] >= w[1]) {
            return Err(TofMergeError::UnsortedIndices {
                index: indices[position + 1],
                position: position + 1,
            });
        }
        Ok(Self {
            indices,
            intensities,
        })
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn intensities(&self) -> &[u32] {
        &self.intensities
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Translates a time-of-flight bin index into an m/z value
pub trait IndexConverter {
    fn convert(&self, index: u32) -> Option<f64>;

    /// The number of indices this converter covers
    fn size(&self) -> usize;

    fn convert_indices(&self, indices: &[u32]) -> Result<Vec<f64>, TofMergeError> {
        indices
            .iter()
            .map(|i| {
                self.convert(*i)
                    .ok_or(TofMergeError::IndexOutOfCalibration {
                        index: *i,
                        size: self.size(),
                    })
            })
            .collect()
    }
}

/// A pre-computed index to m/z table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MzLookupTable {
    mz_values: Vec<f64>,
}

impl MzLookupTable {
    pub fn new(mz_values: Vec<f64>) -> Result<Self, TofMergeError> {
        if let Some(i) = mz_values.windows(2).position(|w| !(w[0] <= w[1])) {
            return Err(TofMergeError::InvalidCalibration(i + 1));
        }
        Ok(Self { mz_values })
    }

    /// Tabulate a calibration function over `size` indices
    pub fn from_calibration<F: Fn(u32) -> f64>(size: u32, calibration: F) -> Result<Self, TofMergeError> {
        Self::new((0..size).map(calibration).collect())
    }

    pub fn len(&self) -> usize {
        self.mz_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mz_values.is_empty()
    }
}

impl IndexConverter for MzLookupTable {
    fn convert(&self, index: u32) -> Option<f64> {
        self.mz_values.get(index as usize).copied()
    }

    fn size(&self) -> usize {
        self.mz_values.len()
    }
}

/// How aggressively nearby signal is coalesced
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TofMergeConfig {
    pub index_window: u32,
    pub mz_tolerance: Tolerance,
}

impl Default for TofMergeConfig {
    fn default() -> Self {
        Self {
            index_window: DEFAULT_INDEX_WINDOW,
            mz_tolerance: DEFAULT_MZ_TOLERANCE,
        }
    }
}

impl TofMergeConfig {
    pub fn with_index_window(mut self, index_window: u32) -> Self {
        self.index_window = index_window;
        self
    }

    pub fn with_mz_tolerance(mut self, mz_tolerance: Tolerance) -> Self {
        self.mz_tolerance = mz_tolerance;
        self
    }
}

/// Merge two ascending index arrays, summing the intensities of indices
/// present in both.
pub fn two_pointer_merge<T: Copy + Add<Output = T>>(
    indices1: &[u32],
    indices2: &[u32],
    intensities1: &[T],
    intensities2: &[T],
) -> (Vec<u32>, Vec<T>) {
    let n = indices1.len() + indices2.len();
    let mut merged_indices = Vec::with_capacity(n);
    let mut merged_intensities = Vec::with_capacity(n);
    let (mut p1, mut p2) = (0, 0);

    while p1 < indices1.len() && p2 < indices2.len() {
        let (a, b) = (indices1[p1], indices2[p2]);
        if a < b {
            merged_indices.push(a);
            merged_intensities.push(intensities1[p1]);
            p1 += 1;
        } else if b < a {
            merged_indices.push(b);
            merged_intensities.push(intensities2[p2]);
            p2 += 1;
        } else {
            merged_indices.push(a);
            merged_intensities.push(intensities1[p1] + intensities2[p2]);
            p1 += 1;
            p2 += 1;
        }
    }
    merged_indices.extend_from_slice(&indices1[p1..]);
    merged_intensities.extend_from_slice(&intensities1[p1..]);
    merged_indices.extend_from_slice(&indices2[p2..]);
    merged_intensities.extend_from_slice(&intensities2[p2..]);

    (merged_indices, merged_intensities)
}

/// Merge any number of sub-scans into one ascending index array with no
/// repeated index, merging pairs of arrays until one remains.
pub fn merge_index_arrays(frames: &[TofRawFrame]) -> (Vec<u32>, Vec<u64>) {
    let mut layer: Vec<(Vec<u32>, Vec<u64>)> = frames
        .iter()
        .map(|f| {
            (
                f.indices.clone(),
                f.intensities.iter().map(|i| *i as u64).collect(),
            )
        })
        .collect();

    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        let mut it = layer.into_iter();
        while let Some((indices1, intensities1)) = it.next() {
            match it.next() {
                Some((indices2, intensities2)) => next.push(two_pointer_merge(
                    &indices1,
                    &indices2,
                    &intensities1,
                    &intensities2,
                )),
                None => next.push((indices1, intensities1)),
            }
        }
        layer = next;
    }
    layer.pop().unwrap_or_default()
}

/// Group indices lying within `index_window` of the first index of their
/// cluster. Each group becomes one entry at the floor of its intensity-weighted
/// mean index, carrying the group's summed intensity. Sums are taken in `u64`
/// so groups of saturated `u32` detector counts do not overflow.
pub fn collapse_arrays<T>(indices: &[u32], intensities: &[T], index_window: u32) -> (Vec<u32>, Vec<u64>)
where
    T: Copy + Into<u64>,
{
    let mut collapsed_indices = Vec::with_capacity(indices.len());
    let mut collapsed_intensities = Vec::with_capacity(indices.len());

    let mut start = 0;
    while start < indices.len() {
        let first = indices[start];
        let limit = first.saturating_add(index_window);
        let mut end = start + 1;
        while end < indices.len() && indices[end] <= limit {
            end += 1;
        }

        let mut total = 0u64;
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for i in start..end {
            let intensity: u64 = intensities[i].into();
            total = total.saturating_add(intensity);
            let w = intensity as f64;
            weighted += indices[i] as f64 * w;
            weight_sum += w;
        }
        let index = if weight_sum > 0.0 {
            (weighted / weight_sum).floor() as u32
        } else {
            first
        };
        collapsed_indices.push(index);
        collapsed_intensities.push(total);
        start = end;
    }

    (collapsed_indices, collapsed_intensities)
}

/// Interleave two ascending m/z arrays. Equal values are kept as separate
/// entries for [`collapse_mz`] to combine.
pub fn two_pointer_merge_mz<T: Copy>(
    mzs1: &[f64],
    mzs2: &[f64],
    intensities1: &[T],
    intensities2: &[T],
) -> (Vec<f64>, Vec<T>) {
    let n = mzs1.len() + mzs2.len();
    let mut merged_mzs = Vec::with_capacity(n);
    let mut merged_intensities = Vec::with_capacity(n);
    let (mut p1, mut p2) = (0, 0);
    while p1 < mzs1.len() && p2 < mzs2.len() {
        if mzs1[p1] < mzs2[p2] {
            merged_mzs.push(mzs1[p1]);
            merged_intensities.push(intensities1[p1]);
            p1 += 1;
        } else {
            merged_mzs.push(mzs2[p2]);
            merged_intensities.push(intensities2[p2]);
            p2 += 1;
        }
    }
    merged_mzs.extend_from_slice(&mzs1[p1..]);
    merged_intensities.extend_from_slice(&intensities1[p1..]);
    merged_mzs.extend_from_slice(&mzs2[p2..]);
    merged_intensities.extend_from_slice(&intensities2[p2..]);
    (merged_mzs, merged_intensities)
}

/// Coalesce runs of ascending m/z values where each value lies within
/// `tolerance` of its predecessor. A run becomes one peak at its
/// intensity-weighted m/z with the summed intensity. Single peaks pass through
/// unchanged.
pub fn collapse_mz<T: Copy + ToPrimitive>(
    mzs: &[f64],
    intensities: &[T],
    tolerance: Tolerance,
) -> (Vec<f64>, Vec<f64>) {
    let mut collapsed_mzs = Vec::with_capacity(mzs.len());
    let mut collapsed_intensities = Vec::with_capacity(mzs.len());

    let mut start = 0;
    while start < mzs.len() {
        let (_, mut upper) = tolerance.bounds(mzs[start]);
        let mut end = start + 1;
        while end < mzs.len() && mzs[end] <= upper {
            upper = tolerance.bounds(mzs[end]).1;
            end += 1;
        }

        if end - start == 1 {
            collapsed_mzs.push(mzs[start]);
            collapsed_intensities.push(intensities[start].to_f64().unwrap_or(0.0));
        } else {
            let total: f64 = intensities[start..end]
                .iter()
                .map(|i| i.to_f64().unwrap_or(0.0))
                .sum();
            let mz = if total > 0.0 {
                mzs[start..end]
                    .iter()
                    .zip(&intensities[start..end])
                    .map(|(mz, i)| mz * i.to_f64().unwrap_or(0.0) / total)
                    .sum()
            } else {
                mzs[start..end].iter().sum::<f64>() / (end - start) as f64
            };
            collapsed_mzs.push(mz);
            collapsed_intensities.push(total);
        }
        start = end;
    }
    (collapsed_mzs, collapsed_intensities)
}

/// Group entries whose indices lie within `index_window` of the first index of
/// their cluster, as [`collapse_arrays`] does, but place each group at the
/// intensity-weighted mean of its converted m/z values
fn group_converted(
    indices: &[u32],
    mzs: &[f64],
    intensities: &[u64],
    index_window: u32,
) -> (Vec<f64>, Vec<u64>) {
    let mut grouped_mzs = Vec::with_capacity(mzs.len());
    let mut grouped_intensities = Vec::with_capacity(mzs.len());
    let mut start = 0;
    while start < indices.len() {
        let limit = indices[start].saturating_add(index_window);
        let mut end = start + 1;
        while end < indices.len() && indices[end] <= limit {
            end += 1;
        }
        let total: u64 = intensities[start..end].iter().sum();
        let mz = if end - start == 1 || total == 0 {
            mzs[start]
        } else {
            mzs[start..end]
                .iter()
                .zip(&intensities[start..end])
                .map(|(mz, i)| mz * *i as f64)
                .sum::<f64>()
                / total as f64
        };
        grouped_mzs.push(mz);
        grouped_intensities.push(total);
        start = end;
    }
    (grouped_mzs, grouped_intensities)
}

/// Merge the sub-scans of one frame into a centroided spectrum
pub fn merge_arrays_to_spectrum<C: IndexConverter + ?Sized>(
    frames: &[TofRawFrame],
    converter: &C,
    config: &TofMergeConfig,
) -> Result<Spectrum, TofMergeError> {
    let (indices, intensities) = merge_index_arrays(frames);
    let mzs = converter.convert_indices(&indices)?;
    if let Some(i) = mzs.windows(2).position(|w| !(w[0] <= w[1])) {
        return Err(TofMergeError::NonMonotonicConverter {
            index: indices[i + 1],
        });
    }
    let (mzs, intensities) = group_converted(&indices, &mzs, &intensities, config.index_window);
    let (mzs, intensities) = collapse_mz(&mzs, &intensities, config.mz_tolerance);
    trace!(
        "Merged {} sub-scans into {} peaks",
        frames.len(),
        mzs.len()
    );
    Ok(Spectrum::from_sorted_parts(mzs, intensities))
}

/// Merge component spectra that are already on the m/z scale
pub fn merge_spectra(spectra: &[Spectrum], tolerance: Tolerance) -> Spectrum {
    let mut combined: (Vec<f64>, Vec<f64>) = (Vec::new(), Vec::new());
    for spectrum in spectra {
        combined = two_pointer_merge_mz(
            &combined.0,
            spectrum.mz(),
            &combined.1,
            spectrum.intensity(),
        );
    }
    let (mzs, intensities) = collapse_mz(&combined.0, &combined.1, tolerance);
    Spectrum::from_sorted_parts(mzs, intensities)
}
