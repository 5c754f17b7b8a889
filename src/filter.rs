//! Intensity-based peak down-sampling.
//!
//! A spectrum's m/z span is split into windows, the most intense peaks of each
//! window are kept, then peaks that are too weak relative to the base peak are
//! dropped and, optionally, the survivors are rescaled.
use log::trace;

use crate::spectrum::{MzRange, Spectrum};

/// The intensity the most intense surviving peak is scaled to when
/// normalization is requested
pub const NORMALIZED_REFERENCE_INTENSITY: f64 = 50.0;

/// Peak filtering parameters. Every numeric constraint is optional and an
/// absent value means no constraint of that kind.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilterConfig {
    pub peaks_per_window: Option<usize>,
    pub min_intensity_ratio_to_base_peak: Option<f64>,
    pub nominal_window_width_da: Option<u32>,
    pub number_of_windows: Option<usize>,
    pub normalize_to_max: bool,
    pub apply_to_ms1: bool,
    pub apply_to_msms: bool,
    pub normalization_reference: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            peaks_per_window: None,
            min_intensity_ratio_to_base_peak: None,
            nominal_window_width_da: None,
            number_of_windows: None,
            normalize_to_max: false,
            apply_to_ms1: true,
            apply_to_msms: true,
            normalization_reference: NORMALIZED_REFERENCE_INTENSITY,
        }
    }
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peaks_per_window(mut self, peaks_per_window: usize) -> Self {
        self.peaks_per_window = Some(peaks_per_window);
        self
    }

    pub fn with_min_intensity_ratio(mut self, ratio: f64) -> Self {
        self.min_intensity_ratio_to_base_peak = Some(ratio);
        self
    }

    pub fn with_window_width(mut self, width_da: u32) -> Self {
        self.nominal_window_width_da = Some(width_da);
        self
    }

    pub fn with_number_of_windows(mut self, number_of_windows: usize) -> Self {
        self.number_of_windows = Some(number_of_windows);
        self
    }

    pub fn with_normalization(mut self, normalize_to_max: bool) -> Self {
        self.normalize_to_max = normalize_to_max;
        self
    }

    pub fn with_normalization_reference(mut self, reference: f64) -> Self {
        self.normalization_reference = reference;
        self
    }

    pub fn with_ms_orders(mut self, apply_to_ms1: bool, apply_to_msms: bool) -> Self {
        self.apply_to_ms1 = apply_to_ms1;
        self.apply_to_msms = apply_to_msms;
        self
    }

    /// Whether scans of `ms_order` should be filtered with this configuration
    pub fn applies_to(&self, ms_order: u8) -> bool {
        if ms_order <= 1 {
            self.apply_to_ms1
        } else {
            self.apply_to_msms
        }
    }

    fn reduces_peaks(&self) -> bool {
        self.peaks_per_window.is_some() || self.min_intensity_ratio_to_base_peak.is_some()
    }

    fn window_count(&self, span: f64) -> usize {
        if span.is_nan() || span <= 0.0 {
            return 1;
        }
        match (self.nominal_window_width_da, self.number_of_windows) {
            (Some(width), _) if width > 0 => (span / width as f64).ceil().max(1.0) as usize,
            (_, Some(n)) if n > 1 => n,
            _ => 1,
        }
    }
}

/// Filter `spectrum`, partitioning its own m/z span into windows
pub fn filter(spectrum: &Spectrum, config: &FilterConfig) -> Spectrum {
    filter_in_range(spectrum, config, None)
}

/// Filter the spectrum of a scan of `ms_order`, passing it through untouched if
/// the configuration does not apply to that MS order
pub fn filter_for_scan(
    spectrum: Spectrum,
    config: Option<&FilterConfig>,
    ms_order: u8,
    scan_window: Option<MzRange>,
) -> Spectrum {
    match config {
        Some(config) if config.applies_to(ms_order) && !spectrum.is_empty() => {
            filter_in_range(&spectrum, config, scan_window)
        }
        _ => spectrum,
    }
}

/// Filter `spectrum`, partitioning `range` into windows. Peaks outside `range`
/// fall into the first or last window.
pub fn filter_in_range(
    spectrum: &Spectrum,
    config: &FilterConfig,
    range: Option<MzRange>,
) -> Spectrum {
    if spectrum.is_empty() || (!config.reduces_peaks() && !config.normalize_to_max) {
        return spectrum.clone();
    }
    let mzs = spectrum.mz();
    let intensities = spectrum.intensity();
    let n_peaks = mzs.len();

    let (low, high) = match range {
        Some(r) if r.min.is_finite() && r.max.is_finite() && r.max > r.min => (r.min, r.max),
        _ => (mzs[0], mzs[n_peaks - 1]),
    };
    let span = high - low;
    let n_windows = config.window_count(span);

    let mut keep: Vec<usize> = match config.peaks_per_window {
        Some(k) if n_windows <= n_peaks => {
            let width = match config.nominal_window_width_da {
                Some(w) if w > 0 => w as f64,
                _ => span / n_windows as f64,
            };
            let mut windows: Vec<Vec<usize>> = vec![Vec::new(); n_windows];
            for (i, mz) in mzs.iter().enumerate() {
                let bin = if width > 0.0 {
                    ((mz - low) / width).floor().max(0.0) as usize
                } else {
                    0
                };
                windows[bin.min(n_windows - 1)].push(i);
            }
            let mut keep = Vec::with_capacity(n_peaks.min(k.saturating_mul(n_windows)));
            for mut window in windows {
                // Stable, so equally intense peaks keep their m/z order
                window.sort_by(|a, b| intensities[*b].total_cmp(&intensities[*a]));
                keep.extend(window.into_iter().take(k));
            }
            keep.sort_unstable();
            keep
        }
        _ => (0..n_peaks).collect(),
    };
    trace!(
        "Windowing over {n_windows} windows kept {} of {n_peaks} peaks",
        keep.len()
    );

    let base = keep
        .iter()
        .map(|i| intensities[*i])
        .fold(0.0f64, f64::max);

    if let Some(ratio) = config.min_intensity_ratio_to_base_peak {
        if base > 0.0 {
            keep.retain(|i| {
                let v = intensities[*i];
                v >= base || v / base >= ratio
            });
        }
    }

    let scale = if config.normalize_to_max && base > 0.0 {
        config.normalization_reference / base
    } else {
        1.0
    };

    let mut out_mz = Vec::with_capacity(keep.len());
    let mut out_intensity = Vec::with_capacity(keep.len());
    for i in keep {
        out_mz.push(mzs[i]);
        out_intensity.push(intensities[i] * scale);
    }
    Spectrum::from_sorted_parts(out_mz, out_intensity)
}
