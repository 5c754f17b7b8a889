use thiserror::Error;

use super::peaks::Spectrum;
use super::scan_properties::{MzAnalyzerType, MzRange, Polarity, PrecursorInfo};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanRecordError {
    #[error("Scan {0} has no isolation m/z to select a precursor peak with")]
    MissingIsolationMz(u32),
    #[error("Scan {0} has no selected ion m/z")]
    MissingSelectedIonMz(u32),
    #[error("Scan {0} has no monoisotopic m/z guess")]
    MissingMonoisotopicGuess(u32),
    #[error("The precursor spectrum for scan {0} contains no peaks")]
    EmptyPrecursorSpectrum(u32),
    #[error("Scan {0} is a survey scan and has no precursor")]
    NotAFragmentationScan(u32),
}

/// One acquired spectrum together with its instrument metadata and, for
/// fragmentation scans, its precursor linkage.
///
/// Scans are built once by a format adapter. Only the precursor scan number,
/// the native identifier and the isolation range can be changed afterwards,
/// since some formats need a second pass to fill them in.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    spectrum: Spectrum,
    one_based_scan_number: u32,
    ms_order: u8,
    /// In minutes
    retention_time: f64,
    polarity: Polarity,
    is_centroid: bool,
    scan_window: Option<MzRange>,
    native_id: String,
    scan_filter: Option<String>,
    mz_analyzer: MzAnalyzerType,
    total_ion_current: f64,
    injection_time: Option<f64>,
    precursor: Option<PrecursorInfo>,
    isolation_range: Option<MzRange>,
    one_based_precursor_scan_number: Option<u32>,
    native_precursor_id: Option<String>,
}

impl ScanRecord {
    pub fn new(
        spectrum: Spectrum,
        one_based_scan_number: u32,
        ms_order: u8,
        is_centroid: bool,
        polarity: Polarity,
        retention_time: f64,
    ) -> Self {
        let total_ion_current = spectrum.total_intensity();
        Self {
            spectrum,
            one_based_scan_number,
            ms_order,
            retention_time,
            polarity,
            is_centroid,
            scan_window: None,
            native_id: String::new(),
            scan_filter: None,
            mz_analyzer: MzAnalyzerType::Unknown,
            total_ion_current,
            injection_time: None,
            precursor: None,
            isolation_range: None,
            one_based_precursor_scan_number: None,
            native_precursor_id: None,
        }
    }

    pub fn with_native_id<S: Into<String>>(mut self, native_id: S) -> Self {
        self.native_id = native_id.into();
        self
    }

    pub fn with_scan_window(mut self, scan_window: Option<MzRange>) -> Self {
        self.scan_window = scan_window;
        self
    }

    pub fn with_scan_filter(mut self, scan_filter: Option<String>) -> Self {
        self.scan_filter = scan_filter;
        self
    }

    pub fn with_mz_analyzer(mut self, mz_analyzer: MzAnalyzerType) -> Self {
        self.mz_analyzer = mz_analyzer;
        self
    }

    /// Override the total ion current computed from the spectrum, e.g. with the
    /// value the instrument reported
    pub fn with_total_ion_current(mut self, total_ion_current: f64) -> Self {
        self.total_ion_current = total_ion_current;
        self
    }

    pub fn with_injection_time(mut self, injection_time: Option<f64>) -> Self {
        self.injection_time = injection_time;
        self
    }

    /// Attach precursor information. The selected ion charge's sign is made to
    /// agree with the scan polarity.
    pub fn with_precursor(mut self, mut precursor: PrecursorInfo) -> Self {
        precursor.normalize_charge(self.polarity);
        self.precursor = Some(precursor);
        self
    }

    /// The precursor scan number as reported by the source, before resolution
    pub fn with_native_precursor_scan_number(mut self, scan_number: Option<u32>) -> Self {
        self.one_based_precursor_scan_number = scan_number;
        self
    }

    /// The native identifier of the precursor scan as reported by the source
    pub fn with_native_precursor_id(mut self, native_id: Option<String>) -> Self {
        self.native_precursor_id = native_id;
        self
    }

    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    pub fn one_based_scan_number(&self) -> u32 {
        self.one_based_scan_number
    }

    pub fn ms_order(&self) -> u8 {
        self.ms_order
    }

    /// Retention time in minutes, `NaN` if unknown
    pub fn retention_time(&self) -> f64 {
        self.retention_time
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn is_centroid(&self) -> bool {
        self.is_centroid
    }

    pub fn scan_window(&self) -> Option<MzRange> {
        self.scan_window
    }

    pub fn native_id(&self) -> &str {
        &self.native_id
    }

    pub fn scan_filter(&self) -> Option<&str> {
        self.scan_filter.as_deref()
    }

    pub fn mz_analyzer(&self) -> MzAnalyzerType {
        self.mz_analyzer
    }

    pub fn total_ion_current(&self) -> f64 {
        self.total_ion_current
    }

    pub fn injection_time(&self) -> Option<f64> {
        self.injection_time
    }

    pub fn precursor(&self) -> Option<&PrecursorInfo> {
        self.precursor.as_ref()
    }

    pub fn one_based_precursor_scan_number(&self) -> Option<u32> {
        self.one_based_precursor_scan_number
    }

    pub fn native_precursor_id(&self) -> Option<&str> {
        self.native_precursor_id.as_deref()
    }

    pub fn isolation_mz(&self) -> Option<f64> {
        self.precursor.as_ref().and_then(|p| p.isolation_mz)
    }

    pub fn selected_ion_mz(&self) -> Option<f64> {
        self.precursor.as_ref().and_then(|p| p.selected_ion_mz)
    }

    /// The isolated m/z interval, either set explicitly or derived as the
    /// isolation target plus or minus half the isolation width
    pub fn isolation_range(&self) -> Option<MzRange> {
        if self.isolation_range.is_some() {
            return self.isolation_range;
        }
        let precursor = self.precursor.as_ref()?;
        match (precursor.isolation_mz, precursor.isolation_width) {
            (Some(target), Some(width)) => {
                Some(MzRange::new(target - width / 2.0, target + width / 2.0))
            }
            _ => None,
        }
    }

    pub fn set_isolation_range(&mut self, min: f64, max: f64) {
        self.isolation_range = Some(MzRange::new(min, max));
    }

    pub fn set_native_id<S: Into<String>>(&mut self, native_id: S) {
        self.native_id = native_id.into();
    }

    pub fn set_one_based_precursor_scan_number(&mut self, scan_number: Option<u32>) {
        self.one_based_precursor_scan_number = scan_number;
    }

    pub(crate) fn replace_precursor(&mut self, precursor: PrecursorInfo) {
        self.precursor = Some(precursor);
    }

    fn precursor_mut(&mut self) -> Result<&mut PrecursorInfo, ScanRecordError> {
        let scan_number = self.one_based_scan_number;
        self.precursor
            .as_mut()
            .ok_or(ScanRecordError::NotAFragmentationScan(scan_number))
    }

    /// Replace the selected ion m/z and intensity with the precursor spectrum peak
    /// closest to the isolation target
    pub fn refine_selected_mz_and_intensity(
        &mut self,
        precursor_spectrum: &Spectrum,
    ) -> Result<(), ScanRecordError> {
        let scan_number = self.one_based_scan_number;
        let precursor = self.precursor_mut()?;
        let target = precursor
            .isolation_mz
            .ok_or(ScanRecordError::MissingIsolationMz(scan_number))?;
        let (mz, intensity) = closest_peak(precursor_spectrum, target, scan_number)?;
        precursor.selected_ion_mz = Some(mz);
        precursor.selected_ion_intensity = Some(intensity);
        Ok(())
    }

    /// Snap the selected ion to the closest precursor spectrum peak
    pub fn compute_selected_peak_intensity(
        &mut self,
        precursor_spectrum: &Spectrum,
    ) -> Result<(), ScanRecordError> {
        let scan_number = self.one_based_scan_number;
        let precursor = self.precursor_mut()?;
        let query = precursor
            .selected_ion_mz
            .ok_or(ScanRecordError::MissingSelectedIonMz(scan_number))?;
        let (mz, intensity) = closest_peak(precursor_spectrum, query, scan_number)?;
        precursor.selected_ion_mz = Some(mz);
        precursor.selected_ion_intensity = Some(intensity);
        Ok(())
    }

    /// Snap the monoisotopic guess to the closest precursor spectrum peak
    pub fn compute_monoisotopic_peak_intensity(
        &mut self,
        precursor_spectrum: &Spectrum,
    ) -> Result<(), ScanRecordError> {
        let scan_number = self.one_based_scan_number;
        let precursor = self.precursor_mut()?;
        let query = precursor
            .monoisotopic_guess_mz
            .ok_or(ScanRecordError::MissingMonoisotopicGuess(scan_number))?;
        let (mz, intensity) = closest_peak(precursor_spectrum, query, scan_number)?;
        precursor.monoisotopic_guess_mz = Some(mz);
        precursor.monoisotopic_guess_intensity = Some(intensity);
        Ok(())
    }

    /// A copy of the precursor with the selected ion snapped to the peak closest
    /// to the isolation target, or to the selected ion m/z when there is no
    /// target, and the monoisotopic guess snapped when there is one. The scan
    /// itself is left untouched.
    pub fn refined_precursor(
        &self,
        precursor_spectrum: &Spectrum,
    ) -> Result<PrecursorInfo, ScanRecordError> {
        let scan_number = self.one_based_scan_number;
        let mut precursor = self
            .precursor
            .clone()
            .ok_or(ScanRecordError::NotAFragmentationScan(scan_number))?;
        let query = precursor
            .isolation_mz
            .or(precursor.selected_ion_mz)
            .ok_or(ScanRecordError::MissingSelectedIonMz(scan_number))?;
        let (mz, intensity) = closest_peak(precursor_spectrum, query, scan_number)?;
        precursor.selected_ion_mz = Some(mz);
        precursor.selected_ion_intensity = Some(intensity);
        if let Some(guess) = precursor.monoisotopic_guess_mz {
            let (mz, intensity) = closest_peak(precursor_spectrum, guess, scan_number)?;
            precursor.monoisotopic_guess_mz = Some(mz);
            precursor.monoisotopic_guess_intensity = Some(intensity);
        }
        Ok(precursor)
    }
}

fn closest_peak(
    spectrum: &Spectrum,
    query: f64,
    scan_number: u32,
) -> Result<(f64, f64), ScanRecordError> {
    let i = spectrum
        .closest_peak_index(query)
        .ok_or(ScanRecordError::EmptyPrecursorSpectrum(scan_number))?;
    Ok((spectrum.mz()[i], spectrum.intensity()[i]))
}

#[cfg(test)]
mod test {
    use super::*;

    fn msn_scan() -> ScanRecord {
        let spectrum = Spectrum::new(vec![100.0, 200.0], vec![1.0, 2.0]).unwrap();
        ScanRecord::new(spectrum, 2, 2, true, Polarity::Negative, 1.5).with_precursor(
            PrecursorInfo {
                selected_ion_mz: Some(500.2),
                selected_ion_charge: Some(2),
                isolation_mz: Some(500.0),
                isolation_width: Some(2.0),
                monoisotopic_guess_mz: Some(499.7),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_isolation_range() {
        let mut scan = msn_scan();
        assert_eq!(scan.isolation_range(), Some(MzRange::new(499.0, 501.0)));
        scan.set_isolation_range(498.0, 502.0);
        assert_eq!(scan.isolation_range(), Some(MzRange::new(498.0, 502.0)));
        assert_eq!(scan.precursor().unwrap().selected_ion_charge, Some(-2));
        assert_eq!(scan.total_ion_current(), 3.0);
    }

    #[test]
    fn test_refine_selected_ion() {
        let mut scan = msn_scan();
        let precursor = Spectrum::new(vec![499.7, 500.01, 501.0], vec![10.0, 40.0, 5.0]).unwrap();
        scan.refine_selected_mz_and_intensity(&precursor).unwrap();
        let info = scan.precursor().unwrap();
        assert_eq!(info.selected_ion_mz, Some(500.01));
        assert_eq!(info.selected_ion_intensity, Some(40.0));

        scan.compute_monoisotopic_peak_intensity(&precursor).unwrap();
        assert_eq!(scan.precursor().unwrap().monoisotopic_guess_intensity, Some(10.0));

        let err = scan
            .refine_selected_mz_and_intensity(&Spectrum::empty())
            .unwrap_err();
        assert_eq!(err, ScanRecordError::EmptyPrecursorSpectrum(2));
    }

    #[test]
    fn test_refined_precursor_leaves_scan_untouched() {
        let scan = msn_scan();
        let precursor = Spectrum::new(vec![499.6, 500.05], vec![7.0, 30.0]).unwrap();
        let refined = scan.refined_precursor(&precursor).unwrap();
        assert_eq!(refined.selected_ion_mz, Some(500.05));
        assert_eq!(refined.selected_ion_intensity, Some(30.0));
        assert_eq!(refined.monoisotopic_guess_mz, Some(499.6));
        assert_eq!(refined.monoisotopic_guess_intensity, Some(7.0));
        assert_eq!(scan, msn_scan());

        assert_eq!(
            scan.refined_precursor(&Spectrum::empty()),
            Err(ScanRecordError::EmptyPrecursorSpectrum(2))
        );
    }

    #[test]
    fn test_refine_requires_isolation() {
        let spectrum = Spectrum::new(vec![100.0], vec![1.0]).unwrap();
        let mut scan = ScanRecord::new(spectrum.clone(), 3, 2, true, Polarity::Positive, 0.0)
            .with_precursor(PrecursorInfo::default());
        assert_eq!(
            scan.refine_selected_mz_and_intensity(&spectrum),
            Err(ScanRecordError::MissingIsolationMz(3))
        );
        let mut survey = ScanRecord::new(spectrum.clone(), 1, 1, true, Polarity::Positive, 0.0);
        assert_eq!(
            survey.compute_selected_peak_intensity(&spectrum),
            Err(ScanRecordError::NotAFragmentationScan(1))
        );
    }
}
