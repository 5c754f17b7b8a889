//! The contract for vendor formats whose binary decoding lives outside this
//! crate, and the adapter that turns their raw scans into [`ScanRecord`]s.
use std::path::Path;

use log::trace;

use crate::filter::{filter_for_scan, FilterConfig};
use crate::meta::SourceFileInfo;
use crate::precursor::ScanHeader;
use crate::spectrum::{
    MzAnalyzerType, MzRange, Polarity, PrecursorInfo, ScanRecord, Spectrum,
    ZERO_EQUIVALENT_INTENSITY,
};
use crate::tof::{merge_arrays_to_spectrum, MzLookupTable, TofMergeConfig, TofRawFrame};

use super::traits::{FormatAdapter, MsDataFileError, RepresentationError, ScanDecodeError};

/// The scan metadata a vendor library reports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeScanHeader {
    pub ms_order: u8,
    /// In minutes
    pub retention_time: f64,
    pub polarity: Polarity,
    pub is_centroid: bool,
    pub scan_window: Option<MzRange>,
    /// Synthesized from the source's native ID format when empty
    pub native_id: String,
    /// The precursor scan number as the vendor reports it, which may be
    /// missing or wrong
    pub native_precursor_scan_number: Option<u32>,
    pub precursor: Option<PrecursorInfo>,
    pub mz_analyzer: MzAnalyzerType,
    pub scan_filter: Option<String>,
    pub injection_time: Option<f64>,
}

/// The signal of one raw scan
#[derive(Debug, Clone, PartialEq)]
pub enum RawScanData {
    /// Physical m/z and intensity arrays
    Centroid { mz: Vec<f64>, intensity: Vec<f64> },
    /// The time-of-flight sub-scans of one (frame, precursor) group
    Tof { frames: Vec<TofRawFrame> },
}

/// Which variant of [`RawScanData`] a scan carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawScanKind {
    Centroid,
    Tof,
}

impl RawScanData {
    pub fn kind(&self) -> RawScanKind {
        match self {
            Self::Centroid { .. } => RawScanKind::Centroid,
            Self::Tof { .. } => RawScanKind::Tof,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawScan {
    pub header: NativeScanHeader,
    pub data: RawScanData,
}

/**
A vendor library that can enumerate and read the scans of a file.

Positions are zero-based in acquisition order. Sources that report
time-of-flight data must provide the index to m/z calibration.
*/
pub trait NativeVendorSource: Sized + Send + Sync {
    fn open(path: &Path) -> Result<Self, MsDataFileError>;

    fn scan_count(&self) -> usize;

    fn read_scan(&mut self, position: usize) -> Result<RawScan, ScanDecodeError>;

    /// The header of the scan at `position` and the kind of signal it holds.
    /// Sources that can report these without reading the signal should; the
    /// default reads the whole scan.
    fn read_header(
        &mut self,
        position: usize,
    ) -> Result<(NativeScanHeader, RawScanKind), ScanDecodeError> {
        let RawScan { header, data } = self.read_scan(position)?;
        Ok((header, data.kind()))
    }

    fn source_file(&self) -> &SourceFileInfo;

    fn mz_calibration(&self) -> Option<MzLookupTable> {
        None
    }

    /// The coalescing tolerances that suit this source's TOF data
    fn merge_config(&self) -> TofMergeConfig {
        TofMergeConfig::default()
    }

    /// Find a scan from its native identifier. The default reads the
    /// `scan=` or `index=` component.
    fn position_of_native_id(&self, native_id: &str) -> Option<usize> {
        let position = native_id.split_whitespace().find_map(|token| {
            if let Some(n) = token.strip_prefix("scan=") {
                n.parse::<usize>().ok()?.checked_sub(1)
            } else if let Some(i) = token.strip_prefix("index=") {
                i.parse::<usize>().ok()
            } else {
                None
            }
        })?;
        (position < self.scan_count()).then_some(position)
    }
}

/// A [`FormatAdapter`] over any [`NativeVendorSource`]
pub struct NativeAdapter<S: NativeVendorSource> {
    source: S,
    calibration: Option<MzLookupTable>,
    merge_config: TofMergeConfig,
}

impl<S: NativeVendorSource> NativeAdapter<S> {
    pub fn new(source: S) -> Self {
        let calibration = source.mz_calibration();
        let merge_config = source.merge_config();
        Self {
            source,
            calibration,
            merge_config,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn native_id_of(&self, scan_number: u32, reported: String) -> String {
        if reported.is_empty() {
            self.source
                .source_file()
                .native_id_format
                .format_id(scan_number)
        } else {
            reported
        }
    }

    /// Rejections that need only the header and the kind of signal
    fn check_header(
        &self,
        native_id: &str,
        header: &NativeScanHeader,
        kind: RawScanKind,
    ) -> Result<(), ScanDecodeError> {
        if !header.is_centroid && kind == RawScanKind::Centroid {
            return Err(RepresentationError::ProfileSpectrum(native_id.to_string()).into());
        }
        if header.ms_order == 0 {
            return Err(ScanDecodeError::Malformed(format!("{native_id} has no MS order")));
        }
        if kind == RawScanKind::Tof && self.calibration.is_none() {
            return Err(ScanDecodeError::Malformed(format!(
                "{native_id}: the source has no m/z calibration for its TOF data"
            )));
        }
        Ok(())
    }

    fn build_spectrum(&self, native_id: &str, data: RawScanData) -> Result<Spectrum, ScanDecodeError> {
        match data {
            RawScanData::Centroid { mz, intensity } => Spectrum::new(mz, intensity)
                .map_err(|e| ScanDecodeError::Malformed(format!("{native_id}: {e}"))),
            RawScanData::Tof { frames } => {
                let calibration = self.calibration.as_ref().ok_or_else(|| {
                    ScanDecodeError::Malformed(format!(
                        "{native_id}: the source has no m/z calibration for its TOF data"
                    ))
                })?;
                merge_arrays_to_spectrum(&frames, calibration, &self.merge_config)
                    .map_err(|e| ScanDecodeError::Malformed(format!("{native_id}: {e}")))
            }
        }
    }
}

impl<S: NativeVendorSource> FormatAdapter for NativeAdapter<S> {
    type Payload = RawScan;

    fn open(path: &Path) -> Result<Self, MsDataFileError> {
        Ok(Self::new(S::open(path)?))
    }

    fn source_file(&self) -> &SourceFileInfo {
        self.source.source_file()
    }

    fn len(&self) -> usize {
        self.source.scan_count()
    }

    fn read_payload(&mut self, position: usize) -> Result<Self::Payload, ScanDecodeError> {
        self.source.read_scan(position)
    }

    fn decode(
        &self,
        position: usize,
        payload: Self::Payload,
        filter: Option<&FilterConfig>,
    ) -> Result<ScanRecord, ScanDecodeError> {
        let RawScan { mut header, data } = payload;
        let scan_number = position as u32 + 1;
        let native_id = self.native_id_of(scan_number, std::mem::take(&mut header.native_id));
        self.check_header(&native_id, &header, data.kind())?;

        let spectrum = self
            .build_spectrum(&native_id, data)?
            .strip_zero_intensity(ZERO_EQUIVALENT_INTENSITY);
        let spectrum = filter_for_scan(spectrum, filter, header.ms_order, header.scan_window);
        trace!("Decoded {native_id} with {} peaks", spectrum.size());

        let mut scan = ScanRecord::new(
            spectrum,
            scan_number,
            header.ms_order,
            true,
            header.polarity,
            header.retention_time,
        )
        .with_native_id(native_id)
        .with_scan_window(header.scan_window)
        .with_scan_filter(header.scan_filter)
        .with_mz_analyzer(header.mz_analyzer)
        .with_injection_time(header.injection_time);
        if header.ms_order > 1 {
            if let Some(precursor) = header.precursor {
                scan = scan.with_precursor(precursor);
            }
            scan = scan.with_native_precursor_scan_number(header.native_precursor_scan_number);
        }
        Ok(scan)
    }

    fn position_of_native_id(&self, native_id: &str) -> Option<usize> {
        self.source.position_of_native_id(native_id)
    }

    /// Goes through [`NativeVendorSource::read_header`], so the signal is not
    /// read or merged
    fn read_header(&mut self, position: usize) -> Result<Option<ScanHeader>, MsDataFileError> {
        let scan_number = position as u32 + 1;
        let checked = self.source.read_header(position).and_then(|(mut header, kind)| {
            let native_id = self.native_id_of(scan_number, std::mem::take(&mut header.native_id));
            self.check_header(&native_id, &header, kind)?;
            Ok(header.ms_order)
        });
        match checked {
            Ok(ms_order) => Ok(Some(ScanHeader {
                one_based_scan_number: scan_number,
                ms_order,
            })),
            Err(e) if e.is_recoverable() => Ok(None),
            Err(e) => Err(e.at_position(position)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::io::{self, Write};

    use crate::io::{LoadOptions, MsDataFile};
    use crate::meta::NativeIdFormat;

    /// A line-oriented stand-in for a vendor library.
    ///
    /// `C <first m/z> <step> <bins>` declares the calibration, `S <ms order> <rt>
    /// <centroid 0|1> <native precursor or -> <isolation m/z or ->` starts a
    /// scan, `P <mz>:<intensity> ...` gives its peaks and each
    /// `T <index>:<intensity> ...` adds a TOF sub-scan.
    struct TextVendorSource {
        scans: Vec<RawScan>,
        calibration: Option<MzLookupTable>,
        source_file: SourceFileInfo,
        signal_reads: usize,
    }

    fn invalid(message: &str) -> MsDataFileError {
        io::Error::new(io::ErrorKind::InvalidData, message.to_string()).into()
    }

    fn pairs<A: std::str::FromStr, B: std::str::FromStr>(
        fields: &[&str],
    ) -> Result<(Vec<A>, Vec<B>), MsDataFileError> {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for field in fields {
            let (a, b) = field.split_once(':').ok_or_else(|| invalid(field))?;
            left.push(a.parse().map_err(|_| invalid(a))?);
            right.push(b.parse().map_err(|_| invalid(b))?);
        }
        Ok((left, right))
    }

    impl NativeVendorSource for TextVendorSource {
        fn open(path: &Path) -> Result<Self, MsDataFileError> {
            let text = fs::read_to_string(path)?;
            let mut scans: Vec<RawScan> = Vec::new();
            let mut calibration = None;
            for line in text.lines() {
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.as_slice() {
                    ["C", start, step, bins] => {
                        let start: f64 = start.parse().map_err(|_| invalid(start))?;
                        let step: f64 = step.parse().map_err(|_| invalid(step))?;
                        let bins: u32 = bins.parse().map_err(|_| invalid(bins))?;
                        calibration = Some(
                            MzLookupTable::from_calibration(bins, |i| start + step * i as f64)
                                .map_err(|e| invalid(&e.to_string()))?,
                        );
                    }
                    ["S", order, rt, centroid, prec, isolation] => {
                        let precursor = isolation.parse::<f64>().ok().map(|mz| PrecursorInfo {
                            isolation_mz: Some(mz),
                            isolation_width: Some(2.0),
                            selected_ion_mz: Some(mz),
                            ..Default::default()
                        });
                        let header = NativeScanHeader {
                            ms_order: order.parse().map_err(|_| invalid(order))?,
                            retention_time: rt.parse().map_err(|_| invalid(rt))?,
                            polarity: Polarity::Positive,
                            is_centroid: *centroid == "1",
                            native_precursor_scan_number: prec.parse().ok(),
                            precursor,
                            ..Default::default()
                        };
                        scans.push(RawScan {
                            header,
                            data: RawScanData::Tof { frames: Vec::new() },
                        });
                    }
                    ["P", rest @ ..] => {
                        let (mz, intensity) = pairs::<f64, f64>(rest)?;
                        let scan = scans.last_mut().ok_or_else(|| invalid(line))?;
                        scan.data = RawScanData::Centroid { mz, intensity };
                    }
                    ["T", rest @ ..] => {
                        let (indices, intensities) = pairs::<u32, u32>(rest)?;
                        let frame = TofRawFrame::new(indices, intensities)
                            .map_err(|e| invalid(&e.to_string()))?;
                        let scan = scans.last_mut().ok_or_else(|| invalid(line))?;
                        if let RawScanData::Tof { frames } = &mut scan.data {
                            frames.push(frame);
                        }
                    }
                    [] => {}
                    _ => return Err(invalid(line)),
                }
            }
            let source_file = SourceFileInfo {
                native_id_format: NativeIdFormat::Thermo,
                ..SourceFileInfo::from_path(path)
            };
            Ok(Self {
                scans,
                calibration,
                source_file,
                signal_reads: 0,
            })
        }

        fn scan_count(&self) -> usize {
            self.scans.len()
        }

        fn read_scan(&mut self, position: usize) -> Result<RawScan, ScanDecodeError> {
            self.signal_reads += 1;
            self.scans.get(position).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no scan at {position}")).into()
            })
        }

        fn read_header(
            &mut self,
            position: usize,
        ) -> Result<(NativeScanHeader, RawScanKind), ScanDecodeError> {
            let scan = self.scans.get(position).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no scan at {position}"))
            })?;
            Ok((scan.header.clone(), scan.data.kind()))
        }

        fn source_file(&self) -> &SourceFileInfo {
            &self.source_file
        }

        fn mz_calibration(&self) -> Option<MzLookupTable> {
            self.calibration.clone()
        }
    }

    type TextFile = MsDataFile<NativeAdapter<TextVendorSource>>;

    const RUN: &str = "\
C 100.0 0.5 40
S 1 0.1 1 - -
T 2:3 3:1 10:5
T 3:1 4:5
S 2 0.2 1 0 103.0
P 50.0:1.0 75.5:0.0 90.25:8.0
S 1 0.3 1 - -
T 20:4
S 2 0.4 1 3 109.0
P 60.0:2.0
";

    fn write_run(dir: &Path, content: &str) -> io::Result<std::path::PathBuf> {
        let path = dir.join("run.txt");
        fs::File::create(&path)?.write_all(content.as_bytes())?;
        Ok(path)
    }

    #[test_log::test]
    fn test_native_static_and_dynamic() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;
        let path = write_run(dir.path(), RUN)?;
        let mut file = TextFile::open(&path)?;
        file.load_all_static_data(&LoadOptions::default())?;
        let scans = file.get_all_scans()?.to_vec();
        assert_eq!(scans.len(), 4);

        // Adjacent TOF bins are merged into one weighted peak
        assert_eq!(scans[0].spectrum().intensity(), &[10.0, 5.0]);
        assert_eq!(scans[0].native_id(), "controllerType=0 controllerNumber=1 scan=1");
        // The zero intensity peak is stripped
        assert_eq!(scans[1].spectrum().mz(), &[50.0, 90.25]);
        // A reported precursor of scan 0 is invalid and falls back to the nearest survey scan
        assert_eq!(scans[1].one_based_precursor_scan_number(), Some(1));
        assert_eq!(scans[3].one_based_precursor_scan_number(), Some(3));

        file.initiate_dynamic_connection()?;
        for scan in scans.iter() {
            let dynamic =
                file.get_one_based_scan_from_dynamic_connection(scan.one_based_scan_number(), None)?;
            assert_eq!(&dynamic, scan);
        }
        Ok(())
    }

    #[test_log::test]
    fn test_native_profile_rejected() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;
        let path = write_run(dir.path(), "S 1 0.1 1 - -\nP 1.0:1.0\nS 1 0.2 0 - -\nP 2.0:1.0\n")?;
        let mut file = TextFile::open(&path)?;
        match file.load_all_static_data(&LoadOptions::default()) {
            Err(MsDataFileError::UnsupportedRepresentation { scan_number, source }) => {
                assert_eq!(scan_number, 2);
                assert_eq!(
                    source,
                    RepresentationError::ProfileSpectrum(
                        "controllerType=0 controllerNumber=1 scan=2".into()
                    )
                );
            }
            other => panic!("Expected a profile rejection, got {other:?}"),
        }
        assert!(!file.is_loaded());
        Ok(())
    }

    #[test]
    fn test_tof_without_calibration_is_malformed() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;
        let path = write_run(dir.path(), "S 1 0.1 1 - -\nT 1:1\nS 1 0.2 1 - -\nP 2.0:1.0\n")?;
        let mut file = TextFile::open(&path)?;
        let numbers: Vec<u32> = file
            .get_all_scans()?
            .iter()
            .map(|s| s.one_based_scan_number())
            .collect();
        assert_eq!(numbers, vec![2]);

        let adapter = NativeAdapter::<TextVendorSource>::open(&path)?;
        assert_eq!(
            adapter.position_of_native_id("controllerType=0 controllerNumber=1 scan=2"),
            Some(1)
        );
        assert_eq!(adapter.position_of_native_id("scan=3"), None);
        assert_eq!(adapter.position_of_native_id("index=0"), Some(0));
        Ok(())
    }

    #[test_log::test]
    fn test_read_header_skips_signal() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;
        let path = write_run(
            dir.path(),
            "S 1 0.1 1 - -\nP 1.0:1.0\nS 0 0.2 1 - -\nP 2.0:1.0\nS 2 0.3 0 1 2.0\nP 2.0:1.0\nS 1 0.4 1 - -\nT 1:1\n",
        )?;
        let mut adapter = NativeAdapter::<TextVendorSource>::open(&path)?;
        assert_eq!(
            adapter.read_header(0)?,
            Some(ScanHeader {
                one_based_scan_number: 1,
                ms_order: 1
            })
        );
        assert_eq!(adapter.read_header(1)?, None);
        assert!(matches!(
            adapter.read_header(2),
            Err(MsDataFileError::UnsupportedRepresentation { scan_number: 3, .. })
        ));
        // TOF signal with no calibration to convert it
        assert_eq!(adapter.read_header(3)?, None);
        assert!(adapter.read_header(4).is_err());
        assert_eq!(adapter.source().signal_reads, 0);

        adapter.read_scan(0, None).map_err(|e| e.at_position(0))?;
        assert_eq!(adapter.source().signal_reads, 1);
        Ok(())
    }
}
