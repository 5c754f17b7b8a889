//! Uniform access to the scans of a mass spectrometry data file, either by
//! decoding the whole file up front or by reading single scans on demand.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use mzpeaks::Tolerance;

#[cfg(feature = "parallelism")]
use rayon::prelude::*;

use crate::filter::FilterConfig;
use crate::meta::SourceFileInfo;
use crate::precursor::{self, ScanHeader, ScanHeaderSource};
use crate::spectrum::ScanRecord;

use super::traits::{FormatAdapter, MsDataFileError, ScanDecodeError};
use super::utils::require_source;
#[cfg(feature = "mzml")]
use super::mzml::{MzMLAdapter, MzMLWriter, MzMLWriterOptions};

/// How a static load decodes the file
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadOptions {
    /// Applied to every scan whose MS order the configuration covers
    pub filter: Option<FilterConfig>,
    /// The number of decoding threads, 0 for the thread pool's default
    pub max_threads: usize,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }
}

/// Reads headers for the precursor resolver through an open adapter, decoding
/// each position at most once
struct AdapterHeaders<'a, A: FormatAdapter> {
    adapter: &'a mut A,
    cache: HashMap<usize, Option<ScanHeader>>,
}

impl<'a, A: FormatAdapter> AdapterHeaders<'a, A> {
    fn new(adapter: &'a mut A) -> Self {
        Self {
            adapter,
            cache: HashMap::new(),
        }
    }
}

impl<A: FormatAdapter> ScanHeaderSource for AdapterHeaders<'_, A> {
    type Error = MsDataFileError;

    fn header_at(&mut self, position: usize) -> Result<Option<ScanHeader>, Self::Error> {
        if let Some(header) = self.cache.get(&position) {
            return Ok(*header);
        }
        let header = self.adapter.read_header(position)?;
        self.cache.insert(position, header);
        Ok(header)
    }

    fn position_of_native_id(&self, native_id: &str) -> Option<usize> {
        self.adapter.position_of_native_id(native_id)
    }

    fn position_of_scan_number(&self, scan_number: u32) -> Option<usize> {
        self.adapter.position_of_scan_number(scan_number)
    }
}

/**
A mass spectrometry data file backed by a [`FormatAdapter`].

The file starts out unloaded. [`MsDataFile::load_all_static_data`] decodes every
scan into memory, while [`MsDataFile::initiate_dynamic_connection`] opens an
exclusive handle that [`MsDataFile::get_one_based_scan_from_dynamic_connection`]
reads single scans through. The two are independent of each other.

Query methods that need the scans trigger a static load with the file's
[`LoadOptions`] if one has not happened yet.
*/
pub struct MsDataFile<A: FormatAdapter> {
    path: PathBuf,
    options: LoadOptions,
    scans: Option<Vec<ScanRecord>>,
    source_file: Option<SourceFileInfo>,
    connection: Option<A>,
}

impl<A: FormatAdapter> MsDataFile<A> {
    /// Refer to the data file at `path` without touching it
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options: LoadOptions::default(),
            scans: None,
            source_file: None,
            connection: None,
        }
    }

    /// Refer to the data file at `path`, which must exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MsDataFileError> {
        let path = path.as_ref();
        require_source(path).map_err(|_| MsDataFileError::MissingSource(path.to_path_buf()))?;
        Ok(Self::new(path))
    }

    /// Set the options used by implicit static loads
    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.scans.is_some()
    }

    fn open_adapter(&self) -> Result<A, MsDataFileError> {
        require_source(&self.path).map_err(|_| MsDataFileError::MissingSource(self.path.clone()))?;
        A::open(&self.path)
    }

    /// Decode every scan in the file, replacing any scans loaded before.
    ///
    /// Malformed scans are skipped and logged. All other per-scan failures are
    /// collected and reported together once every scan has been attempted.
    pub fn load_all_static_data(&mut self, options: &LoadOptions) -> Result<(), MsDataFileError> {
        let mut adapter = self.open_adapter()?;
        let payloads = adapter.read_all_payloads();
        let decoded = decode_payloads(&adapter, payloads, options.filter.as_ref(), options.max_threads)?;

        let mut scans = Vec::with_capacity(decoded.len());
        let mut errors = Vec::new();
        let mut skipped = 0usize;
        for (position, result) in decoded.into_iter().enumerate() {
            match result {
                Ok(scan) => scans.push(scan),
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping the scan at position {position}: {e}");
                    skipped += 1;
                }
                Err(e) => errors.push(e.at_position(position)),
            }
        }
        if let Some(err) = MsDataFileError::aggregate(errors) {
            return Err(err);
        }

        check_scan_order(&scans)?;

        precursor::resolve_all(&mut scans);
        debug!(
            "Loaded {} scans from {} ({skipped} skipped)",
            scans.len(),
            self.path.display()
        );
        self.source_file = Some(adapter.source_file().clone());
        self.scans = Some(scans);
        Ok(())
    }

    fn ensure_loaded(&mut self) -> Result<&[ScanRecord], MsDataFileError> {
        if self.scans.is_none() {
            let options = self.options;
            self.load_all_static_data(&options)?;
        }
        Ok(self.scans.as_deref().unwrap_or_default())
    }

    /// Open the exclusive handle used for single scan reads, reusing one that
    /// is already open
    pub fn initiate_dynamic_connection(&mut self) -> Result<(), MsDataFileError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let adapter = self.open_adapter()?;
        if self.source_file.is_none() {
            self.source_file = Some(adapter.source_file().clone());
        }
        self.connection = Some(adapter);
        Ok(())
    }

    pub fn has_dynamic_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Read and decode one scan through the dynamic connection. The result is
    /// identical to the same scan from a static load with the same filter.
    pub fn get_one_based_scan_from_dynamic_connection(
        &mut self,
        scan_number: u32,
        filter: Option<&FilterConfig>,
    ) -> Result<ScanRecord, MsDataFileError> {
        let adapter = self
            .connection
            .as_mut()
            .ok_or(MsDataFileError::ConnectionClosed)?;
        let position = adapter
            .position_of_scan_number(scan_number)
            .ok_or(MsDataFileError::ScanNotFound(scan_number))?;
        let mut scan = adapter
            .read_scan(position, filter)
            .map_err(|e| e.at_position(position))?;
        if scan.ms_order() > 1 {
            let mut headers = AdapterHeaders::new(adapter);
            let link = precursor::resolve_precursor(&mut headers, position, &scan)?;
            scan.set_one_based_precursor_scan_number(link);
        }
        Ok(scan)
    }

    /// Release the dynamic connection, if one is open
    pub fn close_dynamic_connection(&mut self) {
        if self.connection.take().is_some() {
            debug!("Closed the connection to {}", self.path.display());
        }
    }

    /// The file the scans were acquired into, once the source has been opened
    pub fn source_file(&self) -> Option<&SourceFileInfo> {
        self.source_file.as_ref()
    }

    pub fn num_spectra(&mut self) -> Result<usize, MsDataFileError> {
        Ok(self.ensure_loaded()?.len())
    }

    pub fn get_all_scans(&mut self) -> Result<&[ScanRecord], MsDataFileError> {
        self.ensure_loaded()
    }

    pub fn get_ms1_scans(&mut self) -> Result<Vec<&ScanRecord>, MsDataFileError> {
        Ok(self
            .ensure_loaded()?
            .iter()
            .filter(|s| s.ms_order() == 1)
            .collect())
    }

    pub fn get_one_based_scan(&mut self, scan_number: u32) -> Result<&ScanRecord, MsDataFileError> {
        let scans = self.ensure_loaded()?;
        scans
            .binary_search_by_key(&scan_number, |s| s.one_based_scan_number())
            .map(|i| &scans[i])
            .map_err(|_| MsDataFileError::ScanNotFound(scan_number))
    }

    /// The scans whose retention time lies within `[start, end]` minutes
    pub fn get_ms_scans_in_time_range(
        &mut self,
        start: f64,
        end: f64,
    ) -> Result<Vec<&ScanRecord>, MsDataFileError> {
        Ok(self
            .ensure_loaded()?
            .iter()
            .filter(|s| s.retention_time() >= start && s.retention_time() <= end)
            .collect())
    }

    /// The scans numbered `start` through `end`, inclusive
    pub fn get_ms_scans_in_index_range(
        &mut self,
        start: u32,
        end: u32,
    ) -> Result<Vec<&ScanRecord>, MsDataFileError> {
        Ok(self
            .ensure_loaded()?
            .iter()
            .filter(|s| (start..=end).contains(&s.one_based_scan_number()))
            .collect())
    }

    /// The number of the scan acquired closest to `retention_time`. Ties go to
    /// the earlier scan and scans with no retention time are ignored.
    pub fn get_closest_one_based_spectrum_number(
        &mut self,
        retention_time: f64,
    ) -> Result<Option<u32>, MsDataFileError> {
        Ok(self
            .ensure_loaded()?
            .iter()
            .filter(|s| !s.retention_time().is_nan())
            .min_by(|a, b| {
                let da = (a.retention_time() - retention_time).abs();
                let db = (b.retention_time() - retention_time).abs();
                da.total_cmp(&db)
            })
            .map(|s| s.one_based_scan_number()))
    }

    fn precursor_position(scans: &[ScanRecord], index: usize) -> Result<usize, MsDataFileError> {
        let scan = &scans[index];
        let not_found = || MsDataFileError::PrecursorNotFound {
            scan_number: scan.one_based_scan_number(),
            expected_order: scan.ms_order().saturating_sub(1),
        };
        let precursor_number = scan.one_based_precursor_scan_number().ok_or_else(not_found)?;
        scans
            .binary_search_by_key(&precursor_number, |s| s.one_based_scan_number())
            .map_err(|_| not_found())
    }

    /// The resolved precursor scan of the fragmentation scan `scan_number`
    pub fn precursor_of(&mut self, scan_number: u32) -> Result<&ScanRecord, MsDataFileError> {
        let scans = self.ensure_loaded()?;
        let index = scans
            .binary_search_by_key(&scan_number, |s| s.one_based_scan_number())
            .map_err(|_| MsDataFileError::ScanNotFound(scan_number))?;
        if scans[index].ms_order() < 2 {
            return Err(crate::spectrum::ScanRecordError::NotAFragmentationScan(scan_number).into());
        }
        let position = Self::precursor_position(scans, index)?;
        Ok(&scans[position])
    }

    /// Snap the selected ion of every fragmentation scan to the nearest peak of
    /// its precursor spectrum, along with the monoisotopic guess when there is
    /// one. The isolation target is the query when known, the selected ion m/z
    /// otherwise.
    pub fn refine_selected_ions(&mut self) -> Result<(), MsDataFileError> {
        self.ensure_loaded()?;
        let Some(scans) = self.scans.as_mut() else {
            return Ok(());
        };
        // Nothing is written back until every scan has been refined
        let loaded: &[ScanRecord] = scans;
        let mut refined = Vec::new();
        for (index, scan) in loaded.iter().enumerate() {
            if scan.ms_order() < 2 || scan.precursor().is_none() {
                continue;
            }
            let position = Self::precursor_position(loaded, index)?;
            refined.push((index, scan.refined_precursor(loaded[position].spectrum())?));
        }
        for (index, precursor) in refined {
            scans[index].replace_precursor(precursor);
        }
        Ok(())
    }

    /// Sum the intensity within `tolerance` of `mz` in every scan of
    /// `ms_order`, giving `(retention time, intensity)` points in file order
    pub fn extract_ion_chromatogram(
        &mut self,
        mz: f64,
        tolerance: Tolerance,
        ms_order: u8,
    ) -> Result<Vec<(f64, f64)>, MsDataFileError> {
        Ok(self
            .ensure_loaded()?
            .iter()
            .filter(|s| s.ms_order() == ms_order)
            .map(|s| (s.retention_time(), s.spectrum().sum_intensity_within(mz, tolerance)))
            .collect())
    }

    /// Write the loaded scans out as mzML
    #[cfg(feature = "mzml")]
    pub fn write_mzml<P: AsRef<Path>>(
        &mut self,
        path: P,
        options: MzMLWriterOptions,
    ) -> Result<(), MsDataFileError> {
        self.ensure_loaded()?;
        let handle = fs::File::create(path.as_ref())?;
        let mut writer = MzMLWriter::with_options(handle, options);
        if let Some(source_file) = self.source_file.as_ref() {
            writer.source_files.push(source_file.clone());
        }
        let scans = self.scans.as_deref().unwrap_or_default();
        writer.write_all(scans.iter()).map_err(io::Error::from)?;
        writer.close().map_err(io::Error::from)?;
        Ok(())
    }
}

#[cfg(feature = "mzml")]
pub type MzMLFile = MsDataFile<MzMLAdapter>;

/// Scan number lookups binary search the loaded scans, so their numbers must
/// strictly increase in file order
fn check_scan_order(scans: &[ScanRecord]) -> Result<(), MsDataFileError> {
    for pair in scans.windows(2) {
        let previous = pair[0].one_based_scan_number();
        let next = pair[1].one_based_scan_number();
        if next == previous {
            return Err(MsDataFileError::DuplicateScanNumber(next));
        } else if next < previous {
            return Err(MsDataFileError::ScanNumbersOutOfOrder { previous, next });
        }
    }
    Ok(())
}

#[cfg(feature = "parallelism")]
fn decode_payloads<A: FormatAdapter>(
    adapter: &A,
    payloads: Vec<Result<A::Payload, ScanDecodeError>>,
    filter: Option<&FilterConfig>,
    max_threads: usize,
) -> Result<Vec<Result<ScanRecord, ScanDecodeError>>, MsDataFileError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let mut decoded = Vec::with_capacity(payloads.len());
    pool.install(|| {
        payloads
            .into_par_iter()
            .enumerate()
            .map(|(position, payload)| {
                payload.and_then(|payload| adapter.decode(position, payload, filter))
            })
            .collect_into_vec(&mut decoded)
    });
    Ok(decoded)
}

#[cfg(not(feature = "parallelism"))]
fn decode_payloads<A: FormatAdapter>(
    adapter: &A,
    payloads: Vec<Result<A::Payload, ScanDecodeError>>,
    filter: Option<&FilterConfig>,
    _max_threads: usize,
) -> Result<Vec<Result<ScanRecord, ScanDecodeError>>, MsDataFileError> {
    Ok(payloads
        .into_iter()
        .enumerate()
        .map(|(position, payload)| {
            payload.and_then(|payload| adapter.decode(position, payload, filter))
        })
        .collect())
}
