use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::filter::FilterConfig;
use crate::meta::SourceFileInfo;
use crate::precursor::ScanHeader;
use crate::spectrum::{ScanRecord, ScanRecordError};

use super::infer_format::MassSpectrometryFormat;
#[cfg(feature = "mzml")]
use super::mzml::MzMLParserError;

pub trait SeekRead: io::Read + io::Seek {}
impl<T: io::Read + io::Seek> SeekRead for T {}

/// A spectrum representation that the consumer can not work with
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepresentationError {
    #[error("Spectrum {0} is a profile spectrum, but only centroid spectra are supported")]
    ProfileSpectrum(String),
}

/// The outcome of failing to turn one scan's payload into a [`ScanRecord`]
#[derive(Debug, Error)]
pub enum ScanDecodeError {
    /// The scan is unusable but the rest of the file is not affected
    #[error("Malformed scan: {0}")]
    Malformed(String),
    #[error(transparent)]
    Unsupported(#[from] RepresentationError),
    #[error("Failed to read scan: {0}")]
    Fatal(#[from] io::Error),
}

impl ScanDecodeError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    /// Attach the location of the failed scan
    pub fn at_position(self, position: usize) -> MsDataFileError {
        match self {
            Self::Malformed(reason) => MsDataFileError::MalformedScan { position, reason },
            Self::Unsupported(source) => MsDataFileError::UnsupportedRepresentation {
                scan_number: position as u32 + 1,
                source,
            },
            Self::Fatal(e) => MsDataFileError::IOError(e),
        }
    }
}

/// All the ways that accessing an [`MsDataFile`](super::MsDataFile) can fail
#[derive(Debug, Error)]
pub enum MsDataFileError {
    #[error("The data file {0} does not exist")]
    MissingSource(PathBuf),
    #[error("The scan at position {position} could not be decoded: {reason}")]
    MalformedScan { position: usize, reason: String },
    #[error("No MS{expected_order} scan precedes scan {scan_number}")]
    PrecursorNotFound { scan_number: u32, expected_order: u8 },
    #[error("Scan {scan_number} has an unsupported representation")]
    UnsupportedRepresentation {
        scan_number: u32,
        #[source]
        source: RepresentationError,
    },
    #[error("{} errors occurred while loading, the first was: {}", .0.len(), .0.first().map(|e| e.to_string()).unwrap_or_default())]
    Aggregated(Vec<MsDataFileError>),
    #[error("Scan {0} was not found")]
    ScanNotFound(u32),
    #[error("The dynamic connection is not open")]
    ConnectionClosed,
    #[error("Scan number {0} occurs more than once")]
    DuplicateScanNumber(u32),
    #[error("Scan number {next} follows scan number {previous}")]
    ScanNumbersOutOfOrder { previous: u32, next: u32 },
    #[error("No reader is available for the {0:?} format")]
    UnsupportedFormat(MassSpectrometryFormat),
    #[error(transparent)]
    ScanError(#[from] ScanRecordError),
    #[cfg(feature = "mzml")]
    #[error("An mzML error occurred: {0}")]
    MzMLError(#[from] MzMLParserError),
    #[error("An IO error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl MsDataFileError {
    /// Collapse a list of errors into one, keeping a lone error as it is
    pub fn aggregate(mut errors: Vec<MsDataFileError>) -> Option<MsDataFileError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregated(errors)),
        }
    }
}

impl From<MsDataFileError> for io::Error {
    fn from(value: MsDataFileError) -> Self {
        match value {
            MsDataFileError::IOError(e) => e,
            MsDataFileError::MissingSource(_) | MsDataFileError::ScanNotFound(_) => {
                io::Error::new(io::ErrorKind::NotFound, value)
            }
            MsDataFileError::UnsupportedFormat(_) => io::Error::new(io::ErrorKind::Unsupported, value),
            _ => io::Error::new(io::ErrorKind::InvalidData, value),
        }
    }
}

/**
The capabilities a file format must provide to back an [`MsDataFile`](super::MsDataFile).

Reading is split in two. [`FormatAdapter::read_payload`] does the sequential I/O
for one scan and [`FormatAdapter::decode`] turns that payload into a
[`ScanRecord`]. Decoding only borrows the adapter immutably, so many payloads
can be decoded at once.

Positions are zero-based offsets in file order. The scan at position `i` has
the one-based scan number `i + 1`.
*/
pub trait FormatAdapter: Sized + Send + Sync {
    /// The undecoded form of one scan
    type Payload: Send;

    /// Open the source at `path`
    fn open(path: &Path) -> Result<Self, MsDataFileError>;

    fn source_file(&self) -> &SourceFileInfo;

    /// The number of scans in the source
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_payload(&mut self, position: usize) -> Result<Self::Payload, ScanDecodeError>;

    /// Read every payload in file order
    fn read_all_payloads(&mut self) -> Vec<Result<Self::Payload, ScanDecodeError>> {
        (0..self.len()).map(|i| self.read_payload(i)).collect()
    }

    fn decode(
        &self,
        position: usize,
        payload: Self::Payload,
        filter: Option<&FilterConfig>,
    ) -> Result<ScanRecord, ScanDecodeError>;

    /// Read and decode the scan at `position`
    fn read_scan(
        &mut self,
        position: usize,
        filter: Option<&FilterConfig>,
    ) -> Result<ScanRecord, ScanDecodeError> {
        let payload = self.read_payload(position)?;
        self.decode(position, payload, filter)
    }

    fn position_of_native_id(&self, native_id: &str) -> Option<usize>;

    fn position_of_scan_number(&self, scan_number: u32) -> Option<usize> {
        let position = (scan_number as usize).checked_sub(1)?;
        (position < self.len()).then_some(position)
    }

    /// Read only what the precursor resolver needs about the scan at `position`.
    /// Malformed scans are not part of the scan sequence and yield `None`.
    fn read_header(&mut self, position: usize) -> Result<Option<ScanHeader>, MsDataFileError> {
        match self.read_scan(position, None) {
            Ok(scan) => Ok(Some(ScanHeader::from(&scan))),
            Err(e) if e.is_recoverable() => Ok(None),
            Err(e) => Err(e.at_position(position)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_aggregate_errors() {
        assert!(MsDataFileError::aggregate(Vec::new()).is_none());
        let single = MsDataFileError::aggregate(vec![MsDataFileError::ScanNotFound(3)]);
        assert!(matches!(single, Some(MsDataFileError::ScanNotFound(3))));
        let many = MsDataFileError::aggregate(vec![
            MsDataFileError::ScanNotFound(3),
            MsDataFileError::ConnectionClosed,
        ])
        .unwrap();
        match many {
            MsDataFileError::Aggregated(errors) => assert_eq!(errors.len(), 2),
            e => panic!("Expected an aggregate, got {e}"),
        }
    }

    #[test]
    fn test_root_cause_is_inspectable() {
        use std::error::Error;
        let err = ScanDecodeError::Unsupported(RepresentationError::ProfileSpectrum("scan=4".into()))
            .at_position(3);
        assert!(matches!(
            err,
            MsDataFileError::UnsupportedRepresentation { scan_number: 4, .. }
        ));
        let source = err.source().unwrap();
        assert!(source.to_string().contains("scan=4"));
    }
}
