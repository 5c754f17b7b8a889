mod data_file;
pub mod infer_format;
#[cfg(feature = "mzml")]
pub mod mzml;
pub mod native;
mod offset_index;
pub mod tabular;
pub mod traits;
mod utils;

pub use crate::io::data_file::{LoadOptions, MsDataFile};
#[cfg(feature = "mzml")]
pub use crate::io::data_file::MzMLFile;
#[cfg(feature = "mzml")]
pub use crate::io::infer_format::open_data_file;
pub use crate::io::infer_format::{infer_format, infer_from_path, MassSpectrometryFormat};
#[cfg(feature = "mzml")]
pub use crate::io::mzml::{MzMLReader, MzMLWriter, MzMLWriterOptions};
pub use crate::io::native::{
    NativeAdapter, NativeScanHeader, NativeVendorSource, RawScan, RawScanData, RawScanKind,
};
pub use crate::io::offset_index::OffsetIndex;
pub use crate::io::tabular::{DelimitedResultFile, ResultFile, ResultFileError, ResultRecord};
pub use crate::io::traits::{FormatAdapter, MsDataFileError, RepresentationError, ScanDecodeError};
#[cfg(feature = "checksum")]
pub use crate::io::utils::checksum_file;
pub use crate::io::utils::ChecksumKind;
