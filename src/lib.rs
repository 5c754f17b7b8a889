pub mod filter;
pub mod io;
pub mod meta;
pub mod params;
pub mod precursor;
pub mod spectrum;
pub mod tof;

pub use crate::filter::FilterConfig;
pub use crate::io::{LoadOptions, MsDataFile, MsDataFileError};
#[cfg(feature = "mzml")]
pub use crate::io::{open_data_file, MzMLFile};
pub use crate::meta::SourceFileInfo;
pub use crate::spectrum::{MzRange, Polarity, PrecursorInfo, ScanRecord, Spectrum};
pub use crate::tof::{MzLookupTable, TofMergeConfig, TofRawFrame};

pub use mzpeaks::Tolerance;
