//! The in-memory data model for spectra and the scans that carry them.
pub mod peaks;
pub mod scan;
pub mod scan_properties;

pub use crate::spectrum::peaks::{Spectrum, SpectrumError, ZERO_EQUIVALENT_INTENSITY};
pub use crate::spectrum::scan::{ScanRecord, ScanRecordError};
pub use crate::spectrum::scan_properties::*;
