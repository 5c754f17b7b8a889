//! Implements a parser for the PSI-MS mzML and indexedmzML XML file formats
//! for representing centroided mass spectra, and a writer for the same.

mod adapter;
pub mod binary;
mod reader;
mod reading_shared;
mod writer;

pub use crate::io::mzml::adapter::MzMLAdapter;
pub use crate::io::mzml::binary::{
    ArrayDecodingError, ArrayPrecision, ArrayType, BinaryCompression, DataArray,
};
pub use crate::io::mzml::reader::{MzMLReader, MzMLSpectrumBuilder, PrecursorEntry};
pub use crate::io::mzml::reading_shared::{
    FileMetadataBuilder, MzMLIndexingError, MzMLParserError, MzMLParserState, ParserResult,
};
pub use crate::io::mzml::writer::{
    MzMLWriter, MzMLWriterError, MzMLWriterOptions, MzMLWriterState, WriterResult,
    MONOISOTOPIC_MZ_PARAM,
};
