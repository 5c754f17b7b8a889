//! The `<binaryDataArray>` payload: base64 text over optionally zlib
//! compressed little endian floats.
use std::fmt::Display;
use std::io::{self, prelude::*};

use base64_simd;
use bytemuck::Pod;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use thiserror::Error;

use crate::params::{ControlledVocabulary, Param};

pub type Bytes = Vec<u8>;

#[derive(Debug, Error)]
pub enum ArrayDecodingError {
    #[error("Failed to decode base64 text: {0}")]
    Base64(String),
    #[error("Failed to decompress array: {0}")]
    Decompression(#[from] io::Error),
    #[error("A buffer of {length} bytes does not hold whole {width} byte values")]
    TruncatedBuffer { length: usize, width: usize },
    #[error("The array does not declare its value type")]
    UnknownDataType,
}

/// The compression applied to an array's bytes before base64 encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinaryCompression {
    #[default]
    NoCompression,
    Zlib,
}

impl BinaryCompression {
    pub fn from_accession(accession: u32) -> Option<Self> {
        match accession {
            1000576 => Some(Self::NoCompression),
            1000574 => Some(Self::Zlib),
            _ => None,
        }
    }

    pub fn to_param(&self) -> Param {
        match self {
            Self::NoCompression => ControlledVocabulary::MS.param(1000576, "no compression"),
            Self::Zlib => ControlledVocabulary::MS.param(1000574, "zlib compression"),
        }
    }
}

/// The width of the values stored in an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArrayPrecision {
    Float32,
    #[default]
    Float64,
}

impl ArrayPrecision {
    pub fn from_accession(accession: u32) -> Option<Self> {
        match accession {
            1000521 => Some(Self::Float32),
            1000523 => Some(Self::Float64),
            _ => None,
        }
    }

    pub const fn width(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub fn to_param(&self) -> Param {
        match self {
            Self::Float32 => ControlledVocabulary::MS.param(1000521, "32-bit float"),
            Self::Float64 => ControlledVocabulary::MS.param(1000523, "64-bit float"),
        }
    }
}

/// The arrays a centroided spectrum is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArrayType {
    MZArray,
    IntensityArray,
    #[default]
    Unknown,
}

impl ArrayType {
    pub fn from_accession(accession: u32) -> Option<Self> {
        match accession {
            1000514 => Some(Self::MZArray),
            1000515 => Some(Self::IntensityArray),
            _ => None,
        }
    }

    pub fn to_param(&self) -> Option<Param> {
        match self {
            Self::MZArray => Some(
                ControlledVocabulary::MS
                    .param(1000514, "m/z array")
                    .with_unit(crate::params::Unit::MZ),
            ),
            Self::IntensityArray => Some(
                ControlledVocabulary::MS
                    .param(1000515, "intensity array")
                    .with_unit(crate::params::Unit::DetectorCounts),
            ),
            Self::Unknown => None,
        }
    }
}

impl Display for ArrayType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An undecoded `<binaryDataArray>` as read from the document
#[derive(Debug, Clone, Default)]
pub struct DataArray {
    pub name: ArrayType,
    pub data: Bytes,
    pub compression: BinaryCompression,
    pub precision: Option<ArrayPrecision>,
}

impl DataArray {
    /// Absorb a controlled vocabulary term from the array's description.
    /// Returns `false` for terms that do not describe the encoding or kind.
    pub fn fill_param(&mut self, param: &Param) -> bool {
        let Some(accession) = param.accession else {
            return false;
        };
        if let Some(compression) = BinaryCompression::from_accession(accession) {
            self.compression = compression;
        } else if let Some(precision) = ArrayPrecision::from_accession(accession) {
            self.precision = Some(precision);
        } else if let Some(name) = ArrayType::from_accession(accession) {
            self.name = name;
        } else {
            return false;
        }
        true
    }

    /// Decode the base64 text, decompress it and widen the values to `f64`
    pub fn decode(&self) -> Result<Vec<f64>, ArrayDecodingError> {
        let precision = self.precision.ok_or(ArrayDecodingError::UnknownDataType)?;
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        let bytestring = base64_simd::STANDARD
            .decode_type::<Bytes>(&self.data)
            .map_err(|e| ArrayDecodingError::Base64(e.to_string()))?;
        let bytestring = match self.compression {
            BinaryCompression::NoCompression => bytestring,
            BinaryCompression::Zlib => decompress_zlib(&bytestring)?,
        };
        match precision {
            ArrayPrecision::Float64 => Ok(cast_values::<f64>(&bytestring)?),
            ArrayPrecision::Float32 => Ok(cast_values::<f32>(&bytestring)?
                .into_iter()
                .map(|v| v as f64)
                .collect()),
        }
    }
}

fn cast_values<T: Pod>(bytestring: &[u8]) -> Result<Vec<T>, ArrayDecodingError> {
    let width = std::mem::size_of::<T>();
    if bytestring.len() % width != 0 {
        return Err(ArrayDecodingError::TruncatedBuffer {
            length: bytestring.len(),
            width,
        });
    }
    // The buffer may not be aligned for T, so copy value by value
    Ok(bytestring
        .chunks_exact(width)
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect())
}

pub fn compress_zlib(bytestring: &[u8]) -> io::Result<Bytes> {
    let result = Bytes::new();
    let mut compressor = ZlibEncoder::new(result, Compression::best());
    compressor.write_all(bytestring)?;
    compressor.finish()
}

pub fn decompress_zlib(bytestring: &[u8]) -> io::Result<Bytes> {
    let result = Bytes::new();
    let mut decompressor = ZlibDecoder::new(result);
    decompressor.write_all(bytestring)?;
    decompressor.finish()
}

/// Encode `values` as base64 text with the requested precision and compression
pub fn encode_array(
    values: &[f64],
    precision: ArrayPrecision,
    compression: BinaryCompression,
) -> io::Result<Bytes> {
    let bytestring: Bytes = match precision {
        ArrayPrecision::Float64 => bytemuck::cast_slice(values).to_vec(),
        ArrayPrecision::Float32 => {
            let narrowed: Vec<f32> = values.iter().map(|v| *v as f32).collect();
            bytemuck::cast_slice(&narrowed).to_vec()
        }
    };
    let bytestring = match compression {
        BinaryCompression::NoCompression => bytestring,
        BinaryCompression::Zlib => compress_zlib(&bytestring)?,
    };
    Ok(base64_simd::STANDARD.encode_type::<Bytes>(&bytestring))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_decode_arrays() -> io::Result<()> {
        let values = vec![100.25, 200.5, 1e-3, 5000.0];
        for compression in [BinaryCompression::NoCompression, BinaryCompression::Zlib] {
            let array = DataArray {
                name: ArrayType::MZArray,
                data: encode_array(&values, ArrayPrecision::Float64, compression)?,
                compression,
                precision: Some(ArrayPrecision::Float64),
            };
            assert_eq!(array.decode().unwrap(), values);
        }

        let array = DataArray {
            name: ArrayType::IntensityArray,
            data: encode_array(&values, ArrayPrecision::Float32, BinaryCompression::Zlib)?,
            compression: BinaryCompression::Zlib,
            precision: Some(ArrayPrecision::Float32),
        };
        let decoded = array.decode().unwrap();
        assert_eq!(decoded[0], 100.25);
        assert!((decoded[2] - 1e-3).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_decode_failures() {
        let array = DataArray {
            data: b"AAAA".to_vec(),
            ..Default::default()
        };
        assert!(matches!(array.decode(), Err(ArrayDecodingError::UnknownDataType)));

        let array = DataArray {
            // Three bytes
            data: b"AAAA".to_vec(),
            precision: Some(ArrayPrecision::Float64),
            ..Default::default()
        };
        assert!(matches!(
            array.decode(),
            Err(ArrayDecodingError::TruncatedBuffer { length: 3, width: 8 })
        ));
    }

    #[test]
    fn test_fill_param() {
        let mut array = DataArray::default();
        assert!(array.fill_param(&ControlledVocabulary::MS.param(1000574, "zlib compression")));
        assert!(array.fill_param(&ControlledVocabulary::MS.param(1000523, "64-bit float")));
        assert!(array.fill_param(&ControlledVocabulary::MS.param(1000514, "m/z array")));
        assert!(!array.fill_param(&ControlledVocabulary::MS.param(1000511, "ms level")));
        assert_eq!(array.name, ArrayType::MZArray);
        assert_eq!(array.compression, BinaryCompression::Zlib);
        assert_eq!(array.precision, Some(ArrayPrecision::Float64));
    }
}
