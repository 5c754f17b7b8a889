use std::fs;
use std::io;
use std::path::Path;

use log::{debug, trace};

use crate::filter::{filter_for_scan, FilterConfig};
use crate::io::traits::{FormatAdapter, MsDataFileError, RepresentationError, ScanDecodeError};
use crate::io::{checksum_file, ChecksumKind};
use crate::meta::{SourceFileFormat, SourceFileInfo};
use crate::precursor::ScanHeader;
use crate::spectrum::{
    DissociationType, PrecursorInfo, ScanRecord, Spectrum, ZERO_EQUIVALENT_INTENSITY,
};

use super::binary::ArrayType;
use super::reader::{MzMLReader, MzMLSpectrumBuilder};
use super::reading_shared::MzMLParserError;

/// Backs an [`MsDataFile`](crate::io::MsDataFile) with an mzML document
pub struct MzMLAdapter {
    reader: MzMLReader<fs::File>,
    source_file: SourceFileInfo,
}

impl MzMLAdapter {
    pub fn reader(&self) -> &MzMLReader<fs::File> {
        &self.reader
    }
}

fn decode_array(
    builder: &MzMLSpectrumBuilder,
    kind: ArrayType,
) -> Result<Vec<f64>, ScanDecodeError> {
    let array = builder.array(kind).ok_or_else(|| {
        ScanDecodeError::Malformed(format!("{} has no {kind}", builder.id))
    })?;
    array
        .decode()
        .map_err(|e| ScanDecodeError::Malformed(format!("{}: {kind}: {e}", builder.id)))
}

/// Everything [`FormatAdapter::decode`] rejects a scan for short of decoding its
/// binary data, giving the MS level of a usable scan
fn check_header(builder: &MzMLSpectrumBuilder) -> Result<u8, ScanDecodeError> {
    if let Some(reason) = builder.malformed.as_ref() {
        return Err(ScanDecodeError::Malformed(format!("{}: {reason}", builder.id)));
    }
    match builder.is_centroid {
        Some(true) => {}
        Some(false) => return Err(RepresentationError::ProfileSpectrum(builder.id.clone()).into()),
        None => {
            return Err(ScanDecodeError::Malformed(format!(
                "{} does not state whether it is centroided",
                builder.id
            )))
        }
    }
    let ms_level = builder.ms_level.ok_or_else(|| {
        ScanDecodeError::Malformed(format!("{} has no MS level", builder.id))
    })?;
    for kind in [ArrayType::MZArray, ArrayType::IntensityArray] {
        match builder.array(kind) {
            Some(array) if array.precision.is_some() => {}
            Some(_) => {
                return Err(ScanDecodeError::Malformed(format!(
                    "{}: {kind} does not declare its value type",
                    builder.id
                )))
            }
            None => {
                return Err(ScanDecodeError::Malformed(format!("{} has no {kind}", builder.id)))
            }
        }
    }
    Ok(ms_level)
}

fn precursor_info(builder: &MzMLSpectrumBuilder) -> Option<PrecursorInfo> {
    let entry = builder.precursor()?;
    Some(PrecursorInfo {
        selected_ion_mz: entry.selected_ion_mz,
        selected_ion_charge: entry.selected_ion_charge,
        selected_ion_intensity: entry.selected_ion_intensity,
        isolation_mz: entry.isolation_target,
        isolation_width: entry.isolation_width(),
        dissociation_type: DissociationType::from_terms(&entry.activation),
        monoisotopic_guess_mz: builder.monoisotopic_mz,
        monoisotopic_guess_intensity: None,
    })
}

impl FormatAdapter for MzMLAdapter {
    type Payload = MzMLSpectrumBuilder;

    fn open(path: &Path) -> Result<Self, MsDataFileError> {
        let reader = MzMLReader::open_path(path)?;
        let source_file = match reader.source_files().first() {
            Some(source_file) => source_file.clone(),
            None => {
                debug!("{} declares no source file, describing it instead", path.display());
                let checksum = checksum_file(path, ChecksumKind::Sha1)?;
                SourceFileInfo {
                    file_format: SourceFileFormat::MzML,
                    ..SourceFileInfo::from_path(path)
                }
                .with_checksum(checksum, ChecksumKind::Sha1)
            }
        };
        Ok(Self {
            reader,
            source_file,
        })
    }

    fn source_file(&self) -> &SourceFileInfo {
        &self.source_file
    }

    fn len(&self) -> usize {
        self.reader.len()
    }

    fn read_payload(&mut self, position: usize) -> Result<Self::Payload, ScanDecodeError> {
        match self.reader.get_spectrum_by_index(position) {
            Ok(builder) => Ok(builder),
            Err(MzMLParserError::IOError(_, e)) => Err(ScanDecodeError::Fatal(e)),
            Err(MzMLParserError::EntryNotFound(id)) => Err(ScanDecodeError::Fatal(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No spectrum at position {id}"),
            ))),
            Err(e) => Err(ScanDecodeError::Malformed(e.to_string())),
        }
    }

    fn decode(
        &self,
        position: usize,
        payload: Self::Payload,
        filter: Option<&FilterConfig>,
    ) -> Result<ScanRecord, ScanDecodeError> {
        let ms_level = check_header(&payload)?;

        let mzs = decode_array(&payload, ArrayType::MZArray)?;
        let intensities = decode_array(&payload, ArrayType::IntensityArray)?;
        let spectrum = Spectrum::new(mzs, intensities)
            .map_err(|e| ScanDecodeError::Malformed(format!("{}: {e}", payload.id)))?
            .strip_zero_intensity(ZERO_EQUIVALENT_INTENSITY);
        let spectrum = filter_for_scan(spectrum, filter, ms_level, payload.scan_window);
        trace!("Decoded {} with {} peaks", payload.id, spectrum.size());

        let precursor = if ms_level > 1 {
            precursor_info(&payload)
        } else {
            None
        };
        let precursor_ref = payload.precursor().and_then(|p| p.spectrum_ref.clone());

        let mut scan = ScanRecord::new(
            spectrum,
            position as u32 + 1,
            ms_level,
            true,
            payload.polarity,
            payload.retention_time.unwrap_or(f64::NAN),
        )
        .with_native_id(payload.id)
        .with_scan_window(payload.scan_window)
        .with_scan_filter(payload.scan_filter)
        .with_mz_analyzer(payload.mz_analyzer)
        .with_injection_time(payload.injection_time);
        if let Some(tic) = payload.total_ion_current {
            scan = scan.with_total_ion_current(tic);
        }
        if let Some(precursor) = precursor {
            scan = scan
                .with_precursor(precursor)
                .with_native_precursor_id(precursor_ref);
        }
        Ok(scan)
    }

    fn position_of_native_id(&self, native_id: &str) -> Option<usize> {
        self.reader.get_index().index_of(native_id)
    }

    /// Parses the scan's XML but leaves its binary arrays encoded. A scan
    /// whose arrays are present but corrupt still yields a header here and is
    /// only rejected once it is decoded itself.
    fn read_header(&mut self, position: usize) -> Result<Option<ScanHeader>, MsDataFileError> {
        let checked = self
            .read_payload(position)
            .and_then(|payload| check_header(&payload));
        match checked {
            Ok(ms_order) => Ok(Some(ScanHeader {
                one_based_scan_number: position as u32 + 1,
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
    use std::io::Write;

    const PROFILE_AND_BROKEN: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<mzML xmlns="http://psi.hupo.org/ms/mzml" version="1.1.0">
  <run id="r1">
    <spectrumList count="4">
      <spectrum index="0" id="scan=1" defaultArrayLength="0">
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="1"/>
        <cvParam cvRef="MS" accession="MS:1000128" name="profile spectrum" value=""/>
      </spectrum>
      <spectrum index="1" id="scan=2" defaultArrayLength="0">
        <cvParam cvRef="MS" accession="MS:1000127" name="centroid spectrum" value=""/>
        <binaryDataArrayList count="0">
        </binaryDataArrayList>
      </spectrum>
      <spectrum index="2" id="scan=3" defaultArrayLength="0">
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="1"/>
        <cvParam cvRef="MS" accession="MS:1000127" name="centroid spectrum" value=""/>
        <binaryDataArrayList count="0">
        </binaryDataArrayList>
      </spectrum>
      <spectrum index="3" id="scan=4" defaultArrayLength="1">
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="2"/>
        <cvParam cvRef="MS" accession="MS:1000127" name="centroid spectrum" value=""/>
        <binaryDataArrayList count="2">
          <binaryDataArray encodedLength="3">
            <cvParam cvRef="MS" accession="MS:1000523" name="64-bit float" value=""/>
            <cvParam cvRef="MS" accession="MS:1000576" name="no compression" value=""/>
            <cvParam cvRef="MS" accession="MS:1000514" name="m/z array" value=""/>
            <binary>!!!</binary>
          </binaryDataArray>
          <binaryDataArray encodedLength="3">
            <cvParam cvRef="MS" accession="MS:1000523" name="64-bit float" value=""/>
            <cvParam cvRef="MS" accession="MS:1000576" name="no compression" value=""/>
            <cvParam cvRef="MS" accession="MS:1000515" name="intensity array" value=""/>
            <binary>!!!</binary>
          </binaryDataArray>
        </binaryDataArrayList>
      </spectrum>
    </spectrumList>
  </run>
</mzML>
"#;

    fn write_fixture(dir: &Path) -> io::Result<std::path::PathBuf> {
        let path = dir.join("fixture.mzML");
        let mut handle = fs::File::create(&path)?;
        handle.write_all(PROFILE_AND_BROKEN.as_bytes())?;
        Ok(path)
    }

    #[test_log::test]
    fn test_decode_rejections() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;
        let path = write_fixture(dir.path())?;
        let mut adapter = MzMLAdapter::open(&path)?;
        assert_eq!(adapter.len(), 4);
        assert_eq!(adapter.source_file().file_format, SourceFileFormat::MzML);
        assert_eq!(adapter.source_file().name, "fixture.mzML");
        assert!(adapter.source_file().checksum.is_some());

        let err = adapter.read_scan(0, None).unwrap_err();
        assert!(matches!(
            err,
            ScanDecodeError::Unsupported(RepresentationError::ProfileSpectrum(ref id)) if id == "scan=1"
        ));
        assert!(!err.is_recoverable());

        let err = adapter.read_scan(1, None).unwrap_err();
        assert!(err.is_recoverable(), "{err}");

        let err = adapter.read_scan(2, None).unwrap_err();
        assert!(matches!(err, ScanDecodeError::Malformed(ref m) if m.contains("MZArray")));

        assert_eq!(adapter.position_of_native_id("scan=3"), Some(2));
        assert!(adapter.read_payload(7).is_err());
        Ok(())
    }

    #[test_log::test]
    fn test_read_header_skips_binary_data() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;
        let path = write_fixture(dir.path())?;
        let mut adapter = MzMLAdapter::open(&path)?;

        assert!(matches!(
            adapter.read_header(0),
            Err(MsDataFileError::UnsupportedRepresentation { scan_number: 1, .. })
        ));
        assert_eq!(adapter.read_header(1)?, None);
        assert_eq!(adapter.read_header(2)?, None);
        assert_eq!(
            adapter.read_header(3)?,
            Some(ScanHeader {
                one_based_scan_number: 4,
                ms_order: 2
            })
        );
        // The arrays of scan 4 are not valid base64
        let err = adapter.read_scan(3, None).unwrap_err();
        assert!(matches!(err, ScanDecodeError::Malformed(ref m) if m.contains("scan=4")));
        assert!(adapter.read_header(9).is_err());
        Ok(())
    }
}
