use std::fs;
use std::io::{self, prelude::*, BufReader, SeekFrom};
use std::path::Path;

#[cfg(feature = "mzml")]
use super::data_file::MzMLFile;
#[cfg(feature = "mzml")]
use super::traits::MsDataFileError;

/// Mass spectrometry file formats that [`mzaccess`](crate) recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MassSpectrometryFormat {
    MzML,
    ThermoRaw,
    BrukerTdf,
    Unknown,
}

impl MassSpectrometryFormat {
    /// Whether reading this format needs a native vendor backend
    pub fn is_vendor_format(&self) -> bool {
        matches!(self, Self::ThermoRaw | Self::BrukerTdf)
    }
}

/// Given a path, infer the file format from its extension. Bruker TDF
/// acquisitions are `.d` directories.
pub fn infer_from_path<P: AsRef<Path>>(path: P) -> MassSpectrometryFormat {
    let path = path.as_ref();
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("mzml") => MassSpectrometryFormat::MzML,
        Some("raw") => MassSpectrometryFormat::ThermoRaw,
        Some("d") => MassSpectrometryFormat::BrukerTdf,
        _ => MassSpectrometryFormat::Unknown,
    }
}

fn is_mzml(header: &[u8]) -> bool {
    let text = String::from_utf8_lossy(header);
    text.contains("<mzML") || text.contains("<indexedmzML")
}

/// Given a stream of bytes, infer the file format from its leading bytes. The
/// stream is restored to its position afterwards.
pub fn infer_from_stream<R: Read + Seek>(stream: &mut R) -> io::Result<MassSpectrometryFormat> {
    let current_pos = stream.stream_position()?;
    let mut buf = Vec::with_capacity(512);
    stream.by_ref().take(512).read_to_end(&mut buf)?;
    stream.seek(SeekFrom::Start(current_pos))?;
    if is_mzml(&buf) {
        Ok(MassSpectrometryFormat::MzML)
    } else {
        Ok(MassSpectrometryFormat::Unknown)
    }
}

/// Infer the file format from the path, falling back to reading the file
/// header when the extension is not recognized
pub fn infer_format<P: AsRef<Path>>(path: P) -> io::Result<MassSpectrometryFormat> {
    let path = path.as_ref();
    match infer_from_path(path) {
        MassSpectrometryFormat::Unknown if path.is_file() => {
            let mut stream = BufReader::new(fs::File::open(path)?);
            infer_from_stream(&mut stream)
        }
        format => Ok(format),
    }
}

/// Open the data file at `path` after inferring its format.
///
/// Vendor formats are reported as [`MsDataFileError::UnsupportedFormat`], as
/// they need a [`NativeAdapter`](super::native::NativeAdapter) over a
/// registered [`NativeVendorSource`](super::native::NativeVendorSource).
#[cfg(feature = "mzml")]
pub fn open_data_file<P: AsRef<Path>>(path: P) -> Result<MzMLFile, MsDataFileError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(MsDataFileError::MissingSource(path.to_path_buf()));
    }
    match infer_format(path)? {
        MassSpectrometryFormat::MzML => MzMLFile::open(path),
        format => Err(MsDataFileError::UnsupportedFormat(format)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_infer_from_path() {
        assert_eq!(infer_from_path("run.mzML"), MassSpectrometryFormat::MzML);
        assert_eq!(infer_from_path("/data/run.RAW"), MassSpectrometryFormat::ThermoRaw);
        assert_eq!(infer_from_path("sample.d"), MassSpectrometryFormat::BrukerTdf);
        assert_eq!(infer_from_path("peaks.mgf"), MassSpectrometryFormat::Unknown);
        assert_eq!(infer_from_path("noext"), MassSpectrometryFormat::Unknown);
        assert!(MassSpectrometryFormat::BrukerTdf.is_vendor_format());
        assert!(!MassSpectrometryFormat::MzML.is_vendor_format());
    }

    #[test]
    fn test_infer_from_stream() -> io::Result<()> {
        let mut stream = Cursor::new(
            b"<?xml version=\"1.0\"?>\n<indexedmzML xmlns=\"http://psi.hupo.org/ms/mzml\">".to_vec(),
        );
        stream.seek(SeekFrom::Start(2))?;
        assert_eq!(infer_from_stream(&mut stream)?, MassSpectrometryFormat::MzML);
        assert_eq!(stream.stream_position()?, 2);

        let mut stream = Cursor::new(b"BEGIN IONS\nEND IONS\n".to_vec());
        assert_eq!(infer_from_stream(&mut stream)?, MassSpectrometryFormat::Unknown);
        Ok(())
    }

    #[cfg(feature = "mzml")]
    #[test_log::test]
    fn test_open_data_file_dispatch() -> Result<(), MsDataFileError> {
        let dir = tempfile::tempdir()?;

        let missing = dir.path().join("absent.mzML");
        assert!(matches!(
            open_data_file(&missing),
            Err(MsDataFileError::MissingSource(_))
        ));

        let raw = dir.path().join("run.raw");
        fs::write(&raw, b"\x01\xa1F\x00i\x00n\x00n\x00i\x00g\x00a\x00n\x00")?;
        assert!(matches!(
            open_data_file(&raw),
            Err(MsDataFileError::UnsupportedFormat(MassSpectrometryFormat::ThermoRaw))
        ));

        let tdf = dir.path().join("sample.d");
        fs::create_dir(&tdf)?;
        assert!(matches!(
            open_data_file(&tdf),
            Err(MsDataFileError::UnsupportedFormat(MassSpectrometryFormat::BrukerTdf))
        ));

        let sniffed = dir.path().join("renamed.xml");
        fs::write(
            &sniffed,
            concat!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
                "<mzML xmlns=\"http://psi.hupo.org/ms/mzml\" version=\"1.1.0\">\n",
                "  <run id=\"r1\">\n",
                "    <spectrumList count=\"0\">\n",
                "    </spectrumList>\n",
                "  </run>\n",
                "</mzML>\n"
            ),
        )?;
        let mut file = open_data_file(&sniffed)?;
        assert_eq!(file.num_spectra()?, 0);
        Ok(())
    }
}
