use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

#[cfg(feature = "checksum")]
use sha1::{Digest, Sha1};

/// The digest algorithms a source file checksum may be recorded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChecksumKind {
    #[default]
    Sha1,
    Md5,
}

impl ChecksumKind {
    pub const fn accession(&self) -> u32 {
        match self {
            Self::Sha1 => 1000569,
            Self::Md5 => 1000568,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Md5 => "MD5",
        }
    }

    pub fn from_accession(accession: u32) -> Option<Self> {
        match accession {
            1000569 => Some(Self::Sha1),
            1000568 => Some(Self::Md5),
            _ => None,
        }
    }
}

/// Compute the hex-encoded digest of the file at `path`
#[cfg(feature = "checksum")]
pub fn checksum_file<P: AsRef<Path>>(path: P, kind: ChecksumKind) -> io::Result<String> {
    let mut handle = io::BufReader::new(fs::File::open(path)?);
    let mut buf = vec![0u8; 2usize.pow(16)];
    match kind {
        ChecksumKind::Sha1 => {
            let mut context = Sha1::new();
            loop {
                let n = handle.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                context.update(&buf[..n]);
            }
            Ok(base16ct::lower::encode_string(&context.finalize()))
        }
        ChecksumKind::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let n = handle.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                context.consume(&buf[..n]);
            }
            Ok(base16ct::lower::encode_string(&context.compute().0))
        }
    }
}

/// A writable stream that keeps a running SHA-1 checksum of all bytes and
/// counts how many have been written
#[cfg(feature = "checksum")]
#[derive(Clone)]
pub(crate) struct HashingStream<T: io::Write> {
    stream: T,
    context: Sha1,
    bytes_written: u64,
}

#[cfg(feature = "checksum")]
impl<T: io::Write> HashingStream<T> {
    pub fn new(stream: T) -> HashingStream<T> {
        Self {
            stream,
            context: Sha1::new(),
            bytes_written: 0,
        }
    }

    /// The hex-encoded SHA-1 digest of everything written so far
    pub fn compute(&self) -> String {
        base16ct::lower::encode_string(&self.context.clone().finalize())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

#[cfg(feature = "checksum")]
impl<T: io::Write> io::Write for HashingStream<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(buf)?;
        self.context.update(&buf[..n]);
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Check whether `path` exists, reporting a missing source as an error
pub(crate) fn require_source(path: &Path) -> io::Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        ))
    }
}

#[cfg(all(test, feature = "checksum"))]
mod test {
    use super::*;

    #[test]
    fn test_checksums() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("abc.txt");
        fs::write(&path, b"abc")?;
        assert_eq!(
            checksum_file(&path, ChecksumKind::Sha1)?,
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            checksum_file(&path, ChecksumKind::Md5)?,
            "900150983cd24fb0d6963f7d28e17f72"
        );
        Ok(())
    }

    #[test]
    fn test_hashing_stream() -> io::Result<()> {
        let mut stream = HashingStream::new(Vec::new());
        stream.write_all(b"ab")?;
        stream.write_all(b"c")?;
        assert_eq!(stream.bytes_written(), 3);
        assert_eq!(stream.compute(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(stream.into_inner(), b"abc");
        Ok(())
    }

    #[test]
    fn test_checksum_terms() {
        assert_eq!(ChecksumKind::from_accession(1000568), Some(ChecksumKind::Md5));
        assert_eq!(ChecksumKind::Sha1.accession(), 1000569);
        assert_eq!(ChecksumKind::from_accession(1), None);
    }
}
