//! Metadata describing the file a run was acquired into.
use std::path::{Path, PathBuf};

use crate::io::ChecksumKind;
use crate::params::{ControlledVocabulary, Param, ParamList};

/// The scheme a source file uses to identify its spectra
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NativeIdFormat {
    Thermo,
    ScanNumberOnly,
    BrukerTdf,
    MultipleIds,
    #[default]
    NoNativeId,
}

const NATIVE_ID_TERMS: &[(u32, NativeIdFormat, &str)] = &[
    (1000768, NativeIdFormat::Thermo, "Thermo nativeID format"),
    (1000776, NativeIdFormat::ScanNumberOnly, "scan number only nativeID format"),
    (1002818, NativeIdFormat::BrukerTdf, "Bruker TDF nativeID format"),
    (1000774, NativeIdFormat::MultipleIds, "multiple peak list nativeID format"),
    (1000824, NativeIdFormat::NoNativeId, "no nativeID format"),
];

impl NativeIdFormat {
    pub fn from_accession(accession: u32) -> Option<Self> {
        NATIVE_ID_TERMS
            .iter()
            .find(|(acc, _, _)| *acc == accession)
            .map(|(_, f, _)| *f)
    }

    pub fn to_param(&self) -> Param {
        let (acc, _, name) = NATIVE_ID_TERMS
            .iter()
            .find(|(_, f, _)| f == self)
            .copied()
            .unwrap_or(NATIVE_ID_TERMS[4]);
        ControlledVocabulary::MS.param(acc, name)
    }

    /// Format the native identifier for the scan with the given one-based number
    pub fn format_id(&self, scan_number: u32) -> String {
        match self {
            Self::Thermo => format!("controllerType=0 controllerNumber=1 scan={scan_number}"),
            Self::BrukerTdf => format!("scan={scan_number}"),
            Self::MultipleIds => format!("index={}", scan_number.saturating_sub(1)),
            Self::ScanNumberOnly | Self::NoNativeId => format!("scan={scan_number}"),
        }
    }
}

/// The format of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SourceFileFormat {
    ThermoRaw,
    MzML,
    BrukerTdf,
    #[default]
    Unknown,
}

impl SourceFileFormat {
    pub fn from_accession(accession: u32) -> Option<Self> {
        match accession {
            1000563 => Some(Self::ThermoRaw),
            1000584 => Some(Self::MzML),
            1002817 => Some(Self::BrukerTdf),
            _ => None,
        }
    }

    pub fn to_param(&self) -> Option<Param> {
        match self {
            Self::ThermoRaw => Some(ControlledVocabulary::MS.param(1000563, "Thermo RAW format")),
            Self::MzML => Some(ControlledVocabulary::MS.param(1000584, "mzML format")),
            Self::BrukerTdf => Some(ControlledVocabulary::MS.param(1002817, "Bruker TDF format")),
            Self::Unknown => None,
        }
    }
}

/// Describes the file the scans were originally recorded in
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceFileInfo {
    pub id: String,
    pub name: String,
    pub location: String,
    pub native_id_format: NativeIdFormat,
    pub file_format: SourceFileFormat,
    pub checksum: Option<String>,
    pub checksum_kind: ChecksumKind,
}

impl SourceFileInfo {
    /// Describe the file at `path` without computing its checksum
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let location = path
            .parent()
            .map(|p| format!("file://{}", p.display()))
            .unwrap_or_default();
        Self {
            id: "RAW1".to_string(),
            name,
            location,
            ..Default::default()
        }
    }

    pub fn with_checksum(mut self, checksum: String, kind: ChecksumKind) -> Self {
        self.checksum = Some(checksum);
        self.checksum_kind = kind;
        self
    }

    /// The filesystem path this source file is located at, if its location is
    /// a `file://` URI
    pub fn path(&self) -> Option<PathBuf> {
        let directory = self.location.strip_prefix("file://")?;
        Some(PathBuf::from(directory).join(&self.name))
    }

    /// Absorb a controlled vocabulary term from a `<sourceFile>` element. Returns
    /// `false` if the term is not one that describes a source file.
    pub fn add_param(&mut self, param: &Param) -> bool {
        let Some(accession) = param.accession else {
            return false;
        };
        if let Some(format) = NativeIdFormat::from_accession(accession) {
            self.native_id_format = format;
        } else if let Some(format) = SourceFileFormat::from_accession(accession) {
            self.file_format = format;
        } else if let Some(kind) = ChecksumKind::from_accession(accession) {
            self.checksum = Some(param.value.clone());
            self.checksum_kind = kind;
        } else {
            return false;
        }
        true
    }

    pub fn params(&self) -> ParamList {
        let mut params = vec![self.native_id_format.to_param()];
        params.extend(self.file_format.to_param());
        if let Some(checksum) = self.checksum.as_ref() {
            params.push(ControlledVocabulary::MS.param_val(
                self.checksum_kind.accession(),
                self.checksum_kind.name(),
                checksum,
            ));
        }
        params
    }

    /// Recompute the checksum of the file at `path` and compare it to the
    /// recorded one. A file with no recorded checksum never verifies.
    #[cfg(feature = "checksum")]
    pub fn verify_checksum(&self, path: &Path) -> std::io::Result<bool> {
        match self.checksum.as_deref() {
            Some(expected) => {
                let actual = crate::io::checksum_file(path, self.checksum_kind)?;
                Ok(actual.eq_ignore_ascii_case(expected))
            }
            None => Ok(false),
        }
    }
}
