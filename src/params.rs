//! Controlled vocabulary parameters as they appear in mzML, reduced to the
//! handful of behaviors the reader and writer need.
use std::fmt::Display;
use std::str::{self, FromStr};

/// Split a CURIE like `MS:1000511` into its vocabulary and numeric accession.
pub fn curie_to_num(curie: &str) -> (Option<ControlledVocabulary>, Option<u32>) {
    let mut parts = curie.split(':');
    let prefix = parts
        .next()
        .and_then(|v| v.parse::<ControlledVocabulary>().ok())
        .and_then(|cv| cv.as_option());
    match parts.next().map(|k| k.parse::<u32>()) {
        Some(Ok(v)) => (prefix, Some(v)),
        _ => (prefix, None),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub value: String,
    pub accession: Option<u32>,
    pub controlled_vocabulary: Option<ControlledVocabulary>,
    pub unit: Unit,
}

impl Param {
    pub fn new() -> Param {
        Param {
            ..Default::default()
        }
    }

    pub fn new_key_value<K: Into<String>, V: Into<String>>(name: K, value: V) -> Param {
        let mut inst = Self::new();
        inst.name = name.into();
        inst.value = value.into();
        inst
    }

    pub fn coerce<T: str::FromStr>(&self) -> Result<T, T::Err> {
        self.value.parse::<T>()
    }

    pub fn is_controlled(&self) -> bool {
        self.accession.is_some()
    }

    /// Test whether this param carries the accession number `accession` from the
    /// PSI-MS vocabulary
    pub fn is_ms(&self, accession: u32) -> bool {
        self.accession == Some(accession)
            && matches!(
                self.controlled_vocabulary,
                Some(ControlledVocabulary::MS) | None
            )
    }

    pub fn curie(&self) -> Option<String> {
        match (self.controlled_vocabulary, self.accession) {
            (Some(cv), Some(acc)) => Some(format!("{}:{:07}", cv.prefix(), acc)),
            _ => None,
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Param {
        self.unit = unit;
        self
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum ControlledVocabulary {
    MS,
    UO,
    Unknown,
}

impl ControlledVocabulary {
    pub const fn prefix(&self) -> &'static str {
        match &self {
            Self::MS => "MS",
            Self::UO => "UO",
            Self::Unknown => "?",
        }
    }

    pub fn as_option(&self) -> Option<Self> {
        match self {
            Self::Unknown => None,
            _ => Some(*self),
        }
    }

    /// Build a parameter with a numeric accession and an optional value
    pub fn param_val<S: Into<String>, V: ToString>(
        &self,
        accession: u32,
        name: S,
        value: V,
    ) -> Param {
        Param {
            name: name.into(),
            value: value.to_string(),
            accession: Some(accession),
            controlled_vocabulary: Some(*self),
            unit: Unit::Unknown,
        }
    }

    pub fn param<S: Into<String>>(&self, accession: u32, name: S) -> Param {
        self.param_val(accession, name, "")
    }
}

impl Display for ControlledVocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for ControlledVocabulary {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MS" | "PSI-MS" => Ok(Self::MS),
            "UO" => Ok(Self::UO),
            _ => Ok(Self::Unknown),
        }
    }
}

pub type ParamList = Vec<Param>;

/// Units that a term's value might have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Unit {
    // Mass
    MZ,
    Mass,

    // Time
    Minute,
    Second,
    Millisecond,

    // Intensity
    DetectorCounts,
    CountsPerSecond,

    // Collision Energy
    Electronvolt,

    #[default]
    Unknown,
}

impl Unit {
    pub const fn for_param(&self) -> (&'static str, &'static str) {
        match self {
            Self::Millisecond => ("UO:0000028", "millisecond"),
            Self::Second => ("UO:0000010", "second"),
            Self::Minute => ("UO:0000031", "minute"),

            Self::MZ => ("MS:1000040", "m/z"),
            Self::Mass => ("UO:0000221", "dalton"),

            Self::DetectorCounts => ("MS:1000131", "number of detector counts"),
            Self::CountsPerSecond => ("MS:1000814", "counts per second"),

            Self::Electronvolt => ("UO:0000266", "electronvolt"),
            Self::Unknown => ("", ""),
        }
    }

    pub fn from_name(name: &str) -> Unit {
        match name {
            "millisecond" => Self::Millisecond,
            "second" => Self::Second,
            "minute" => Self::Minute,

            "m/z" => Self::MZ,
            "dalton" => Self::Mass,

            "number of detector counts" => Self::DetectorCounts,
            "counts per second" => Self::CountsPerSecond,

            "electronvolt" => Self::Electronvolt,
            _ => Unit::Unknown,
        }
    }

    pub fn from_accession(acc: &str) -> Unit {
        match acc {
            "UO:0000028" => Self::Millisecond,
            "UO:0000010" => Self::Second,
            "UO:0000031" => Self::Minute,

            "MS:1000040" => Self::MZ,
            "UO:0000221" => Self::Mass,

            "MS:1000131" => Self::DetectorCounts,
            "MS:1000814" => Self::CountsPerSecond,

            "UO:0000266" => Self::Electronvolt,
            _ => Unit::Unknown,
        }
    }
}
