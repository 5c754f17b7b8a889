use std::fmt::Display;

use crate::params::{ControlledVocabulary, Param};

/// The polarity of the ions a scan recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    #[default]
    Unknown,
    Positive,
    Negative,
}

impl Polarity {
    pub const fn sign(&self) -> i32 {
        match self {
            Self::Negative => -1,
            _ => 1,
        }
    }

    pub fn from_accession(accession: u32) -> Option<Self> {
        match accession {
            1000129 => Some(Self::Negative),
            1000130 => Some(Self::Positive),
            _ => None,
        }
    }

    pub fn to_param(&self) -> Option<Param> {
        match self {
            Self::Negative => Some(ControlledVocabulary::MS.param(1000129, "negative scan")),
            Self::Positive => Some(ControlledVocabulary::MS.param(1000130, "positive scan")),
            Self::Unknown => None,
        }
    }
}

/// The activation method used to fragment a precursor ion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DissociationType {
    CID,
    PD,
    PSD,
    SID,
    BIRD,
    ECD,
    IRMPD,
    SORI,
    MPD,
    ETD,
    PQD,
    ISCID,
    HCD,
    EThcD,
    #[default]
    Unknown,
}

const DISSOCIATION_TERMS: &[(u32, DissociationType, &str)] = &[
    (1000133, DissociationType::CID, "collision-induced dissociation"),
    (1000134, DissociationType::PD, "plasma desorption"),
    (1000135, DissociationType::PSD, "post-source decay"),
    (1000136, DissociationType::SID, "surface-induced dissociation"),
    (1000242, DissociationType::BIRD, "blackbody infrared radiative dissociation"),
    (1000250, DissociationType::ECD, "electron capture dissociation"),
    (1000262, DissociationType::IRMPD, "infrared multiphoton dissociation"),
    (1000282, DissociationType::SORI, "sustained off-resonance irradiation"),
    (1000435, DissociationType::MPD, "photodissociation"),
    (1000598, DissociationType::ETD, "electron transfer dissociation"),
    (1000599, DissociationType::PQD, "pulsed q dissociation"),
    (1001880, DissociationType::ISCID, "in-source collision-induced dissociation"),
    (1000422, DissociationType::HCD, "beam-type collision-induced dissociation"),
    (1002631, DissociationType::EThcD, "electron-transfer/higher-energy collision dissociation"),
    (1000044, DissociationType::Unknown, "dissociation method"),
];

impl DissociationType {
    pub fn from_accession(accession: u32) -> Option<Self> {
        DISSOCIATION_TERMS
            .iter()
            .find(|(acc, _, _)| *acc == accession)
            .map(|(_, t, _)| *t)
    }

    pub fn accession(&self) -> u32 {
        DISSOCIATION_TERMS
            .iter()
            .find(|(_, t, _)| t == self)
            .map(|(acc, _, _)| *acc)
            .unwrap_or(1000044)
    }

    pub fn name(&self) -> &'static str {
        DISSOCIATION_TERMS
            .iter()
            .find(|(_, t, _)| t == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("dissociation method")
    }

    /// Collapse all activation terms listed for one precursor into a single
    /// type. ETD and HCD listed together describe EThcD.
    pub fn from_terms(terms: &[DissociationType]) -> Self {
        if terms.contains(&Self::ETD) && terms.contains(&Self::HCD) {
            Self::EThcD
        } else {
            terms.first().copied().unwrap_or_default()
        }
    }

    pub fn to_param(&self) -> Param {
        ControlledVocabulary::MS.param(self.accession(), self.name())
    }
}

impl Display for DissociationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The kind of mass analyzer that acquired a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MzAnalyzerType {
    #[default]
    Unknown,
    Quadrupole,
    IonTrap2D,
    IonTrap3D,
    Orbitrap,
    TOF,
    FTICR,
    Sector,
}

const ANALYZER_TERMS: &[(u32, MzAnalyzerType, &str)] = &[
    (1000443, MzAnalyzerType::Unknown, "mass analyzer type"),
    (1000081, MzAnalyzerType::Quadrupole, "quadrupole"),
    (1000291, MzAnalyzerType::IonTrap2D, "linear ion trap"),
    (1000082, MzAnalyzerType::IonTrap3D, "quadrupole ion trap"),
    (1000484, MzAnalyzerType::Orbitrap, "orbitrap"),
    (1000084, MzAnalyzerType::TOF, "time-of-flight"),
    (1000079, MzAnalyzerType::FTICR, "fourier transform ion cyclotron resonance mass spectrometer"),
    (1000080, MzAnalyzerType::Sector, "magnetic sector"),
];

impl MzAnalyzerType {
    pub fn from_accession(accession: u32) -> Option<Self> {
        ANALYZER_TERMS
            .iter()
            .find(|(acc, _, _)| *acc == accession)
            .map(|(_, t, _)| *t)
    }

    pub fn to_param(&self) -> Param {
        let (acc, _, name) = ANALYZER_TERMS
            .iter()
            .find(|(_, t, _)| t == self)
            .copied()
            .unwrap_or(ANALYZER_TERMS[0]);
        ControlledVocabulary::MS.param(acc, name)
    }
}

/// A closed m/z interval
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MzRange {
    pub min: f64,
    pub max: f64,
}

impl MzRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, mz: f64) -> bool {
        self.min <= mz && mz <= self.max
    }
}

impl Display for MzRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} - {}] m/z", self.min, self.max)
    }
}

/// Selected ion, isolation window and activation for a fragmentation scan
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PrecursorInfo {
    pub selected_ion_mz: Option<f64>,
    pub selected_ion_charge: Option<i32>,
    pub selected_ion_intensity: Option<f64>,
    /// The isolation window target
    pub isolation_mz: Option<f64>,
    /// The full width of the isolation window
    pub isolation_width: Option<f64>,
    pub dissociation_type: DissociationType,
    pub monoisotopic_guess_mz: Option<f64>,
    pub monoisotopic_guess_intensity: Option<f64>,
}

impl PrecursorInfo {
    pub(crate) fn normalize_charge(&mut self, polarity: Polarity) {
        self.selected_ion_charge = match (polarity, self.selected_ion_charge) {
            (Polarity::Negative, Some(z)) if z > 0 => Some(-z),
            (Polarity::Positive, Some(z)) if z < 0 => Some(z.abs()),
            (_, z) => z,
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dissociation_terms() {
        assert_eq!(DissociationType::from_accession(1000422), Some(DissociationType::HCD));
        assert_eq!(DissociationType::HCD.accession(), 1000422);
        assert_eq!(
            DissociationType::from_terms(&[DissociationType::ETD, DissociationType::HCD]),
            DissociationType::EThcD
        );
        assert_eq!(
            DissociationType::from_terms(&[DissociationType::CID]),
            DissociationType::CID
        );
        assert_eq!(DissociationType::from_terms(&[]), DissociationType::Unknown);
    }

    #[test]
    fn test_charge_normalization() {
        let mut info = PrecursorInfo {
            selected_ion_charge: Some(2),
            ..Default::default()
        };
        info.normalize_charge(Polarity::Negative);
        assert_eq!(info.selected_ion_charge, Some(-2));
        info.normalize_charge(Polarity::Positive);
        assert_eq!(info.selected_ion_charge, Some(2));
    }

    #[test]
    fn test_analyzer_param() {
        let param = MzAnalyzerType::Orbitrap.to_param();
        assert_eq!(param.accession, Some(1000484));
        assert_eq!(MzAnalyzerType::from_accession(1000084), Some(MzAnalyzerType::TOF));
    }
}
