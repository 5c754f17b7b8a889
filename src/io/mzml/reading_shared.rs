use std::collections::HashMap;
use std::io::{self, prelude::*, SeekFrom};
use std::mem;
use std::sync::OnceLock;

use log::warn;
use quick_xml::events::{BytesEnd, BytesStart, BytesText};
use quick_xml::Error as XMLError;
use regex::Regex;
use thiserror::Error;

use crate::io::OffsetIndex;
use crate::meta::SourceFileInfo;
use crate::params::{curie_to_num, ControlledVocabulary, Param, Unit};
use crate::spectrum::MzAnalyzerType;

use super::binary::{ArrayDecodingError, Bytes};

/**
The different states the [`MzMLReader`](super::MzMLReader) can enter while
parsing different phases of the document. This information is really only
needed by the module consumer to determine where in the document an error
occurred.
*/
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum MzMLParserState {
    Start = 0,
    Resume,

    // Top-level metadata
    CVList,
    FileDescription,
    FileContents,
    SourceFileList,
    SourceFile,

    ReferenceParamGroupList,
    ReferenceParamGroup,

    SoftwareList,
    Software,

    InstrumentConfigurationList,
    InstrumentConfiguration,
    ComponentList,
    Source,
    Analyzer,
    Detector,

    DataProcessingList,

    Run,

    // Spectrum List Elements
    Spectrum,
    SpectrumDone,

    SpectrumList,
    SpectrumListDone,

    BinaryDataArrayList,
    BinaryDataArray,
    Binary,

    ScanList,
    Scan,
    ScanWindowList,
    ScanWindow,

    PrecursorList,
    Precursor,
    IsolationWindow,
    SelectedIonList,
    SelectedIon,
    Activation,

    ParserError,
    EOF,
}

impl std::fmt::Display for MzMLParserState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/**
All the ways that mzML parsing can go wrong
*/
#[derive(Debug, Error)]
pub enum MzMLParserError {
    #[error("An error occurred outside of normal conditions {0:?}")]
    UnknownError(MzMLParserState),
    #[error("An incomplete spectrum was parsed")]
    IncompleteSpectrum,
    #[error("An incomplete element {0} was encountered in {1:?}")]
    IncompleteElementError(String, MzMLParserState),
    #[error("An XML error {1:?} was encountered in {0:?}")]
    XMLError(MzMLParserState, #[source] XMLError),
    #[error("An IO error {1} was encountered in {0:?}")]
    IOError(MzMLParserState, #[source] io::Error),
    #[error("Failed to decode {1} for {0:?}: {2}")]
    ArrayDecodingError(MzMLParserState, String, #[source] ArrayDecodingError),
    #[error("Reached the end of the {0} section")]
    SectionOver(&'static str),
    #[error("No spectrum is indexed at {0}")]
    EntryNotFound(String),
    #[error("Reached the end of the file")]
    EOF,
}

impl From<MzMLParserError> for io::Error {
    fn from(value: MzMLParserError) -> Self {
        match value {
            MzMLParserError::IOError(_, ref e) => io::Error::new(e.kind(), value),
            MzMLParserError::EOF => io::Error::new(io::ErrorKind::UnexpectedEof, value),
            MzMLParserError::EntryNotFound(_) => io::Error::new(io::ErrorKind::NotFound, value),
            _ => io::Error::new(io::ErrorKind::InvalidData, value),
        }
    }
}

pub type ParserResult = Result<MzMLParserState, MzMLParserError>;

/**
Common XML error handling behaviors
*/
pub trait XMLParseBase {
    fn handle_xml_error(&self, error: quick_xml::Error, state: MzMLParserState) -> MzMLParserError {
        MzMLParserError::XMLError(state, error)
    }
}

/// Read an attribute value as an owned string, reporting decoding failures
/// against the parser state they occurred in
pub(crate) fn attribute_value(
    attr: &quick_xml::events::attributes::Attribute,
    state: MzMLParserState,
) -> Result<String, MzMLParserError> {
    attr.unescape_value()
        .map(|v| v.to_string())
        .map_err(|e| MzMLParserError::XMLError(state, e))
}

/**
Common `cvParam` and `userParam` parsing behaviors
*/
pub trait CVParamParse: XMLParseBase {
    fn handle_param(event: &BytesStart, state: MzMLParserState) -> Result<Param, MzMLParserError> {
        let mut param = Param::new();
        let mut unit_name = None;
        let mut unit_accession = None;
        for attr_parsed in event.attributes() {
            match attr_parsed {
                Ok(attr) => match attr.key.as_ref() {
                    b"name" => {
                        param.name = attribute_value(&attr, state)?;
                    }
                    b"value" => {
                        param.value = attribute_value(&attr, state)?;
                    }
                    b"cvRef" => {
                        let cv_id = attribute_value(&attr, state)?;
                        param.controlled_vocabulary = cv_id
                            .parse::<ControlledVocabulary>()
                            .ok()
                            .and_then(|cv| cv.as_option());
                    }
                    b"accession" => {
                        let (_, acc) = curie_to_num(&attribute_value(&attr, state)?);
                        param.accession = acc;
                    }
                    b"unitName" => {
                        unit_name = Some(Unit::from_name(&attribute_value(&attr, state)?));
                    }
                    b"unitAccession" => {
                        unit_accession = Some(Unit::from_accession(&attribute_value(&attr, state)?));
                    }
                    _ => {}
                },
                Err(msg) => return Err(MzMLParserError::XMLError(state, msg.into())),
            }
        }
        // The accession is authoritative when both are present and recognized
        match (unit_accession, unit_name) {
            (Some(unit), _) if unit != Unit::Unknown => param.unit = unit,
            (_, Some(unit)) if unit != Unit::Unknown => param.unit = unit,
            _ => {}
        }
        Ok(param)
    }
}

pub trait MzMLSAX {
    fn start_element(&mut self, event: &BytesStart, state: MzMLParserState) -> ParserResult;

    fn empty_element(&mut self, event: &BytesStart, state: MzMLParserState) -> ParserResult;

    fn end_element(&mut self, event: &BytesEnd, state: MzMLParserState) -> ParserResult;

    fn text(&mut self, event: &BytesText, state: MzMLParserState) -> ParserResult;
}

#[derive(Debug, Error)]
pub enum MzMLIndexingError {
    #[error("Offset index not found")]
    OffsetNotFound,
    #[error("XML error {0} occurred while reading out mzML index")]
    XMLError(#[from] #[source] XMLError),
    #[error("IO error {0} occurred while reading out mzML index")]
    IOError(#[from] #[source] io::Error),
}

#[derive(Debug, Default, Clone)]
pub struct IndexedMzMLIndexExtractor {
    pub spectrum_index: OffsetIndex,
    last_id: String,
}

#[derive(Debug, Clone, Copy)]
pub enum IndexParserState {
    Start,
    SpectrumIndexList,
    OtherIndexList,
    Done,
}

impl XMLParseBase for IndexedMzMLIndexExtractor {}

fn index_list_offset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<indexListOffset>(\d+)</indexListOffset>").expect("the pattern is a valid regex")
    })
}

impl IndexedMzMLIndexExtractor {
    pub fn new() -> IndexedMzMLIndexExtractor {
        IndexedMzMLIndexExtractor {
            spectrum_index: OffsetIndex::new("spectrum".into()),
            last_id: String::new(),
        }
    }

    /// Find the `<indexListOffset>` value in the trailing bytes of the stream
    pub fn find_offset_from_reader<R: Read + Seek>(&self, reader: &mut R) -> io::Result<Option<u64>> {
        let end = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(end.saturating_sub(200)))?;
        let mut buf = Bytes::new();
        reader.read_to_end(&mut buf)?;
        if let Some(captures) = index_list_offset_pattern().captures(&String::from_utf8_lossy(&buf)) {
            if let Some(offset) = captures.get(1) {
                if let Ok(offset) = offset.as_str().parse::<u64>() {
                    return Ok(Some(offset));
                }
            }
        }
        Ok(None)
    }

    pub fn start_element(
        &mut self,
        event: &BytesStart,
        state: IndexParserState,
    ) -> Result<IndexParserState, XMLError> {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"offset" => {
                for attr_parsed in event.attributes() {
                    let attr = attr_parsed?;
                    if attr.key.as_ref() == b"idRef" {
                        self.last_id = attr.unescape_value()?.to_string();
                    }
                }
            }
            b"index" => {
                for attr_parsed in event.attributes() {
                    let attr = attr_parsed?;
                    if attr.key.as_ref() == b"name" {
                        return match attr.unescape_value()?.as_ref() {
                            "spectrum" => Ok(IndexParserState::SpectrumIndexList),
                            _ => Ok(IndexParserState::OtherIndexList),
                        };
                    }
                }
            }
            _ => {}
        }
        Ok(state)
    }

    pub fn end_element(
        &mut self,
        event: &BytesEnd,
        state: IndexParserState,
    ) -> Result<IndexParserState, XMLError> {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"indexList" => return Ok(IndexParserState::Done),
            b"index" => return Ok(IndexParserState::Start),
            _ => {}
        }
        Ok(state)
    }

    pub fn text(
        &mut self,
        event: &BytesText,
        state: IndexParserState,
    ) -> Result<IndexParserState, XMLError> {
        if let IndexParserState::SpectrumIndexList = state {
            let bin = event.unescape()?;
            if let Ok(offset) = bin.parse::<u64>() {
                if !self.last_id.is_empty() {
                    let key = mem::take(&mut self.last_id);
                    self.spectrum_index.insert(key, offset);
                } else {
                    warn!("Out of order text in index")
                }
            }
        }
        Ok(state)
    }
}

/**A SAX-style parser for building up the metadata section prior to the
`<spectrumList>` element of an mzML file.*/
#[derive(Debug, Default)]
pub struct FileMetadataBuilder {
    pub source_files: Vec<SourceFileInfo>,
    pub reference_param_groups: HashMap<String, Vec<Param>>,
    pub last_group: String,
    /// The mass analyzer of each instrument configuration by id, in document order
    pub analyzers: Vec<(String, MzAnalyzerType)>,
    pub num_spectra: Option<usize>,
}

impl XMLParseBase for FileMetadataBuilder {}
impl CVParamParse for FileMetadataBuilder {}

impl FileMetadataBuilder {
    fn id_attribute(event: &BytesStart, key: &[u8], state: MzMLParserState) -> Result<Option<String>, MzMLParserError> {
        for attr_parsed in event.attributes() {
            match attr_parsed {
                Ok(attr) => {
                    if attr.key.as_ref() == key {
                        return attribute_value(&attr, state).map(Some);
                    }
                }
                Err(msg) => return Err(MzMLParserError::XMLError(state, msg.into())),
            }
        }
        Ok(None)
    }

    pub fn start_element(&mut self, event: &BytesStart, state: MzMLParserState) -> ParserResult {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"cvList" => return Ok(MzMLParserState::CVList),
            b"fileDescription" => return Ok(MzMLParserState::FileDescription),
            b"fileContent" => return Ok(MzMLParserState::FileContents),
            b"sourceFileList" => return Ok(MzMLParserState::SourceFileList),
            b"sourceFile" => {
                let mut source_file = SourceFileInfo::default();
                for attr_parsed in event.attributes() {
                    match attr_parsed {
                        Ok(attr) => match attr.key.as_ref() {
                            b"id" => source_file.id = attribute_value(&attr, state)?,
                            b"name" => source_file.name = attribute_value(&attr, state)?,
                            b"location" => source_file.location = attribute_value(&attr, state)?,
                            _ => {}
                        },
                        Err(msg) => {
                            return Err(self.handle_xml_error(msg.into(), state));
                        }
                    }
                }
                self.source_files.push(source_file);
                return Ok(MzMLParserState::SourceFile);
            }
            b"softwareList" => return Ok(MzMLParserState::SoftwareList),
            b"software" => return Ok(MzMLParserState::Software),
            b"referenceableParamGroupList" => {
                return Ok(MzMLParserState::ReferenceParamGroupList);
            }
            b"referenceableParamGroup" => {
                if let Some(key) = Self::id_attribute(event, b"id", state)? {
                    self.reference_param_groups.entry(key.clone()).or_default();
                    self.last_group = key;
                }
                return Ok(MzMLParserState::ReferenceParamGroup);
            }
            b"instrumentConfigurationList" => {
                return Ok(MzMLParserState::InstrumentConfigurationList)
            }
            b"instrumentConfiguration" => {
                let id = Self::id_attribute(event, b"id", state)?.unwrap_or_default();
                self.analyzers.push((id, MzAnalyzerType::Unknown));
                return Ok(MzMLParserState::InstrumentConfiguration);
            }
            b"componentList" => return Ok(MzMLParserState::ComponentList),
            b"source" => return Ok(MzMLParserState::Source),
            b"analyzer" => return Ok(MzMLParserState::Analyzer),
            b"detector" => return Ok(MzMLParserState::Detector),
            b"dataProcessingList" => return Ok(MzMLParserState::DataProcessingList),
            b"run" => return Ok(MzMLParserState::Run),
            b"spectrumList" => {
                if let Some(count) = Self::id_attribute(event, b"count", state)? {
                    self.num_spectra = count.parse().ok();
                }
                return Ok(MzMLParserState::SpectrumList);
            }
            _ => {}
        }

        Ok(state)
    }

    pub fn fill_param_into(&mut self, param: Param, state: MzMLParserState) {
        match state {
            MzMLParserState::SourceFile => {
                if let Some(sf) = self.source_files.last_mut() {
                    sf.add_param(&param);
                }
            }
            MzMLParserState::Analyzer => {
                if let (Some(acc), Some(ic)) = (param.accession, self.analyzers.last_mut()) {
                    if let Some(analyzer) = MzAnalyzerType::from_accession(acc) {
                        ic.1 = analyzer;
                    }
                }
            }
            MzMLParserState::ReferenceParamGroup => {
                if let Some(group) = self.reference_param_groups.get_mut(&self.last_group) {
                    group.push(param);
                }
            }
            _ => {}
        }
    }

    pub fn empty_element(&mut self, event: &BytesStart, state: MzMLParserState) -> ParserResult {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"cvParam" | b"userParam" => {
                let param = Self::handle_param(event, state)?;
                self.fill_param_into(param, state);
            }
            b"referenceableParamGroupRef" => {
                if let Some(group_id) = Self::id_attribute(event, b"ref", state)? {
                    match self.reference_param_groups.get(&group_id) {
                        Some(params) => {
                            for param in params.clone() {
                                self.fill_param_into(param, state)
                            }
                        }
                        None => warn!("Encountered a reference to undefined param group {group_id}"),
                    }
                }
            }
            _ => {}
        }
        Ok(state)
    }

    pub fn end_element(&mut self, event: &BytesEnd, state: MzMLParserState) -> ParserResult {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"cvList" => return Ok(MzMLParserState::Start),
            b"fileContent" => return Ok(MzMLParserState::FileDescription),
            b"sourceFile" => return Ok(MzMLParserState::SourceFileList),
            b"sourceFileList" => return Ok(MzMLParserState::FileDescription),
            b"software" => return Ok(MzMLParserState::SoftwareList),
            b"referenceableParamGroup" => return Ok(MzMLParserState::ReferenceParamGroupList),
            b"instrumentConfiguration" => return Ok(MzMLParserState::InstrumentConfigurationList),
            b"componentList" => return Ok(MzMLParserState::InstrumentConfiguration),
            b"source" | b"analyzer" | b"detector" => return Ok(MzMLParserState::ComponentList),
            _ => {}
        }
        Ok(state)
    }

    /// The analyzer of the instrument configuration `id`, or of the first
    /// configuration when `id` is absent
    pub fn analyzer_for(&self, id: Option<&str>) -> MzAnalyzerType {
        match id {
            Some(id) => self
                .analyzers
                .iter()
                .find(|(k, _)| k == id)
                .map(|(_, a)| *a)
                .unwrap_or_default(),
            None => self.analyzers.first().map(|(_, a)| *a).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_find_offset_from_trailer() -> io::Result<()> {
        let extractor = IndexedMzMLIndexExtractor::new();
        let mut stream = Cursor::new(
            concat!(
                "  </indexList>\n",
                "  <indexListOffset>4096</indexListOffset>\n",
                "  <fileChecksum>9f86d081884c7d65</fileChecksum>\n",
                "</indexedmzML>\n"
            )
            .as_bytes()
            .to_vec(),
        );
        assert_eq!(extractor.find_offset_from_reader(&mut stream)?, Some(4096));
        assert_eq!(extractor.find_offset_from_reader(&mut stream)?, Some(4096));

        let mut plain = Cursor::new(b"<mzML>\n</mzML>\n".to_vec());
        assert_eq!(extractor.find_offset_from_reader(&mut plain)?, None);
        assert!(std::ptr::eq(index_list_offset_pattern(), index_list_offset_pattern()));
        Ok(())
    }
}
