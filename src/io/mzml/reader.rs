use std::collections::HashMap;
use std::fs;
use std::io::{self, prelude::*, BufReader, SeekFrom};
use std::mem;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use log::{trace, warn};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Error as XMLError, Reader};
use regex::Regex;

use crate::io::traits::SeekRead;
use crate::io::OffsetIndex;
use crate::meta::SourceFileInfo;
use crate::params::{Param, Unit};
use crate::spectrum::{DissociationType, MzAnalyzerType, MzRange, Polarity};

use super::binary::{ArrayType, Bytes, DataArray};
use super::reading_shared::{
    attribute_value, CVParamParse, FileMetadataBuilder, IndexParserState,
    IndexedMzMLIndexExtractor, MzMLIndexingError, MzMLParserError, MzMLParserState, MzMLSAX,
    ParserResult, XMLParseBase,
};

const BUFFER_SIZE: usize = 10000;

/// One `<precursor>` of a spectrum, with only its first selected ion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrecursorEntry {
    pub spectrum_ref: Option<String>,
    pub isolation_target: Option<f64>,
    pub isolation_lower_offset: Option<f64>,
    pub isolation_upper_offset: Option<f64>,
    pub selected_ion_mz: Option<f64>,
    pub selected_ion_charge: Option<i32>,
    pub selected_ion_intensity: Option<f64>,
    pub activation: Vec<DissociationType>,
    selected_ions: usize,
}

impl PrecursorEntry {
    /// The full isolation window width, when both offsets are known
    pub fn isolation_width(&self) -> Option<f64> {
        match (self.isolation_lower_offset, self.isolation_upper_offset) {
            (Some(lower), Some(upper)) => Some(lower + upper),
            _ => None,
        }
    }
}

/**
A SAX-style accumulator for one `<spectrum>` element. The binary arrays are kept
encoded, so the expensive decoding step can be done later and in parallel.
*/
#[derive(Debug, Clone, Default)]
pub struct MzMLSpectrumBuilder {
    pub id: String,
    pub index: usize,
    pub ms_level: Option<u8>,
    pub is_centroid: Option<bool>,
    pub polarity: Polarity,
    pub total_ion_current: Option<f64>,
    pub scan_filter: Option<String>,
    /// In minutes
    pub retention_time: Option<f64>,
    pub injection_time: Option<f64>,
    pub scan_window: Option<MzRange>,
    pub instrument_configuration_ref: Option<String>,
    pub mz_analyzer: MzAnalyzerType,
    pub monoisotopic_mz: Option<f64>,
    pub precursors: Vec<PrecursorEntry>,
    pub arrays: Vec<DataArray>,
    /// The first reason this spectrum can not be used, if any
    pub malformed: Option<String>,
    current_array: DataArray,
    scan_window_lower: Option<f64>,
    scan_window_upper: Option<f64>,
    scan_windows: usize,
    param_groups: Arc<HashMap<String, Vec<Param>>>,
}

impl XMLParseBase for MzMLSpectrumBuilder {}
impl CVParamParse for MzMLSpectrumBuilder {}

impl MzMLSpectrumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_param_groups(param_groups: Arc<HashMap<String, Vec<Param>>>) -> Self {
        Self {
            param_groups,
            ..Default::default()
        }
    }

    fn mark_malformed(&mut self, reason: String) {
        if self.malformed.is_none() {
            trace!("Spectrum {} is malformed: {reason}", self.id);
            self.malformed = Some(reason);
        }
    }

    fn parse_value<T: FromStr>(&mut self, param: &Param) -> Option<T> {
        match param.coerce::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                self.mark_malformed(format!(
                    "could not parse the value {:?} of {}",
                    param.value, param.name
                ));
                None
            }
        }
    }

    /// The array with the given kind, if the spectrum declared one
    pub fn array(&self, kind: ArrayType) -> Option<&DataArray> {
        self.arrays.iter().find(|a| a.name == kind)
    }

    pub fn precursor(&self) -> Option<&PrecursorEntry> {
        self.precursors.first()
    }

    fn current_precursor(&mut self) -> Option<&mut PrecursorEntry> {
        // Only the first precursor is described
        if self.precursors.len() == 1 {
            self.precursors.last_mut()
        } else {
            None
        }
    }

    fn fill_spectrum(&mut self, param: Param) {
        if param.name.ends_with("Monoisotopic M/Z:") {
            self.monoisotopic_mz = self.parse_value(&param);
            return;
        }
        let Some(accession) = param.accession else {
            return;
        };
        match accession {
            1000511 => self.ms_level = self.parse_value(&param),
            1000127 => self.is_centroid = Some(true),
            1000128 => self.is_centroid = Some(false),
            1000129 | 1000130 => {
                if let Some(polarity) = Polarity::from_accession(accession) {
                    self.polarity = polarity;
                }
            }
            1000285 => self.total_ion_current = self.parse_value(&param),
            1000512 => self.scan_filter = Some(param.value.clone()),
            1000016 => {
                let Some(time) = self.parse_value::<f64>(&param) else {
                    return;
                };
                match param.unit {
                    Unit::Minute => self.retention_time = Some(time),
                    Unit::Second => self.retention_time = Some(time / 60.0),
                    unit => self.mark_malformed(format!(
                        "unsupported retention time unit {unit:?}"
                    )),
                }
            }
            1000927 => self.injection_time = self.parse_value(&param),
            _ => {
                if let Some(analyzer) = MzAnalyzerType::from_accession(accession) {
                    self.mz_analyzer = analyzer;
                }
            }
        }
    }

    fn fill_scan_window(&mut self, param: Param) {
        if self.scan_windows > 1 {
            return;
        }
        match param.accession {
            Some(1000501) => self.scan_window_lower = self.parse_value(&param),
            Some(1000500) => self.scan_window_upper = self.parse_value(&param),
            _ => {}
        }
    }

    fn fill_isolation_window(&mut self, param: Param) {
        let value = match param.accession {
            Some(1000827 | 1000828 | 1000829) => self.parse_value::<f64>(&param),
            _ => return,
        };
        if let Some(precursor) = self.current_precursor() {
            match param.accession {
                Some(1000827) => precursor.isolation_target = value,
                Some(1000828) => precursor.isolation_lower_offset = value,
                Some(1000829) => precursor.isolation_upper_offset = value,
                _ => {}
            }
        }
    }

    fn fill_selected_ion(&mut self, param: Param) {
        if param.name.ends_with("Monoisotopic M/Z:") {
            self.monoisotopic_mz = self.parse_value(&param);
            return;
        }
        match param.accession {
            Some(1000744) => {
                let value = self.parse_value::<f64>(&param);
                if let Some(p) = self.current_precursor().filter(|p| p.selected_ions == 1) {
                    p.selected_ion_mz = value;
                }
            }
            Some(1000041) => {
                let value = self.parse_value::<i32>(&param);
                if let Some(p) = self.current_precursor().filter(|p| p.selected_ions == 1) {
                    p.selected_ion_charge = value;
                }
            }
            Some(1000042) => {
                let value = self.parse_value::<f64>(&param);
                if let Some(p) = self.current_precursor().filter(|p| p.selected_ions == 1) {
                    p.selected_ion_intensity = value;
                }
            }
            _ => {}
        }
    }

    fn fill_activation(&mut self, param: Param) {
        let Some(dissociation) = param.accession.and_then(DissociationType::from_accession) else {
            return;
        };
        if let Some(precursor) = self.current_precursor() {
            precursor.activation.push(dissociation);
        }
    }

    pub fn fill_param_into(&mut self, param: Param, state: MzMLParserState) {
        match state {
            MzMLParserState::Spectrum | MzMLParserState::ScanList | MzMLParserState::Scan => {
                self.fill_spectrum(param)
            }
            MzMLParserState::ScanWindow => self.fill_scan_window(param),
            MzMLParserState::IsolationWindow => self.fill_isolation_window(param),
            MzMLParserState::SelectedIon => self.fill_selected_ion(param),
            MzMLParserState::Activation => self.fill_activation(param),
            MzMLParserState::BinaryDataArray => {
                self.current_array.fill_param(&param);
            }
            _ => {}
        }
    }
}

impl MzMLSAX for MzMLSpectrumBuilder {
    fn start_element(&mut self, event: &BytesStart, state: MzMLParserState) -> ParserResult {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"spectrum" => {
                for attr_parsed in event.attributes() {
                    match attr_parsed {
                        Ok(attr) => match attr.key.as_ref() {
                            b"id" => {
                                self.id = attribute_value(&attr, state)?;
                                trace!("Stored spectrum id = {}", self.id);
                            }
                            b"index" => {
                                let index = attribute_value(&attr, state)?;
                                match index.parse::<usize>() {
                                    Ok(index) => self.index = index,
                                    Err(_) => self.mark_malformed(format!(
                                        "could not parse the spectrum index {index:?}"
                                    )),
                                }
                            }
                            _ => {}
                        },
                        Err(msg) => {
                            return Err(self.handle_xml_error(msg.into(), state));
                        }
                    }
                }
                return Ok(MzMLParserState::Spectrum);
            }
            b"spectrumList" => return Ok(MzMLParserState::SpectrumList),
            b"scanList" => return Ok(MzMLParserState::ScanList),
            b"scan" => {
                for attr_parsed in event.attributes() {
                    match attr_parsed {
                        Ok(attr) => {
                            if attr.key.as_ref() == b"instrumentConfigurationRef" {
                                self.instrument_configuration_ref =
                                    Some(attribute_value(&attr, state)?);
                            }
                        }
                        Err(msg) => {
                            return Err(self.handle_xml_error(msg.into(), state));
                        }
                    }
                }
                return Ok(MzMLParserState::Scan);
            }
            b"scanWindowList" => return Ok(MzMLParserState::ScanWindowList),
            b"scanWindow" => {
                self.scan_windows += 1;
                return Ok(MzMLParserState::ScanWindow);
            }
            b"precursorList" => return Ok(MzMLParserState::PrecursorList),
            b"precursor" => {
                let mut precursor = PrecursorEntry::default();
                for attr_parsed in event.attributes() {
                    match attr_parsed {
                        Ok(attr) => {
                            if attr.key.as_ref() == b"spectrumRef" {
                                precursor.spectrum_ref = Some(attribute_value(&attr, state)?);
                            }
                        }
                        Err(msg) => {
                            return Err(self.handle_xml_error(msg.into(), state));
                        }
                    }
                }
                self.precursors.push(precursor);
                return Ok(MzMLParserState::Precursor);
            }
            b"isolationWindow" => return Ok(MzMLParserState::IsolationWindow),
            b"selectedIonList" => return Ok(MzMLParserState::SelectedIonList),
            b"selectedIon" => {
                if let Some(precursor) = self.current_precursor() {
                    precursor.selected_ions += 1;
                }
                return Ok(MzMLParserState::SelectedIon);
            }
            b"activation" => return Ok(MzMLParserState::Activation),
            b"binaryDataArrayList" => return Ok(MzMLParserState::BinaryDataArrayList),
            b"binaryDataArray" => return Ok(MzMLParserState::BinaryDataArray),
            b"binary" => return Ok(MzMLParserState::Binary),
            _ => {}
        };
        Ok(state)
    }

    fn empty_element(&mut self, event: &BytesStart, state: MzMLParserState) -> ParserResult {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"cvParam" | b"userParam" => {
                let param = Self::handle_param(event, state)?;
                self.fill_param_into(param, state);
            }
            b"referenceableParamGroupRef" => {
                for attr_parsed in event.attributes() {
                    match attr_parsed {
                        Ok(attr) => {
                            if attr.key.as_ref() != b"ref" {
                                continue;
                            }
                            let group_id = attribute_value(&attr, state)?;
                            let groups = Arc::clone(&self.param_groups);
                            match groups.get(&group_id) {
                                Some(params) => {
                                    for param in params.iter().cloned() {
                                        self.fill_param_into(param, state)
                                    }
                                }
                                None => {
                                    warn!("Encountered a reference to undefined param group {group_id}")
                                }
                            }
                        }
                        Err(msg) => {
                            return Err(self.handle_xml_error(msg.into(), state));
                        }
                    }
                }
            }
            b"selectedIon" => {
                if let Some(precursor) = self.current_precursor() {
                    precursor.selected_ions += 1;
                }
            }
            _ => {}
        }
        Ok(state)
    }

    fn end_element(&mut self, event: &BytesEnd, state: MzMLParserState) -> ParserResult {
        let elt_name = event.name();
        match elt_name.as_ref() {
            b"spectrum" => {
                if let (Some(lower), Some(upper)) = (self.scan_window_lower, self.scan_window_upper)
                {
                    self.scan_window = Some(MzRange::new(lower, upper));
                }
                return Ok(MzMLParserState::SpectrumDone);
            }
            b"scanList" => return Ok(MzMLParserState::Spectrum),
            b"scan" => return Ok(MzMLParserState::ScanList),
            b"scanWindow" => return Ok(MzMLParserState::ScanWindowList),
            b"scanWindowList" => return Ok(MzMLParserState::Scan),
            b"precursorList" => return Ok(MzMLParserState::Spectrum),
            b"precursor" => return Ok(MzMLParserState::PrecursorList),
            b"isolationWindow" => return Ok(MzMLParserState::Precursor),
            b"selectedIonList" => return Ok(MzMLParserState::Precursor),
            b"selectedIon" => return Ok(MzMLParserState::SelectedIonList),
            b"activation" => return Ok(MzMLParserState::Precursor),
            b"binaryDataArrayList" => return Ok(MzMLParserState::Spectrum),
            b"binaryDataArray" => {
                let array = mem::take(&mut self.current_array);
                self.arrays.push(array);
                return Ok(MzMLParserState::BinaryDataArrayList);
            }
            b"binary" => return Ok(MzMLParserState::BinaryDataArray),
            b"spectrumList" => return Ok(MzMLParserState::SpectrumListDone),
            _ => {}
        };
        Ok(state)
    }

    fn text(&mut self, event: &BytesText, state: MzMLParserState) -> ParserResult {
        if state == MzMLParserState::Binary {
            let bin = event
                .unescape()
                .map_err(|e| MzMLParserError::XMLError(state, e))?;
            self.current_array.data = Bytes::from(bin.as_bytes());
        }
        Ok(state)
    }
}

fn file_checksum_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new("<fileChecksum>([0-9a-zA-Z]+)</fileChecksum>").expect("the pattern is a valid regex")
    })
}

/**
An mzML parser that supports random access to individual `<spectrum>` elements
by way of an [`OffsetIndex`]. The index is read from the `<indexList>` of an
`indexedmzML` document, or built by a pre-scan of the file if that is missing.
*/
pub struct MzMLReader<R: SeekRead> {
    /// The current state of the parser
    pub state: MzMLParserState,
    /// The raw reader
    handle: BufReader<R>,
    /// A place to store the last error the parser encountered
    error: Option<Box<MzMLParserError>>,
    /// A cache for repeated reads
    buffer: Bytes,

    spectrum_index: OffsetIndex,
    metadata: FileMetadataBuilder,
    param_groups: Arc<HashMap<String, Vec<Param>>>,
}

impl MzMLReader<fs::File> {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, MzMLParserError> {
        let handle = fs::File::open(path.as_ref())
            .map_err(|e| MzMLParserError::IOError(MzMLParserState::Start, e))?;
        Self::new(handle)
    }
}

impl<R: SeekRead> MzMLReader<R> {
    /// Create a new [`MzMLReader`] instance, wrapping the [`io::Read`] handle
    /// provided with an [`io::BufReader`], parse the metadata section of the file
    /// and locate or build the spectrum offset index.
    pub fn new(file: R) -> Result<Self, MzMLParserError> {
        let handle = BufReader::with_capacity(BUFFER_SIZE, file);
        let mut inst = Self {
            state: MzMLParserState::Start,
            handle,
            error: None,
            buffer: Bytes::new(),
            spectrum_index: OffsetIndex::new("spectrum".to_owned()),
            metadata: FileMetadataBuilder::default(),
            param_groups: Arc::new(HashMap::new()),
        };
        inst.parse_metadata()?;
        inst.construct_index()?;
        Ok(inst)
    }

    /**Parse the metadata section of the file using [`FileMetadataBuilder`]
     */
    fn parse_metadata(&mut self) -> Result<(), MzMLParserError> {
        let mut reader = Reader::from_reader(&mut self.handle);
        reader.trim_text(true);
        let mut accumulator = FileMetadataBuilder::default();
        loop {
            let result = match reader.read_event_into(&mut self.buffer) {
                Ok(Event::Start(ref e)) => accumulator.start_element(e, self.state),
                Ok(Event::End(ref e)) => accumulator.end_element(e, self.state),
                Ok(Event::Empty(ref e)) => accumulator.empty_element(e, self.state),
                Ok(Event::Eof) => {
                    self.state = MzMLParserState::EOF;
                    break;
                }
                Ok(_) => Ok(self.state),
                Err(err) => Err(accumulator.handle_xml_error(err, self.state)),
            };
            self.buffer.clear();
            match result {
                Ok(state) => {
                    self.state = state;
                    if state == MzMLParserState::SpectrumList {
                        break;
                    }
                }
                Err(err) => {
                    self.state = MzMLParserState::ParserError;
                    return Err(err);
                }
            }
        }
        self.param_groups = Arc::new(mem::take(&mut accumulator.reference_param_groups));
        self.metadata = accumulator;
        Ok(())
    }

    fn construct_index(&mut self) -> Result<(), MzMLParserError> {
        trace!("Constructing index from stream");
        match self.read_index_from_end() {
            Ok(count) => {
                trace!("Read {count} entries from the trailing index");
                Ok(())
            }
            Err(err) => {
                trace!("Failed to read the trailing index ({err}), scanning the file");
                self.build_index()
                    .map_err(|e| MzMLParserError::IOError(self.state, e))?;
                Ok(())
            }
        }
    }

    pub(crate) fn _parse_into<B: MzMLSAX>(
        &mut self,
        mut accumulator: B,
    ) -> Result<B, MzMLParserError> {
        if self.state == MzMLParserState::EOF {
            return Err(MzMLParserError::SectionOver("spectrum"));
        }

        let mut reader = Reader::from_reader(&mut self.handle);
        reader.trim_text(true);

        macro_rules! err_state {
            ($message:ident) => {{
                self.state = MzMLParserState::ParserError;
                self.error = Some(Box::new($message));
            }};
        }

        loop {
            match reader.read_event_into(&mut self.buffer) {
                Ok(Event::Start(ref e)) => {
                    if log::log_enabled!(log::Level::Trace) {
                        trace!(
                            "Starting mzML element: {}",
                            String::from_utf8_lossy(e.name().as_ref())
                        );
                    }
                    match accumulator.start_element(e, self.state) {
                        Ok(state) => self.state = state,
                        Err(message) => err_state!(message),
                    };
                }
                Ok(Event::End(ref e)) => {
                    match accumulator.end_element(e, self.state) {
                        Ok(state) => self.state = state,
                        Err(message) => err_state!(message),
                    };
                }
                Ok(Event::Text(ref e)) => {
                    match accumulator.text(e, self.state) {
                        Ok(state) => self.state = state,
                        Err(message) => err_state!(message),
                    };
                }
                Ok(Event::Empty(ref e)) => {
                    match accumulator.empty_element(e, self.state) {
                        Ok(state) => self.state = state,
                        Err(message) => err_state!(message),
                    }
                }
                Ok(Event::Eof) => {
                    trace!("Reached EOF");
                    self.state = MzMLParserState::EOF;
                    break;
                }
                Err(err) => match &err {
                    XMLError::EndEventMismatch { expected, found } => {
                        if expected.is_empty() && self.state == MzMLParserState::Resume {
                            self.buffer.clear();
                            continue;
                        } else {
                            trace!("Expected element {expected}, found {found}");
                            self.error = Some(Box::new(MzMLParserError::IncompleteElementError(
                                String::from_utf8_lossy(&self.buffer).to_string(),
                                self.state,
                            )));
                            self.state = MzMLParserState::ParserError;
                        }
                    }
                    e => {
                        self.error = Some(Box::new(MzMLParserError::IncompleteElementError(
                            e.to_string(),
                            self.state,
                        )));
                        self.state = MzMLParserState::ParserError;
                    }
                },
                _ => {}
            };
            self.buffer.clear();
            match self.state {
                MzMLParserState::SpectrumDone | MzMLParserState::ParserError => {
                    break;
                }
                _ => {}
            };
        }
        match self.state {
            MzMLParserState::SpectrumDone => Ok(accumulator),
            MzMLParserState::ParserError => match self.error.take() {
                Some(err) => Err(*err),
                None => Err(MzMLParserError::UnknownError(self.state)),
            },
            MzMLParserState::EOF => Err(MzMLParserError::EOF),
            _ => Err(MzMLParserError::IncompleteSpectrum),
        }
    }

    /// Parse the `<spectrum>` starting at byte `offset`
    fn read_spectrum_at_offset(&mut self, offset: u64) -> Result<MzMLSpectrumBuilder, MzMLParserError> {
        self.handle
            .seek(SeekFrom::Start(offset))
            .map_err(|e| MzMLParserError::IOError(self.state, e))?;
        self.state = MzMLParserState::Resume;
        let accumulator = MzMLSpectrumBuilder::with_param_groups(Arc::clone(&self.param_groups));
        let mut spectrum = self._parse_into(accumulator)?;
        spectrum.mz_analyzer = match spectrum.mz_analyzer {
            MzAnalyzerType::Unknown => self
                .metadata
                .analyzer_for(spectrum.instrument_configuration_ref.as_deref()),
            analyzer => analyzer,
        };
        Ok(spectrum)
    }

    /// Read the spectrum at `index` in file order
    pub fn get_spectrum_by_index(&mut self, index: usize) -> Result<MzMLSpectrumBuilder, MzMLParserError> {
        let (_, offset) = self
            .spectrum_index
            .get_index(index)
            .ok_or_else(|| MzMLParserError::EntryNotFound(index.to_string()))?;
        self.read_spectrum_at_offset(offset)
    }

    pub fn get_spectrum_by_id(&mut self, id: &str) -> Result<MzMLSpectrumBuilder, MzMLParserError> {
        let offset = self
            .spectrum_index
            .get(id)
            .ok_or_else(|| MzMLParserError::EntryNotFound(id.to_string()))?;
        self.read_spectrum_at_offset(offset)
    }

    pub fn len(&self) -> usize {
        self.spectrum_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectrum_index.is_empty()
    }

    pub fn get_index(&self) -> &OffsetIndex {
        &self.spectrum_index
    }

    /// The number of spectra the `<spectrumList>` declared, which may disagree
    /// with the index for a damaged file
    pub fn spectrum_count_hint(&self) -> Option<usize> {
        self.metadata.num_spectra
    }

    pub fn source_files(&self) -> &[SourceFileInfo] {
        &self.metadata.source_files
    }

    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.handle.seek(pos)
    }

    pub fn stream_position(&mut self) -> io::Result<u64> {
        self.handle.stream_position()
    }

    /// Read the checksum from the end of an `indexedmzML` document
    pub fn read_checksum(&mut self) -> io::Result<Option<String>> {
        let current_position = self.handle.stream_position()?;

        let end = self.handle.seek(SeekFrom::End(0))?;
        self.handle.seek(SeekFrom::Start(end.saturating_sub(200)))?;
        let mut buf = Bytes::new();
        self.handle.read_to_end(&mut buf)?;

        let found = file_checksum_pattern()
            .captures(&String::from_utf8_lossy(&buf))
            .and_then(|captures| captures.get(1).map(|hit| hit.as_str().to_string()));

        self.handle.seek(SeekFrom::Start(current_position))?;
        Ok(found)
    }

    /// Read the offset index at the end of an `<indexedmzML>` document,
    /// though this index may be malformed in some older files.
    pub fn read_index_from_end(&mut self) -> Result<u64, MzMLIndexingError> {
        let mut indexer = IndexedMzMLIndexExtractor::new();
        let current_position = self.handle.stream_position()?;
        let offset = indexer
            .find_offset_from_reader(&mut self.handle)?
            .ok_or(MzMLIndexingError::OffsetNotFound)?;
        let mut indexer_state = IndexParserState::Start;
        self.handle.seek(SeekFrom::Start(offset))?;

        let mut reader = Reader::from_reader(&mut self.handle);
        reader.trim_text(true);

        loop {
            let event = reader.read_event_into(&mut self.buffer);
            indexer_state = match event {
                Ok(Event::Start(ref e)) => indexer.start_element(e, indexer_state)?,
                Ok(Event::End(ref e)) => indexer.end_element(e, indexer_state)?,
                Ok(Event::Text(ref e)) => indexer.text(e, indexer_state)?,
                Ok(Event::Eof) => break,
                Err(err) => {
                    self.buffer.clear();
                    return Err(MzMLIndexingError::XMLError(err));
                }
                _ => indexer_state,
            };
            self.buffer.clear();
            if matches!(indexer_state, IndexParserState::Done) {
                break;
            }
        }
        self.buffer.clear();
        if indexer.spectrum_index.is_empty() {
            self.handle.seek(SeekFrom::Start(current_position))?;
            return Err(MzMLIndexingError::OffsetNotFound);
        }
        self.spectrum_index = indexer.spectrum_index;
        self.spectrum_index.init = true;
        self.handle.seek(SeekFrom::Start(current_position))?;
        Ok(self.spectrum_index.len() as u64)
    }

    /// Builds an offset index to each `<spectrum>` XML element
    /// by doing a fast pre-scan of the XML file.
    pub fn build_index(&mut self) -> io::Result<u64> {
        let start = self.handle.stream_position()?;
        trace!(
            "Starting to build offset index by traversing the file, storing last position as {start}"
        );
        self.handle.seek(SeekFrom::Start(0))?;
        self.spectrum_index.clear();
        let mut reader = Reader::from_reader(&mut self.handle);
        reader.trim_text(true);
        loop {
            match reader.read_event_into(&mut self.buffer) {
                Ok(Event::Start(ref e)) => {
                    if e.name().as_ref() == b"spectrum" {
                        // Hit a spectrum, extract ID and save current offset
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"id" {
                                let scan_id = attr
                                    .unescape_value()
                                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
                                    .to_string();
                                // The reader's position is just past the closing `>`
                                self.spectrum_index.insert(
                                    scan_id,
                                    (reader.buffer_position() - e.len() - 2) as u64,
                                );
                                break;
                            };
                        }
                    }
                }
                Ok(Event::End(ref e)) => {
                    if e.name().as_ref() == b"spectrumList" {
                        break;
                    }
                }
                Ok(Event::Eof) => {
                    break;
                }
                Err(err) => {
                    self.buffer.clear();
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
                _ => {}
            };
            self.buffer.clear();
        }
        let offset = reader.buffer_position() as u64;
        trace!("Ended indexing scan at offset {offset}. Restoring starting position {start}");
        self.handle.seek(SeekFrom::Start(start))?;
        self.spectrum_index.init = true;
        if self.spectrum_index.is_empty() {
            warn!("An index was built but no entries were found")
        }
        Ok(self.spectrum_index.len() as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    const SPECTRA: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<mzML xmlns="http://psi.hupo.org/ms/mzml" version="1.1.0">
  <cvList count="2">
    <cv id="MS" fullName="PSI-MS" version="4.1.0" URI="https://purl.obolibrary.org/obo/psi-ms.obo"/>
    <cv id="UO" fullName="Unit Ontology" version="releases/2020-03-10" URI="http://purl.obolibrary.org/obo/uo.obo"/>
  </cvList>
  <fileDescription>
    <fileContent/>
    <sourceFileList count="1">
      <sourceFile id="RAW1" name="run.raw" location="file:///data">
        <cvParam cvRef="MS" accession="MS:1000768" name="Thermo nativeID format" value=""/>
        <cvParam cvRef="MS" accession="MS:1000563" name="Thermo RAW format" value=""/>
        <cvParam cvRef="MS" accession="MS:1000569" name="SHA-1" value="0123abcd"/>
      </sourceFile>
    </sourceFileList>
  </fileDescription>
  <referenceableParamGroupList count="1">
    <referenceableParamGroup id="CommonMS1SpectrumParams">
      <cvParam cvRef="MS" accession="MS:1000130" name="positive scan" value=""/>
    </referenceableParamGroup>
  </referenceableParamGroupList>
  <instrumentConfigurationList count="1">
    <instrumentConfiguration id="IC1">
      <componentList count="1">
        <analyzer order="1">
          <cvParam cvRef="MS" accession="MS:1000484" name="orbitrap" value=""/>
        </analyzer>
      </componentList>
    </instrumentConfiguration>
  </instrumentConfigurationList>
  <run id="run" defaultInstrumentConfigurationRef="IC1">
    <spectrumList count="2">
      <spectrum index="0" id="scan=1" defaultArrayLength="0">
        <referenceableParamGroupRef ref="CommonMS1SpectrumParams"/>
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="1"/>
        <cvParam cvRef="MS" accession="MS:1000127" name="centroid spectrum" value=""/>
        <scanList count="1">
          <scan>
            <cvParam cvRef="MS" accession="MS:1000016" name="scan start time" value="30" unitCvRef="UO" unitAccession="UO:0000010" unitName="second"/>
            <scanWindowList count="1">
              <scanWindow>
                <cvParam cvRef="MS" accession="MS:1000501" name="scan window lower limit" value="100" unitCvRef="MS" unitAccession="MS:1000040" unitName="m/z"/>
                <cvParam cvRef="MS" accession="MS:1000500" name="scan window upper limit" value="2000" unitCvRef="MS" unitAccession="MS:1000040" unitName="m/z"/>
              </scanWindow>
            </scanWindowList>
          </scan>
        </scanList>
        <binaryDataArrayList count="2">
          <binaryDataArray encodedLength="0">
            <cvParam cvRef="MS" accession="MS:1000523" name="64-bit float" value=""/>
            <cvParam cvRef="MS" accession="MS:1000576" name="no compression" value=""/>
            <cvParam cvRef="MS" accession="MS:1000514" name="m/z array" value=""/>
            <binary></binary>
          </binaryDataArray>
          <binaryDataArray encodedLength="0">
            <cvParam cvRef="MS" accession="MS:1000523" name="64-bit float" value=""/>
            <cvParam cvRef="MS" accession="MS:1000576" name="no compression" value=""/>
            <cvParam cvRef="MS" accession="MS:1000515" name="intensity array" value=""/>
            <binary></binary>
          </binaryDataArray>
        </binaryDataArrayList>
      </spectrum>
      <spectrum index="1" id="scan=2" defaultArrayLength="0">
        <cvParam cvRef="MS" accession="MS:1000511" name="ms level" value="2"/>
        <cvParam cvRef="MS" accession="MS:1000128" name="profile spectrum" value=""/>
        <cvParam cvRef="MS" accession="MS:1000129" name="negative scan" value=""/>
        <scanList count="1">
          <scan>
            <cvParam cvRef="MS" accession="MS:1000016" name="scan start time" value="0.75" unitCvRef="UO" unitAccession="UO:0000031" unitName="minute"/>
            <userParam name="[mzLib]Monoisotopic M/Z:" value="449.72"/>
          </scan>
        </scanList>
        <precursorList count="1">
          <precursor spectrumRef="scan=1">
            <isolationWindow>
              <cvParam cvRef="MS" accession="MS:1000827" name="isolation window target m/z" value="450.0"/>
              <cvParam cvRef="MS" accession="MS:1000828" name="isolation window lower offset" value="1.0"/>
              <cvParam cvRef="MS" accession="MS:1000829" name="isolation window upper offset" value="1.5"/>
            </isolationWindow>
            <selectedIonList count="1">
              <selectedIon>
                <cvParam cvRef="MS" accession="MS:1000744" name="selected ion m/z" value="450.2"/>
                <cvParam cvRef="MS" accession="MS:1000041" name="charge state" value="2"/>
              </selectedIon>
            </selectedIonList>
            <activation>
              <cvParam cvRef="MS" accession="MS:1000598" name="electron transfer dissociation" value=""/>
              <cvParam cvRef="MS" accession="MS:1000422" name="beam-type collision-induced dissociation" value=""/>
            </activation>
          </precursor>
        </precursorList>
      </spectrum>
    </spectrumList>
  </run>
</mzML>
"#;

    #[test_log::test]
    fn test_build_index_and_metadata() -> Result<(), MzMLParserError> {
        let mut reader = MzMLReader::new(Cursor::new(SPECTRA.as_bytes()))?;
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.spectrum_count_hint(), Some(2));
        assert_eq!(reader.get_index().index_of("scan=2"), Some(1));

        let source = &reader.source_files()[0];
        assert_eq!(source.name, "run.raw");
        assert_eq!(source.checksum.as_deref(), Some("0123abcd"));
        assert_eq!(source.native_id_format, crate::meta::NativeIdFormat::Thermo);
        assert_eq!(reader.read_checksum().unwrap(), None);

        let first = reader.get_spectrum_by_index(0)?;
        assert_eq!(first.id, "scan=1");
        assert_eq!(first.ms_level, Some(1));
        assert_eq!(first.is_centroid, Some(true));
        assert_eq!(first.polarity, Polarity::Positive);
        assert_eq!(first.retention_time, Some(0.5));
        assert_eq!(first.scan_window, Some(MzRange::new(100.0, 2000.0)));
        assert_eq!(first.mz_analyzer, MzAnalyzerType::Orbitrap);
        assert_eq!(first.arrays.len(), 2);
        assert!(first.array(ArrayType::MZArray).is_some());
        assert!(first.malformed.is_none());
        Ok(())
    }

    #[test]
    fn test_checksum_pattern_is_shared() {
        assert!(std::ptr::eq(file_checksum_pattern(), file_checksum_pattern()));
        let trailer = concat!(
            "<indexListOffset>4096</indexListOffset>\n",
            "<fileChecksum>9f86d081884c7d65</fileChecksum>\n",
            "</indexedmzML>\n"
        );
        let found = file_checksum_pattern()
            .captures(trailer)
            .and_then(|captures| captures.get(1))
            .map(|hit| hit.as_str());
        assert_eq!(found, Some("9f86d081884c7d65"));
    }

    #[test]
    fn test_read_precursor() -> Result<(), MzMLParserError> {
        let mut reader = MzMLReader::new(Cursor::new(SPECTRA.as_bytes()))?;
        let second = reader.get_spectrum_by_id("scan=2")?;
        assert_eq!(second.index, 1);
        assert_eq!(second.is_centroid, Some(false));
        assert_eq!(second.polarity, Polarity::Negative);
        assert_eq!(second.retention_time, Some(0.75));
        assert_eq!(second.monoisotopic_mz, Some(449.72));
        let precursor = second.precursor().unwrap();
        assert_eq!(precursor.spectrum_ref.as_deref(), Some("scan=1"));
        assert_eq!(precursor.isolation_target, Some(450.0));
        assert_eq!(precursor.isolation_width(), Some(2.5));
        assert_eq!(precursor.selected_ion_mz, Some(450.2));
        assert_eq!(precursor.selected_ion_charge, Some(2));
        assert_eq!(
            DissociationType::from_terms(&precursor.activation),
            DissociationType::EThcD
        );
        assert!(second.arrays.is_empty());

        // Reading out of order re-seeks to the recorded offset
        let first = reader.get_spectrum_by_index(0)?;
        assert_eq!(first.id, "scan=1");
        assert!(matches!(
            reader.get_spectrum_by_index(5),
            Err(MzMLParserError::EntryNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_time_unit_is_malformed() -> Result<(), MzMLParserError> {
        let text = SPECTRA.replace(
            r#"unitAccession="UO:0000031" unitName="minute""#,
            r#"unitAccession="UO:0000032" unitName="hour""#,
        );
        let mut reader = MzMLReader::new(Cursor::new(text.as_bytes()))?;
        let second = reader.get_spectrum_by_index(1)?;
        assert!(second.malformed.is_some());
        assert_eq!(second.retention_time, None);
        Ok(())
    }
}
