use std::collections::HashMap;
use std::fmt::Debug;
use std::io::{self, BufWriter, Write};

use log::warn;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Error as XMLError;
use quick_xml::Writer;
use thiserror::Error;

use crate::io::utils::HashingStream;
use crate::io::OffsetIndex;
use crate::meta::SourceFileInfo;
use crate::params::{ControlledVocabulary, Param, Unit};
use crate::spectrum::{MzAnalyzerType, Polarity, ScanRecord};

use super::binary::{encode_array, ArrayPrecision, ArrayType, BinaryCompression};

const BUFFER_SIZE: usize = 10000;

macro_rules! bstart {
    ($e:tt) => {
        BytesStart::from_content($e, $e.len())
    };
}

macro_rules! attrib {
    ($name:expr, $value:expr, $elt:ident) => {
        let key = $name.as_bytes();
        let value = $value.as_bytes();
        $elt.push_attribute((key, value));
    };
}

macro_rules! start_event {
    ($writer:ident, $target:ident) => {
        $writer.handle.write_event(Event::Start($target.borrow()))?;
    };
}

macro_rules! end_event {
    ($writer:ident, $target:ident) => {
        $writer.handle.write_event(Event::End($target.to_end()))?;
    };
}

fn instrument_id(index: usize) -> String {
    format!("IC{}", index + 1)
}

/// The name the Monoisotopic m/z guess is recorded under
pub const MONOISOTOPIC_MZ_PARAM: &str = "[mzLib]Monoisotopic M/Z:";

const SOFTWARE_ID: &str = "mzaccess";
const DATA_PROCESSING_ID: &str = "mzaccess_processing";

#[derive(Debug, Error)]
pub enum MzMLWriterError {
    #[error("An XML error occurred: {0}")]
    XMLError(#[from] XMLError),
    #[error("Cannot transition from {from_state:?} to {to_state:?}")]
    StateTransitionError {
        from_state: MzMLWriterState,
        to_state: MzMLWriterState,
    },
    #[error("An IO error occurred: {0}")]
    IOError(#[from] io::Error),
    #[error("Cannot perform this action in {0:?}")]
    InvalidActionError(MzMLWriterState),
}

impl From<MzMLWriterError> for io::Error {
    fn from(value: MzMLWriterError) -> Self {
        match value {
            MzMLWriterError::IOError(e) => e,
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        }
    }
}

pub type WriterResult = Result<(), MzMLWriterError>;

/// How the document and its binary arrays are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MzMLWriterOptions {
    /// Wrap the document in `<indexedmzML>` with a spectrum offset index and checksum
    pub write_index: bool,
    pub compression: BinaryCompression,
    pub precision: ArrayPrecision,
}

impl Default for MzMLWriterOptions {
    fn default() -> Self {
        Self {
            write_index: true,
            compression: BinaryCompression::Zlib,
            precision: ArrayPrecision::Float64,
        }
    }
}

impl MzMLWriterOptions {
    pub fn with_index(mut self, write_index: bool) -> Self {
        self.write_index = write_index;
        self
    }

    pub fn with_compression(mut self, compression: BinaryCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_precision(mut self, precision: ArrayPrecision) -> Self {
        self.precision = precision;
        self
    }
}

struct InnerXMLWriter<W: io::Write> {
    pub handle: Writer<HashingStream<BufWriter<W>>>,
}

impl<W: Write> Debug for InnerXMLWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerXMLWriter")
            .field("handle", &"...")
            .finish()
    }
}

impl<W: io::Write> InnerXMLWriter<W> {
    pub fn new(file: W) -> InnerXMLWriter<W> {
        let handle = HashingStream::new(BufWriter::with_capacity(BUFFER_SIZE, file));
        Self {
            handle: Writer::new_with_indent(handle, b' ', 2),
        }
    }

    pub fn digest(&self) -> String {
        self.handle.get_ref().compute()
    }

    /// The number of bytes written to the document so far
    pub fn position(&self) -> u64 {
        self.handle.get_ref().bytes_written()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.handle.get_mut().flush()
    }

    pub fn write_param(&mut self, param: &Param) -> WriterResult {
        let mut elt = match param.curie() {
            Some(accession_str) => {
                let mut elt = bstart!("cvParam");
                if let Some(cv_ref) = param.controlled_vocabulary {
                    attrib!("cvRef", cv_ref.prefix(), elt);
                }
                attrib!("accession", accession_str, elt);
                elt
            }
            None => bstart!("userParam"),
        };

        attrib!("name", param.name, elt);
        attrib!("value", param.value, elt);
        match param.unit {
            Unit::Unknown => {}
            unit => {
                let (unit_acc, unit_name) = unit.for_param();
                let prefix = unit_acc.split(':').next().unwrap_or("UO");
                attrib!("unitCvRef", prefix, elt);
                attrib!("unitAccession", unit_acc, elt);
                attrib!("unitName", unit_name, elt);
            }
        }
        self.handle.write_event(Event::Empty(elt))?;
        Ok(())
    }

    pub fn write_param_list<'a, T: Iterator<Item = &'a Param>>(
        &mut self,
        params: T,
    ) -> WriterResult {
        for param in params {
            self.write_param(param)?
        }
        Ok(())
    }

    pub fn write_event(&mut self, event: Event) -> WriterResult {
        self.handle.write_event(event)?;
        Ok(())
    }
}

/**
The different states that [`MzMLWriter`] can enter while
writing an mzML document. This is only necessary for the module
consumer when determining where something may have gone wrong.
*/
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord)]
pub enum MzMLWriterState {
    Start,
    DocumentOpen,
    Header,
    Run,
    SpectrumList,
    SpectrumListClosed,
    RunClosed,
    MzMLClosed,
    IndexList,
    IndexListClosed,
    End,
}

/**
Writes [`ScanRecord`]s out as an mzML document, by default wrapped in
`<indexedmzML>` with a byte offset index and a SHA-1 checksum of the document.
*/
pub struct MzMLWriter<W: Write> {
    /// The total number of spectra this mzML document will contain.
    /// This value will appear in the `spectrumList` element's count attribute
    pub spectrum_count: u64,
    /// The number of `spectrum` elements written so far.
    pub spectrum_counter: u64,

    /// The files the scans were originally acquired into
    pub source_files: Vec<SourceFileInfo>,
    /// One instrument configuration per distinct mass analyzer
    pub instrument_configurations: Vec<MzAnalyzerType>,

    pub state: MzMLWriterState,
    pub offset_index: OffsetIndex,
    pub options: MzMLWriterOptions,

    /// The native ids of the spectra written so far, by scan number
    written_ids: HashMap<u32, String>,
    handle: InnerXMLWriter<W>,
    ms_cv: ControlledVocabulary,
}

impl<W: Write> Debug for MzMLWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MzMLWriter")
            .field("spectrum_count", &self.spectrum_count)
            .field("spectrum_counter", &self.spectrum_counter)
            .field("state", &self.state)
            .field("options", &self.options)
            .finish()
    }
}

impl<W: Write> MzMLWriter<W> {
    const PSIMS_VERSION: &'static str = "4.1.57";
    const UNIT_VERSION: &'static str = "releases/2020-03-10";

    /// Wrap a new [`std::io::Write`]-able type, constructing a new [`MzMLWriter`]
    pub fn new(file: W) -> MzMLWriter<W> {
        Self::with_options(file, MzMLWriterOptions::default())
    }

    pub fn with_options(file: W, options: MzMLWriterOptions) -> MzMLWriter<W> {
        MzMLWriter {
            spectrum_count: 0,
            spectrum_counter: 0,
            source_files: Vec::new(),
            instrument_configurations: Vec::new(),
            state: MzMLWriterState::Start,
            offset_index: OffsetIndex::new("spectrum".into()),
            options,
            written_ids: HashMap::new(),
            handle: InnerXMLWriter::new(file),
            ms_cv: ControlledVocabulary::MS,
        }
    }

    fn transition_err(&self, to_state: MzMLWriterState) -> WriterResult {
        Err(MzMLWriterError::StateTransitionError {
            from_state: self.state,
            to_state,
        })
    }

    /// Register the mass analyzer of an instrument configuration. This must be
    /// done before the header is written.
    pub fn add_instrument_configuration(&mut self, analyzer: MzAnalyzerType) -> WriterResult {
        if self.state >= MzMLWriterState::Header {
            return Err(MzMLWriterError::InvalidActionError(self.state));
        }
        if !self.instrument_configurations.contains(&analyzer) {
            self.instrument_configurations.push(analyzer);
        }
        Ok(())
    }

    fn make_psi_ms_cv(&self) -> BytesStart<'static> {
        let mut cv = bstart!("cv");
        cv.push_attribute(("id", "MS"));
        cv.push_attribute(("fullName", "PSI-MS"));
        cv.push_attribute(("URI", "http://purl.obolibrary.org/obo/ms.obo"));
        cv.push_attribute(("version", Self::PSIMS_VERSION));
        cv
    }

    fn make_unit_cv(&self) -> BytesStart<'static> {
        let mut cv = bstart!("cv");
        cv.push_attribute(("id", "UO"));
        cv.push_attribute(("fullName", "UNIT-ONTOLOGY"));
        cv.push_attribute(("URI", "http://ontologies.berkeleybop.org/uo.obo"));
        cv.push_attribute(("version", Self::UNIT_VERSION));
        cv
    }

    fn write_cv_list(&mut self) -> WriterResult {
        let mut cv_list = bstart!("cvList");
        cv_list.push_attribute(("count", "2"));
        self.handle.write_event(Event::Start(cv_list))?;

        let cv = self.make_psi_ms_cv();
        self.handle.write_event(Event::Empty(cv))?;

        let cv = self.make_unit_cv();
        self.handle.write_event(Event::Empty(cv))?;

        self.handle.write_event(Event::End(BytesEnd::new("cvList")))?;
        Ok(())
    }

    fn start_document(&mut self) -> WriterResult {
        self.handle
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        if self.options.write_index {
            let mut indexed = bstart!("indexedmzML");
            indexed.push_attribute(("xmlns", "http://psi.hupo.org/ms/mzml"));
            indexed.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
            indexed.push_attribute((
                "xsi:schemaLocation",
                "http://psi.hupo.org/ms/mzml http://psidev.info/files/ms/mzML/xsd/mzML1.1.3_idx.xsd",
            ));
            self.handle.write_event(Event::Start(indexed))?;
        }

        let mut mzml = bstart!("mzML");
        mzml.push_attribute(("xmlns", "http://psi.hupo.org/ms/mzml"));
        mzml.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
        mzml.push_attribute((
            "xsi:schemaLocation",
            "http://psi.hupo.org/ms/mzml http://psidev.info/files/ms/mzML/xsd/mzML1.1.1.xsd",
        ));
        mzml.push_attribute(("version", "1.1.1"));
        self.handle.write_event(Event::Start(mzml))?;

        self.state = MzMLWriterState::DocumentOpen;
        Ok(())
    }

    fn write_header(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::DocumentOpen {
            self.start_document()?;
        } else {
            return self.transition_err(MzMLWriterState::Header);
        }
        if self.instrument_configurations.is_empty() {
            self.instrument_configurations.push(MzAnalyzerType::Unknown);
        }
        self.write_cv_list()?;
        self.write_file_description()?;
        self.write_software_list()?;
        self.write_instrument_configuration()?;
        self.write_data_processing()?;

        self.state = MzMLWriterState::Header;
        Ok(())
    }

    fn write_file_description(&mut self) -> WriterResult {
        let fd = bstart!("fileDescription");
        start_event!(self, fd);

        let fc_tag = bstart!("fileContent");
        start_event!(self, fc_tag);
        self.handle
            .write_param(&self.ms_cv.param(1000579, "MS1 spectrum"))?;
        self.handle
            .write_param(&self.ms_cv.param(1000580, "MSn spectrum"))?;
        end_event!(self, fc_tag);

        if !self.source_files.is_empty() {
            let mut outer = bstart!("sourceFileList");
            let count = self.source_files.len().to_string();
            attrib!("count", count, outer);
            start_event!(self, outer);
            for sf in self.source_files.iter() {
                let mut tag = bstart!("sourceFile");
                attrib!("id", sf.id, tag);
                attrib!("name", sf.name, tag);
                attrib!("location", sf.location, tag);
                self.handle.write_event(Event::Start(tag.borrow()))?;
                self.handle.write_param_list(sf.params().iter())?;
                self.handle.write_event(Event::End(tag.to_end()))?;
            }
            end_event!(self, outer);
        }

        end_event!(self, fd);
        Ok(())
    }

    fn write_software_list(&mut self) -> WriterResult {
        let mut outer = bstart!("softwareList");
        attrib!("count", "1", outer);
        start_event!(self, outer);
        let mut tag = bstart!("software");
        attrib!("id", SOFTWARE_ID, tag);
        attrib!("version", env!("CARGO_PKG_VERSION"), tag);
        start_event!(self, tag);
        self.handle.write_param(&self.ms_cv.param_val(
            1000799,
            "custom unreleased software tool",
            SOFTWARE_ID,
        ))?;
        end_event!(self, tag);
        end_event!(self, outer);
        Ok(())
    }

    fn write_instrument_configuration(&mut self) -> WriterResult {
        let mut outer = bstart!("instrumentConfigurationList");
        let count = self.instrument_configurations.len().to_string();
        attrib!("count", count, outer);
        start_event!(self, outer);

        for (i, analyzer) in self.instrument_configurations.clone().into_iter().enumerate() {
            let mut tag = bstart!("instrumentConfiguration");
            let inst_id = instrument_id(i);
            attrib!("id", inst_id, tag);
            start_event!(self, tag);

            let mut components = bstart!("componentList");
            attrib!("count", "1", components);
            start_event!(self, components);
            let mut cmp_tag = bstart!("analyzer");
            attrib!("order", "1", cmp_tag);
            start_event!(self, cmp_tag);
            self.handle.write_param(&analyzer.to_param())?;
            end_event!(self, cmp_tag);
            end_event!(self, components);

            let mut sw = bstart!("softwareRef");
            attrib!("ref", SOFTWARE_ID, sw);
            self.handle.write_event(Event::Empty(sw))?;
            end_event!(self, tag);
        }
        end_event!(self, outer);
        Ok(())
    }

    fn write_data_processing(&mut self) -> WriterResult {
        let mut outer = bstart!("dataProcessingList");
        attrib!("count", "1", outer);
        start_event!(self, outer);
        let mut tag = bstart!("dataProcessing");
        attrib!("id", DATA_PROCESSING_ID, tag);
        start_event!(self, tag);
        let mut mtag = bstart!("processingMethod");
        attrib!("order", "0", mtag);
        attrib!("softwareRef", SOFTWARE_ID, mtag);
        start_event!(self, mtag);
        self.handle
            .write_param(&self.ms_cv.param(1000544, "Conversion to mzML"))?;
        end_event!(self, mtag);
        end_event!(self, tag);
        end_event!(self, outer);
        Ok(())
    }

    fn start_run(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::Run {
            self.write_header()?;
        } else {
            return self.transition_err(MzMLWriterState::Run);
        }
        let mut run = bstart!("run");
        attrib!("id", "1", run);
        let inst_id = instrument_id(0);
        attrib!("defaultInstrumentConfigurationRef", inst_id, run);
        if let Some(sf_ref) = self.source_files.first() {
            attrib!("defaultSourceFileRef", sf_ref.id, run);
        };
        self.handle.write_event(Event::Start(run))?;
        self.state = MzMLWriterState::Run;
        Ok(())
    }

    fn start_spectrum_list(&mut self) -> WriterResult {
        match self.state {
            MzMLWriterState::SpectrumList => return Ok(()),
            state if state < MzMLWriterState::SpectrumList => {
                self.start_run()?;
            }
            _ => {
                return self.transition_err(MzMLWriterState::SpectrumList);
            }
        }
        let mut list = bstart!("spectrumList");
        let count = self.spectrum_count.to_string();
        attrib!("count", count, list);
        attrib!("defaultDataProcessingRef", DATA_PROCESSING_ID, list);
        self.handle.write_event(Event::Start(list))?;
        self.state = MzMLWriterState::SpectrumList;
        Ok(())
    }

    fn close_spectrum_list(&mut self) -> WriterResult {
        let tag = bstart!("spectrumList");
        end_event!(self, tag);
        self.state = MzMLWriterState::SpectrumListClosed;
        Ok(())
    }

    fn close_run(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::SpectrumList {
            self.start_spectrum_list()?;
        }
        if self.state == MzMLWriterState::SpectrumList {
            self.close_spectrum_list()?;
        } else if self.state > MzMLWriterState::SpectrumListClosed {
            return self.transition_err(MzMLWriterState::RunClosed);
        }
        let tag = bstart!("run");
        end_event!(self, tag);
        self.state = MzMLWriterState::RunClosed;
        Ok(())
    }

    fn close_mzml(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::RunClosed {
            self.close_run()?;
        }
        let tag = bstart!("mzML");
        end_event!(self, tag);
        self.state = MzMLWriterState::MzMLClosed;
        Ok(())
    }

    fn close_indexed_mzml(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::MzMLClosed {
            self.close_mzml()?;
        }
        self.write_index_list()?;
        let tag = bstart!("indexedmzML");
        end_event!(self, tag);
        self.state = MzMLWriterState::End;
        Ok(())
    }

    /**
    Close the document. For an indexed document this writes out the offset
    index and file checksum at the tail of the document.
    */
    pub fn close(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::End {
            if self.options.write_index {
                self.close_indexed_mzml()?;
            } else {
                self.close_mzml()?;
                self.state = MzMLWriterState::End;
            }
        }
        self.handle.flush()?;
        Ok(())
    }

    fn write_scan_list(&mut self, scan: &ScanRecord) -> WriterResult {
        let mut scan_list_tag = bstart!("scanList");
        attrib!("count", "1", scan_list_tag);
        start_event!(self, scan_list_tag);
        self.handle
            .write_param(&self.ms_cv.param(1000795, "no combination"))?;

        let mut scan_tag = bstart!("scan");
        match self
            .instrument_configurations
            .iter()
            .position(|a| *a == scan.mz_analyzer())
        {
            Some(i) => {
                let id = instrument_id(i);
                attrib!("instrumentConfigurationRef", id, scan_tag);
            }
            None => warn!(
                "No instrument configuration uses {:?}, scan {} will use the default",
                scan.mz_analyzer(),
                scan.one_based_scan_number()
            ),
        }
        start_event!(self, scan_tag);

        if !scan.retention_time().is_nan() {
            self.handle.write_param(
                &self
                    .ms_cv
                    .param_val(1000016, "scan start time", scan.retention_time())
                    .with_unit(Unit::Minute),
            )?;
        }
        if let Some(filter) = scan.scan_filter() {
            self.handle
                .write_param(&self.ms_cv.param_val(1000512, "filter string", filter))?;
        }
        if let Some(injection_time) = scan.injection_time() {
            self.handle.write_param(
                &self
                    .ms_cv
                    .param_val(1000927, "ion injection time", injection_time)
                    .with_unit(Unit::Millisecond),
            )?;
        }
        if let Some(mz) = scan.precursor().and_then(|p| p.monoisotopic_guess_mz) {
            self.handle
                .write_param(&Param::new_key_value(MONOISOTOPIC_MZ_PARAM, mz.to_string()))?;
        }

        if let Some(window) = scan.scan_window() {
            let mut scan_window_list_tag = bstart!("scanWindowList");
            attrib!("count", "1", scan_window_list_tag);
            start_event!(self, scan_window_list_tag);
            let window_tag = bstart!("scanWindow");
            start_event!(self, window_tag);
            self.handle.write_param(
                &self
                    .ms_cv
                    .param_val(1000501, "scan window lower limit", window.min)
                    .with_unit(Unit::MZ),
            )?;
            self.handle.write_param(
                &self
                    .ms_cv
                    .param_val(1000500, "scan window upper limit", window.max)
                    .with_unit(Unit::MZ),
            )?;
            end_event!(self, window_tag);
            end_event!(self, scan_window_list_tag);
        }
        end_event!(self, scan_tag);
        end_event!(self, scan_list_tag);
        Ok(())
    }

    fn write_isolation_window(&mut self, scan: &ScanRecord) -> WriterResult {
        let (Some(target), Some(range)) = (scan.isolation_mz(), scan.isolation_range()) else {
            return Ok(());
        };
        let iw_tag = bstart!("isolationWindow");
        start_event!(self, iw_tag);
        self.handle.write_param(
            &self
                .ms_cv
                .param_val(1000827, "isolation window target m/z", target)
                .with_unit(Unit::MZ),
        )?;
        self.handle.write_param(
            &self
                .ms_cv
                .param_val(1000828, "isolation window lower offset", target - range.min)
                .with_unit(Unit::MZ),
        )?;
        self.handle.write_param(
            &self
                .ms_cv
                .param_val(1000829, "isolation window upper offset", range.max - target)
                .with_unit(Unit::MZ),
        )?;
        end_event!(self, iw_tag);
        Ok(())
    }

    fn write_selected_ions(&mut self, scan: &ScanRecord) -> WriterResult {
        let Some(precursor) = scan.precursor() else {
            return Ok(());
        };
        let mut outer = bstart!("selectedIonList");
        attrib!("count", "1", outer);
        start_event!(self, outer);
        let tag = bstart!("selectedIon");
        start_event!(self, tag);

        if let Some(mz) = precursor.selected_ion_mz {
            self.handle.write_param(
                &self
                    .ms_cv
                    .param_val(1000744, "selected ion m/z", mz)
                    .with_unit(Unit::MZ),
            )?;
        }
        if let Some(intensity) = precursor.selected_ion_intensity {
            self.handle.write_param(
                &self
                    .ms_cv
                    .param_val(1000042, "peak intensity", intensity)
                    .with_unit(Unit::DetectorCounts),
            )?;
        }
        if let Some(charge) = precursor.selected_ion_charge {
            self.handle
                .write_param(&self.ms_cv.param_val(1000041, "charge state", charge))?;
        }
        end_event!(self, tag);
        end_event!(self, outer);
        Ok(())
    }

    fn write_activation(&mut self, scan: &ScanRecord) -> WriterResult {
        let Some(precursor) = scan.precursor() else {
            return Ok(());
        };
        let tag = bstart!("activation");
        start_event!(self, tag);
        self.handle
            .write_param(&precursor.dissociation_type.to_param())?;
        end_event!(self, tag);
        Ok(())
    }

    fn write_precursor(&mut self, scan: &ScanRecord) -> WriterResult {
        let mut precursor_list_tag = bstart!("precursorList");
        attrib!("count", "1", precursor_list_tag);
        start_event!(self, precursor_list_tag);

        let mut precursor_tag = bstart!("precursor");
        let precursor_id = scan
            .one_based_precursor_scan_number()
            .and_then(|n| self.written_ids.get(&n).cloned())
            .or_else(|| scan.native_precursor_id().map(|s| s.to_string()));
        if let Some(prec_id) = precursor_id {
            attrib!("spectrumRef", prec_id, precursor_tag);
        }
        start_event!(self, precursor_tag);

        self.write_isolation_window(scan)?;
        self.write_selected_ions(scan)?;
        self.write_activation(scan)?;
        end_event!(self, precursor_tag);
        end_event!(self, precursor_list_tag);
        Ok(())
    }

    fn write_binary_data_array(&mut self, kind: ArrayType, values: &[f64]) -> WriterResult {
        let mut outer = bstart!("binaryDataArray");

        let encoded = encode_array(values, self.options.precision, self.options.compression)?;
        let encoded_len = encoded.len().to_string();
        attrib!("encodedLength", encoded_len, outer);

        start_event!(self, outer);
        self.handle.write_param(&self.options.precision.to_param())?;
        self.handle
            .write_param(&self.options.compression.to_param())?;
        if let Some(param) = kind.to_param() {
            self.handle.write_param(&param)?;
        }

        let bin = bstart!("binary");
        start_event!(self, bin);
        self.handle.write_event(Event::Text(BytesText::new(
            String::from_utf8_lossy(&encoded).as_ref(),
        )))?;
        end_event!(self, bin);
        end_event!(self, outer);
        Ok(())
    }

    fn write_binary_data_arrays(&mut self, scan: &ScanRecord) -> WriterResult {
        let mut outer = bstart!("binaryDataArrayList");
        attrib!("count", "2", outer);
        start_event!(self, outer);
        self.write_binary_data_array(ArrayType::MZArray, scan.spectrum().mz())?;
        self.write_binary_data_array(ArrayType::IntensityArray, scan.spectrum().intensity())?;
        end_event!(self, outer);
        Ok(())
    }

    /**
    Write a [`ScanRecord`] out to the mzML file.

    ## Side-Effects
    If the writer has not already started writing the spectra, this will cause all the metadata
    to be written out and the `<spectrumList>` element will be opened, preventing no new metadata
    from being written to this stream. Furthermore, this writes the spectrum count out, so the value
    may no longer be changed.
    */
    pub fn write_spectrum(&mut self, scan: &ScanRecord) -> WriterResult {
        match self.state {
            MzMLWriterState::SpectrumList => {}
            state if state < MzMLWriterState::SpectrumList => {
                self.start_spectrum_list()?;
            }
            _ => {
                // Cannot write spectrum, currently in state which happens
                // after spectra may be written
                return Err(MzMLWriterError::InvalidActionError(self.state));
            }
        }
        let id = if scan.native_id().is_empty() {
            format!("scan={}", scan.one_based_scan_number())
        } else {
            scan.native_id().to_string()
        };
        let mut outer = bstart!("spectrum");
        attrib!("id", id, outer);
        let count = self.spectrum_counter.to_string();
        attrib!("index", count, outer);
        let default_array_len = scan.spectrum().size().to_string();
        attrib!("defaultArrayLength", default_array_len, outer);

        self.handle.write_event(Event::Start(outer.borrow()))?;
        // The tag is written as `<` + content + `>`
        let pos = self.handle.position() - outer.len() as u64 - 2;
        self.offset_index.insert(id.clone(), pos);
        self.written_ids.insert(scan.one_based_scan_number(), id);
        self.spectrum_counter += 1;

        let ms_level = scan.ms_order();
        if ms_level == 1 {
            self.handle
                .write_param(&self.ms_cv.param(1000579, "MS1 spectrum"))?;
        } else {
            self.handle
                .write_param(&self.ms_cv.param(1000580, "MSn spectrum"))?;
        }
        self.handle
            .write_param(&self.ms_cv.param_val(1000511, "ms level", ms_level))?;

        match scan.polarity().to_param() {
            Some(param) => self.handle.write_param(&param)?,
            None => {
                warn!(
                    "Could not determine scan polarity for {}, omitting it",
                    scan.native_id()
                );
            }
        }

        if scan.is_centroid() {
            self.handle
                .write_param(&self.ms_cv.param(1000127, "centroid spectrum"))?;
        } else {
            self.handle
                .write_param(&self.ms_cv.param(1000128, "profile spectrum"))?;
        }
        self.handle.write_param(
            &self
                .ms_cv
                .param_val(1000285, "total ion current", scan.total_ion_current())
                .with_unit(Unit::DetectorCounts),
        )?;

        self.write_scan_list(scan)?;

        if scan.ms_order() > 1 && scan.precursor().is_some() {
            self.write_precursor(scan)?;
        }

        self.write_binary_data_arrays(scan)?;

        end_event!(self, outer);
        Ok(())
    }

    /// Write every scan in `scans`, configuring the header from their
    /// analyzers and count first
    pub fn write_all<'a, I: IntoIterator<Item = &'a ScanRecord>>(&mut self, scans: I) -> WriterResult
    where
        I::IntoIter: Clone,
    {
        let scans = scans.into_iter();
        if self.state < MzMLWriterState::Header {
            let mut count = 0;
            for scan in scans.clone() {
                self.add_instrument_configuration(scan.mz_analyzer())?;
                count += 1;
            }
            self.spectrum_count = count;
        }
        for scan in scans {
            self.write_spectrum(scan)?;
        }
        Ok(())
    }

    fn write_index(&mut self, index: &OffsetIndex) -> WriterResult {
        let mut outer = bstart!("index");
        attrib!("name", index.name, outer);
        start_event!(self, outer);
        for (id, offset) in index.iter() {
            let mut tag = bstart!("offset");
            attrib!("idRef", id, tag);
            start_event!(self, tag);
            let content = offset.to_string();
            let text = BytesText::new(&content);
            self.handle.write_event(Event::Text(text))?;
            end_event!(self, tag);
        }
        end_event!(self, outer);
        Ok(())
    }

    fn write_index_list(&mut self) -> WriterResult {
        if self.state < MzMLWriterState::MzMLClosed {
            self.close_mzml()?;
        } else if self.state >= MzMLWriterState::IndexList {
            return self.transition_err(MzMLWriterState::IndexList);
        }
        self.state = MzMLWriterState::IndexList;
        let mut outer = bstart!("indexList");
        attrib!("count", "1", outer);
        start_event!(self, outer);
        let offset = self.handle.position() - outer.len() as u64 - 2;
        let index = std::mem::take(&mut self.offset_index);
        let result = self.write_index(&index);
        self.offset_index = index;
        result?;
        end_event!(self, outer);

        let tag = bstart!("indexListOffset");
        start_event!(self, tag);
        let content = offset.to_string();
        let text = BytesText::new(&content);
        self.handle.write_event(Event::Text(text))?;
        end_event!(self, tag);

        let tag = bstart!("fileChecksum");
        start_event!(self, tag);
        let content = self.handle.digest();
        let text = BytesText::new(&content);
        self.handle.write_event(Event::Text(text))?;
        end_event!(self, tag);
        self.state = MzMLWriterState::IndexListClosed;
        Ok(())
    }

    /// Get a reference to the mzML writer's spectrum count.
    pub fn spectrum_count(&self) -> &u64 {
        &self.spectrum_count
    }

    /// Set the mzML writer's spectrum count.
    pub fn set_spectrum_count(&mut self, spectrum_count: u64) {
        self.spectrum_count = spectrum_count;
    }

    /// Finish the document and return the wrapped stream
    pub fn into_inner(mut self) -> Result<W, MzMLWriterError> {
        self.close()?;
        self.handle
            .handle
            .into_inner()
            .into_inner()
            .into_inner()
            .map_err(|e| MzMLWriterError::IOError(e.into_error()))
    }
}

#[cfg(test)]
mod test {
    use super::super::reader::MzMLReader;
    use super::*;
    use crate::spectrum::{DissociationType, MzRange, PrecursorInfo, Spectrum};
    use std::io::Cursor;

    pub(crate) fn sample_scans() -> Vec<ScanRecord> {
        let ms1 = ScanRecord::new(
            Spectrum::new(vec![400.0, 450.2, 451.7], vec![10.0, 500.0, 30.0]).unwrap(),
            1,
            1,
            true,
            Polarity::Positive,
            0.5,
        )
        .with_native_id("controllerType=0 controllerNumber=1 scan=1")
        .with_scan_window(Some(MzRange::new(350.0, 1800.0)))
        .with_mz_analyzer(MzAnalyzerType::Orbitrap)
        .with_scan_filter(Some("FTMS + p NSI Full ms [350.00-1800.00]".into()));

        let ms2 = ScanRecord::new(
            Spectrum::new(vec![120.1, 250.3], vec![7.0, 3.5]).unwrap(),
            2,
            2,
            true,
            Polarity::Positive,
            0.52,
        )
        .with_native_id("controllerType=0 controllerNumber=1 scan=2")
        .with_mz_analyzer(MzAnalyzerType::IonTrap2D)
        .with_injection_time(Some(35.0))
        .with_precursor(PrecursorInfo {
            selected_ion_mz: Some(450.2),
            selected_ion_charge: Some(2),
            isolation_mz: Some(450.0),
            isolation_width: Some(2.0),
            dissociation_type: DissociationType::HCD,
            monoisotopic_guess_mz: Some(449.7),
            ..Default::default()
        });
        let mut ms2 = ms2;
        ms2.set_one_based_precursor_scan_number(Some(1));
        vec![ms1, ms2]
    }

    #[test_log::test]
    fn test_write_indexed() -> Result<(), MzMLWriterError> {
        let scans = sample_scans();
        let mut writer = MzMLWriter::new(Vec::new());
        writer.source_files.push(SourceFileInfo {
            id: "RAW1".into(),
            name: "run.raw".into(),
            ..Default::default()
        });
        writer.write_all(scans.iter())?;
        let buffer = writer.into_inner()?;
        let text = String::from_utf8_lossy(&buffer).to_string();
        assert!(text.contains("<indexedmzML"));
        assert!(text.contains("spectrumRef=\"controllerType=0 controllerNumber=1 scan=1\""));

        let mut reader = MzMLReader::new(Cursor::new(buffer.clone()))
            .map_err(io::Error::from)?;
        assert_eq!(reader.len(), 2);
        let trailing: Vec<(String, u64)> = reader
            .get_index()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        for (_, offset) in trailing.iter() {
            assert!(buffer[*offset as usize..].starts_with(b"<spectrum "));
        }

        reader.build_index()?;
        let scanned: Vec<(String, u64)> = reader
            .get_index()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        assert_eq!(trailing, scanned);

        let second = reader.get_spectrum_by_index(1).map_err(io::Error::from)?;
        assert_eq!(second.mz_analyzer, MzAnalyzerType::IonTrap2D);
        assert_eq!(second.monoisotopic_mz, Some(449.7));
        assert_eq!(second.injection_time, Some(35.0));
        assert_eq!(second.precursor().unwrap().isolation_width(), Some(2.0));

        let checksum = reader.read_checksum()?.unwrap();
        let checksum_end = text.find("<fileChecksum>").unwrap() + "<fileChecksum>".len();
        let mut hasher = HashingStream::new(io::sink());
        hasher.write_all(&buffer[..checksum_end])?;
        assert_eq!(checksum, hasher.compute());
        Ok(())
    }

    #[test]
    fn test_write_plain() -> Result<(), MzMLWriterError> {
        let scans = sample_scans();
        let options = MzMLWriterOptions::default()
            .with_index(false)
            .with_compression(BinaryCompression::NoCompression)
            .with_precision(ArrayPrecision::Float32);
        let mut writer = MzMLWriter::with_options(Vec::new(), options);
        writer.write_all(scans.iter())?;
        let buffer = writer.into_inner()?;
        let text = String::from_utf8_lossy(&buffer).to_string();
        assert!(!text.contains("indexedmzML"));
        assert!(text.contains("MS:1000521"));

        let mut reader = MzMLReader::new(Cursor::new(buffer)).map_err(io::Error::from)?;
        assert_eq!(reader.len(), 2);
        let first = reader.get_spectrum_by_index(0).map_err(io::Error::from)?;
        let mzs = first.array(ArrayType::MZArray).unwrap().decode().unwrap();
        assert_eq!(mzs.len(), 3);
        assert!((mzs[1] - 450.2).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_state_transitions() -> WriterResult {
        let mut writer = MzMLWriter::new(Vec::new());
        writer.close()?;
        let scans = sample_scans();
        assert!(matches!(
            writer.write_spectrum(&scans[0]),
            Err(MzMLWriterError::InvalidActionError(MzMLWriterState::End))
        ));
        assert!(writer
            .add_instrument_configuration(MzAnalyzerType::TOF)
            .is_err());
        Ok(())
    }
}
