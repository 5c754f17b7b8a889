//! A uniform surface for delimited search-result tables
use std::fs;
use std::io::{self, prelude::*, BufReader};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;
use thiserror::Error;

/// One row of a result table, keyed by column in header order
pub type ResultRecord = IndexMap<String, String>;

#[derive(Debug, Error)]
pub enum ResultFileError {
    #[error("Failed to parse the table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The table has no header row")]
    MissingHeader,
    #[error("Row {row} has {found} fields but the header has {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("An IO error occurred: {0}")]
    IOError(#[from] io::Error),
}

/// The operations every search-result reader offers
pub trait ResultFile: Sized {
    type Record;

    /// Whether `path` looks like a file of this kind, without reading all of it
    fn can_read(path: &Path) -> bool;

    fn open(path: &Path) -> Result<Self, ResultFileError>;

    fn count(&self) -> usize {
        self.results().len()
    }

    fn results(&self) -> &[Self::Record];

    fn write_results(&self, path: &Path) -> Result<(), ResultFileError>;
}

/// A header-keyed delimited table, tab separated unless told otherwise
#[derive(Debug, Clone, PartialEq)]
pub struct DelimitedResultFile {
    path: Option<PathBuf>,
    delimiter: u8,
    columns: Vec<String>,
    records: Vec<ResultRecord>,
}

impl Default for DelimitedResultFile {
    fn default() -> Self {
        Self {
            path: None,
            delimiter: b'\t',
            columns: Vec::new(),
            records: Vec::new(),
        }
    }
}

impl DelimitedResultFile {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Add a row. Columns the table has not seen yet are appended to the header.
    pub fn push(&mut self, record: ResultRecord) {
        for key in record.keys() {
            if !self.columns.contains(key) {
                self.columns.push(key.clone());
            }
        }
        self.records.push(record);
    }

    /// The values of one column, in row order
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = Option<&'a str>> + 'a {
        self.records
            .iter()
            .map(move |record| record.get(name).map(|v| v.as_str()))
    }

    pub fn from_reader<R: Read>(reader: R, delimiter: u8) -> Result<Self, ResultFileError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let columns: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|s| s.trim().to_string())
            .collect();
        if columns.iter().all(|c| c.is_empty()) {
            return Err(ResultFileError::MissingHeader);
        }

        let mut records = Vec::new();
        for (i, row) in csv_reader.records().enumerate() {
            let row = row?;
            if row.len() != columns.len() {
                return Err(ResultFileError::RaggedRow {
                    row: i + 1,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
            let record: ResultRecord = columns
                .iter()
                .cloned()
                .zip(row.iter().map(|v| v.to_string()))
                .collect();
            records.push(record);
        }
        debug!("Read {} rows with {} columns", records.len(), columns.len());
        Ok(Self {
            path: None,
            delimiter,
            columns,
            records,
        })
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), ResultFileError> {
        let mut csv_writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(writer);
        csv_writer.write_record(&self.columns)?;
        for record in self.records.iter() {
            csv_writer.write_record(
                self.columns
                    .iter()
                    .map(|c| record.get(c).map(|v| v.as_str()).unwrap_or_default()),
            )?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

impl ResultFile for DelimitedResultFile {
    type Record = ResultRecord;

    fn can_read(path: &Path) -> bool {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if !matches!(extension.as_deref(), Some("tsv" | "txt" | "psmtsv")) {
            return false;
        }
        let Ok(handle) = fs::File::open(path) else {
            return false;
        };
        let mut header = String::new();
        match BufReader::new(handle).read_line(&mut header) {
            Ok(_) => header.contains('\t'),
            Err(_) => false,
        }
    }

    fn open(path: &Path) -> Result<Self, ResultFileError> {
        let handle = BufReader::new(fs::File::open(path)?);
        let mut table = Self::from_reader(handle, b'\t')?;
        table.path = Some(path.to_path_buf());
        Ok(table)
    }

    fn results(&self) -> &[Self::Record] {
        &self.records
    }

    fn write_results(&self, path: &Path) -> Result<(), ResultFileError> {
        let handle = io::BufWriter::new(fs::File::create(path)?);
        self.to_writer(handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PSMS: &str = "File Name\tScan Number\tPrecursor MZ\tBase Sequence\n\
run1.mzML\t12\t450.2\tPEPTIDE\n\
run1.mzML\t40\t623.81\tSAMPLER\n";

    #[test]
    fn test_read_records_in_header_order() -> Result<(), ResultFileError> {
        let table = DelimitedResultFile::from_reader(PSMS.as_bytes(), b'\t')?;
        assert_eq!(table.count(), 2);
        let first = &table.results()[0];
        let keys: Vec<&str> = first.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["File Name", "Scan Number", "Precursor MZ", "Base Sequence"]);
        assert_eq!(first["Scan Number"], "12");
        let sequences: Vec<_> = table.column("Base Sequence").flatten().collect();
        assert_eq!(sequences, vec!["PEPTIDE", "SAMPLER"]);
        Ok(())
    }

    #[test]
    fn test_ragged_row() {
        let text = "a\tb\n1\t2\n3\n";
        match DelimitedResultFile::from_reader(text.as_bytes(), b'\t') {
            Err(ResultFileError::RaggedRow { row, expected, found }) => {
                assert_eq!((row, expected, found), (2, 2, 1));
            }
            other => panic!("Expected a ragged row error, got {other:?}"),
        }
    }

    #[test_log::test]
    fn test_write_and_reopen() -> Result<(), ResultFileError> {
        let dir = tempfile::tempdir()?;
        let mut table = DelimitedResultFile::new(vec!["Scan Number".into(), "Score".into()]);
        let mut record = ResultRecord::new();
        record.insert("Scan Number".into(), "7".into());
        record.insert("Score".into(), "31.5".into());
        table.push(record);
        let mut record = ResultRecord::new();
        record.insert("Scan Number".into(), "9".into());
        record.insert("Decoy".into(), "true".into());
        table.push(record);
        assert_eq!(table.columns(), &["Scan Number", "Score", "Decoy"]);

        let path = dir.path().join("results.psmtsv");
        table.write_results(&path)?;
        assert!(DelimitedResultFile::can_read(&path));
        assert!(!DelimitedResultFile::can_read(&dir.path().join("results.csv")));

        let copy = DelimitedResultFile::open(&path)?;
        assert_eq!(copy.path(), Some(path.as_path()));
        assert_eq!(copy.count(), 2);
        assert_eq!(copy.results()[1]["Score"], "");
        assert_eq!(copy.results()[1]["Decoy"], "true");
        assert_eq!(copy.results()[0]["Score"], "31.5");
        Ok(())
    }
}
