//! Bulk row interchange files.
//!
//! Every phase of a run reads and writes delimited, header-first files, one
//! per table per phase. NULL is an unquoted empty field, which is what
//! `COPY ... WITH (FORMAT csv, HEADER true, NULL '')` produces and expects.

use csv::{ReaderBuilder, StringRecord, Writer};
use indexmap::IndexMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One row: column name to text value, in header order. Empty means NULL.
pub type Row = IndexMap<String, String>;

/// The file kinds written during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Raw export of a source table.
    Export,
    /// First-pass rows to insert.
    Insert,
    /// First-pass rows to update (matched records and deferred columns).
    Update,
    /// Postprocessed rows to insert.
    PostInsert,
    /// Postprocessed rows to update.
    PostUpdate,
}

impl Phase {
    pub fn suffix(self) -> &'static str {
        match self {
            Phase::Export => ".csv",
            Phase::Insert => ".target.csv",
            Phase::Update => ".update.csv",
            Phase::PostInsert => ".target2.csv",
            Phase::PostUpdate => ".update2.csv",
        }
    }
}

/// Path of the file holding `table` for `phase` inside `dir`.
pub fn phase_path(dir: &Path, table: &str, phase: Phase) -> PathBuf {
    dir.join(format!("{}{}", table, phase.suffix()))
}

/// Path an update file is renamed to when its table could not be loaded.
pub fn disabled_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".disabled");
    PathBuf::from(name)
}

/// Read only the header of an interchange file.
pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

/// True when the file holds at least one data row.
pub fn has_rows(path: &Path) -> Result<bool> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut record = StringRecord::new();
    Ok(reader.read_record(&mut record)?)
}

/// Streaming reader yielding [`Row`]s.
pub struct TableReader {
    headers: Vec<String>,
    reader: csv::Reader<File>,
}

impl TableReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self { headers, reader })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Read the next row, or `None` at end of file.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        let mut record = StringRecord::new();
        if !self.reader.read_record(&mut record)? {
            return Ok(None);
        }
        let row = self
            .headers
            .iter()
            .zip(record.iter())
            .map(|(column, value)| (column.clone(), value.to_string()))
            .collect();
        Ok(Some(row))
    }
}

/// Writer emitting rows under a fixed header; absent columns become NULL.
pub struct RowWriter {
    columns: Vec<String>,
    writer: Writer<File>,
    rows: u64,
}

impl RowWriter {
    /// Create (or truncate) `path` and write the header.
    pub fn create(path: &Path, columns: &[String]) -> Result<Self> {
        let mut writer = Writer::from_path(path)?;
        writer.write_record(columns)?;
        Ok(Self {
            columns: columns.to_vec(),
            writer,
            rows: 0,
        })
    }

    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        let record = self
            .columns
            .iter()
            .map(|column| row.get(column).map(String::as_str).unwrap_or(""));
        self.writer.write_record(record)?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_phase_paths() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            phase_path(dir, "res_partner", Phase::PostUpdate),
            PathBuf::from("/tmp/run/res_partner.update2.csv")
        );
        assert_eq!(
            disabled_path(&phase_path(dir, "res_partner", Phase::PostUpdate)),
            PathBuf::from("/tmp/run/res_partner.update2.csv.disabled")
        );
    }

    #[test]
    fn test_writer_fills_missing_columns_with_null() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t2.target.csv");
        let columns = vec!["id".to_string(), "label".to_string(), "parent_id".to_string()];

        let mut writer = RowWriter::create(&path, &columns).unwrap();
        writer.write_row(&row(&[("id", "101"), ("label", "a, b")])).unwrap();
        assert_eq!(writer.finish().unwrap(), 1);

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "id,label,parent_id\n101,\"a, b\",\n");

        let mut reader = TableReader::open(&path).unwrap();
        assert_eq!(reader.headers(), columns.as_slice());
        let read = reader.next_row().unwrap().unwrap();
        assert_eq!(read["label"], "a, b");
        assert_eq!(read["parent_id"], "");
        assert!(reader.next_row().unwrap().is_none());
    }

    #[test]
    fn test_has_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");
        RowWriter::create(&path, &["id".to_string()])
            .unwrap()
            .finish()
            .unwrap();
        assert!(!has_rows(&path).unwrap());
        assert_eq!(read_header(&path).unwrap(), vec!["id"]);
    }
}
