//! Ingestion sources: spreadsheets, delimited text, JSON and raw machine logs.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::table::{excel_serial_to_datetime, Cell, Table};

/// Object keys that commonly wrap a record array in API exports.
pub const JSON_WRAPPER_KEYS: &[&str] = &["data", "results", "items", "records"];

/// Anything that can hand the pipelines a table of named columns.
pub trait IngestionSource {
    /// Name used in diagnostics and schema errors.
    fn name(&self) -> String;
    fn read(&self) -> Result<Table>;
}

/// A table stored on disk.
#[derive(Clone, Debug)]
pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IngestionSource for FileSource {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    fn read(&self) -> Result<Table> {
        read_table(&self.path)
    }
}

/// Records that were already fetched, e.g. from a remote source.
#[derive(Clone, Debug)]
pub struct RecordSource {
    pub name: String,
    pub records: Vec<Value>,
}

impl IngestionSource for RecordSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn read(&self) -> Result<Table> {
        Ok(Table::from_json_records(&self.records))
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Read a table, dispatching on the file extension.
pub fn read_table(path: &Path) -> Result<Table> {
    let table = match extension(path).as_str() {
        "csv" => read_delimited(path, Some(b','))?,
        "tsv" => read_delimited(path, Some(b'\t'))?,
        "txt" => read_delimited(path, None)?,
        "json" => read_json(path)?,
        "xlsx" | "xlsm" | "xls" | "ods" => read_spreadsheet(path)?,
        _ => return Err(PipelineError::UnsupportedFormat(path.to_path_buf())),
    };
    debug!(
        path = %path.display(),
        rows = table.len(),
        columns = table.columns.len(),
        "read table"
    );
    Ok(table)
}

// ── Delimited text ──────────────────────────────────────────────────

/// Tab when the header line has a tab, comma otherwise.
fn sniff_delimiter(path: &Path) -> Result<u8> {
    let text = read_latin1(path).map_err(|e| PipelineError::io(path, e))?;
    let header = text.lines().next().unwrap_or_default();
    Ok(if header.contains('\t') { b'\t' } else { b',' })
}

fn read_delimited(path: &Path, delimiter: Option<u8>) -> Result<Table> {
    let delimiter = match delimiter {
        Some(d) => d,
        None => sniff_delimiter(path)?,
    };
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(BufReader::new(file));

    let csv_err = |source| PipelineError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let headers = reader.headers().map_err(csv_err)?.clone();
    let mut table = Table::new(headers.iter());
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        table.push_row(record.iter().map(text_cell).collect());
    }
    Ok(table)
}

fn text_cell(raw: &str) -> Cell {
    if raw.trim().is_empty() {
        Cell::Empty
    } else {
        Cell::Text(raw.to_string())
    }
}

// ── JSON ────────────────────────────────────────────────────────────

fn read_json(path: &Path) -> Result<Table> {
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))?;
    Ok(Table::from_json_records(&json_records(value)))
}

/// Extract records: a top-level array, an object wrapping an array under a known key, or a
/// single object treated as one record.
pub fn json_records(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            for key in JSON_WRAPPER_KEYS {
                if matches!(map.get(*key), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = map.remove(*key) {
                        return items;
                    }
                }
            }
            vec![Value::Object(map)]
        }
        _ => Vec::new(),
    }
}

// ── Spreadsheets ────────────────────────────────────────────────────

/// First sheet that has a header row and at least one data row.
fn read_spreadsheet(path: &Path) -> Result<Table> {
    let spreadsheet_err = |message: String| PipelineError::Spreadsheet {
        path: path.to_path_buf(),
        message,
    };
    let mut workbook = open_workbook_auto(path).map_err(|e| spreadsheet_err(e.to_string()))?;

    for sheet in workbook.sheet_names().to_vec() {
        let range = match workbook.worksheet_range(&sheet) {
            Ok(range) => range,
            Err(e) => {
                warn!(path = %path.display(), sheet = %sheet, error = %e, "skipping unreadable sheet");
                continue;
            }
        };
        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            continue;
        };
        let mut table = Table::new(header.iter().map(|c| data_cell(c).as_text().unwrap_or_default()));
        for row in rows {
            let cells: Vec<Cell> = row.iter().map(data_cell).collect();
            if cells.iter().all(Cell::is_empty) {
                continue;
            }
            table.push_row(cells);
        }
        if !table.is_empty() {
            debug!(path = %path.display(), sheet = %sheet, "using sheet");
            return Ok(table);
        }
    }
    Ok(Table::default())
}

fn data_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::String(s) => text_cell(s),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => excel_serial_to_datetime(dt.as_f64())
            .map_or(Cell::Number(dt.as_f64()), Cell::DateTime),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Error(_) => Cell::Empty,
    }
}

// ── Raw logs ────────────────────────────────────────────────────────

/// Read a whole text file as Latin-1, transparently decompressing `.gz` files.
pub fn read_latin1(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let is_gz = path.to_str().is_some_and(|s| s.ends_with(".gz"));

    let mut bytes = Vec::new();
    if is_gz {
        BufReader::new(GzDecoder::new(file)).read_to_end(&mut bytes)?;
    } else {
        BufReader::new(file).read_to_end(&mut bytes)?;
    }
    Ok(bytes.iter().map(|&b| b as char).collect())
}

// ── Reference data ──────────────────────────────────────────────────

/// Load an optional reference table. A missing file is `Ok(None)`; a file that exists but
/// cannot be read is an error naming the path.
pub fn load_reference(path: &Path) -> Result<Option<Table>> {
    if !path.exists() {
        warn!(path = %path.display(), "reference table not found");
        return Ok(None);
    }
    read_table(path).map(Some).map_err(|e| match e {
        PipelineError::Schema { .. } => e,
        _ => PipelineError::ReferenceUnavailable {
            attempted: vec![path.to_path_buf()],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_json_records_wrappers() {
        assert_eq!(json_records(json!([{"a": 1}, {"a": 2}])).len(), 2);
        assert_eq!(json_records(json!({"results": [{"a": 1}]})), vec![json!({"a": 1})]);
        assert_eq!(
            json_records(json!({"uph": 5, "bom_no": "X"})),
            vec![json!({"uph": 5, "bom_no": "X"})]
        );
        // A wrapper key holding a non-array is just a field.
        assert_eq!(json_records(json!({"data": 3})), vec![json!({"data": 3})]);
        assert!(json_records(json!(42)).is_empty());
    }

    #[test]
    fn test_read_csv_and_tsv() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("in.csv");
        std::fs::write(&csv_path, "bom_no,uph\nABC1,100\nABC1,\n").unwrap();
        let table = read_table(&csv_path).unwrap();
        assert_eq!(table.columns, vec!["bom_no", "uph"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(0, 1).as_f64(), Some(100.0));
        assert_eq!(table.cell(1, 1), &Cell::Empty);

        let txt_path = dir.path().join("in.txt");
        std::fs::write(&txt_path, "bom_no\tuph\nABC1\t7\n").unwrap();
        let table = read_table(&txt_path).unwrap();
        assert_eq!(table.columns, vec!["bom_no", "uph"]);
        assert_eq!(table.cell(0, 1).as_f64(), Some(7.0));
    }

    #[test]
    fn test_read_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.json");
        std::fs::write(&path, r#"{"data": [{"bom_no": "A", "uph": 1.5}]}"#).unwrap();
        let table = FileSource::new(&path).read().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(0, 1).as_f64(), Some(1.5));
    }

    #[test]
    fn test_unsupported_extension() {
        let err = read_table(Path::new("input.parquet")).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_read_latin1_plain_and_gz() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("log.txt");
        std::fs::write(&plain, [b'c', b'a', b'f', 0xE9]).unwrap();
        assert_eq!(read_latin1(&plain).unwrap(), "café");

        let gz = dir.path().join("log.txt.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(b"line1\nline2\n").unwrap();
        enc.finish().unwrap();
        assert_eq!(read_latin1(&gz).unwrap(), "line1\nline2\n");
    }

    #[test]
    fn test_missing_reference_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_reference(&dir.path().join("absent.xlsx")).unwrap().is_none());

        let broken = dir.path().join("broken.xlsx");
        std::fs::write(&broken, b"not a workbook").unwrap();
        let err = load_reference(&broken).unwrap_err();
        assert!(err.to_string().contains("broken.xlsx"));
    }
}
