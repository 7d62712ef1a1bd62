// 📋 Table - Whole-table batches of loosely typed records
//
// Every cell is an optional string. Blank fields read as null; typed views
// (dates, years, numbers, booleans) are parsed on demand by the stages that
// need them. Files are delimited text, zstd-compressed when the file name
// ends in `.zst`, tab-delimited when the inner extension is `.tsv`.

use crate::error::{LinkageError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

/// A single cell; `None` is a null / missing value
pub type Cell = Option<String>;

/// Separator used when a list-valued cell is flattened to text
pub const LIST_SEPARATOR: &str = "|";

// ============================================================================
// TABLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    /// Human-readable name used in error messages ("roster_2016", "reference")
    name: String,
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    /// Create an empty table with the given header
    pub fn new<I, S>(name: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Table {
            name: name.to_string(),
            columns,
            index,
            rows: Vec::new(),
        }
    }

    /// Build a table from string literals; empty strings become nulls
    pub fn from_literals(name: &str, columns: &[&str], rows: &[&[&str]]) -> Result<Self> {
        let mut table = Table::new(name, columns.iter().copied());
        for row in rows {
            table.push_row(row.iter().map(|v| to_cell(v)).collect())?;
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row(&self, row: usize) -> &[Cell] {
        &self.rows[row]
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    /// Column index, or a configuration error naming this table
    pub fn require_column(&self, column: &str) -> Result<usize> {
        self.column_index(column)
            .ok_or_else(|| LinkageError::MissingColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    /// Cell at (row, column index) as a string slice
    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows[row][col].as_deref()
    }

    /// Cell by column name; `None` when the column is absent or the cell is null
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        self.column_index(column).and_then(|c| self.get(row, c))
    }

    pub fn set(&mut self, row: usize, col: usize, value: Cell) {
        self.rows[row][col] = value;
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(LinkageError::invariant(format!(
                "table '{}': row has {} cells, header has {} columns",
                self.name,
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append a new column; `values` must have one cell per row
    pub fn add_column(&mut self, column: &str, values: Vec<Cell>) -> Result<usize> {
        if self.has_column(column) {
            return Err(LinkageError::config(format!(
                "table '{}' already has a column '{}'",
                self.name, column
            )));
        }
        if values.len() != self.rows.len() {
            return Err(LinkageError::invariant(format!(
                "table '{}': new column '{}' has {} values for {} rows",
                self.name,
                column,
                values.len(),
                self.rows.len()
            )));
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        let idx = self.columns.len();
        self.columns.push(column.to_string());
        self.index.insert(column.to_string(), idx);
        Ok(idx)
    }

    /// Index of `column`, appending an all-null column if it does not exist yet
    pub fn ensure_column(&mut self, column: &str) -> usize {
        if let Some(idx) = self.column_index(column) {
            return idx;
        }
        for row in &mut self.rows {
            row.push(None);
        }
        let idx = self.columns.len();
        self.columns.push(column.to_string());
        self.index.insert(column.to_string(), idx);
        idx
    }

    /// New table with the same header holding only the given rows, in order
    pub fn select_rows(&self, rows: &[usize]) -> Table {
        Table {
            name: self.name.clone(),
            columns: self.columns.clone(),
            index: self.index.clone(),
            rows: rows.iter().map(|&r| self.rows[r].clone()).collect(),
        }
    }

    /// All values of one column (nulls included)
    pub fn column_values(&self, column: &str) -> Result<Vec<Cell>> {
        let col = self.require_column(column)?;
        Ok(self.rows.iter().map(|r| r[col].clone()).collect())
    }

    // ========================================================================
    // FILE IO
    // ========================================================================

    /// Read a delimited (optionally zstd-compressed) file
    pub fn read_path(path: &Path) -> Result<Table> {
        let bytes = fs::read(path).map_err(|e| {
            LinkageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to read {}: {}", path.display(), e),
            ))
        })?;
        let format = FileFormat::from_path(path);
        Table::from_bytes(&table_name(path), &bytes, format)
    }

    /// Write the whole table to `path`, replacing any existing file
    pub fn write_path(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes(FileFormat::from_path(path))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn from_bytes(name: &str, bytes: &[u8], format: FileFormat) -> Result<Table> {
        if format.compressed {
            let decoder = zstd::Decoder::new(bytes)?;
            Table::from_reader(name, decoder, format.delimiter)
        } else {
            Table::from_reader(name, bytes, format.delimiter)
        }
    }

    pub fn to_bytes(&self, format: FileFormat) -> Result<Vec<u8>> {
        if format.compressed {
            let mut encoder = zstd::Encoder::new(Vec::new(), zstd::DEFAULT_COMPRESSION_LEVEL)?;
            self.to_writer(&mut encoder, format.delimiter)?;
            Ok(encoder.finish()?)
        } else {
            let mut out = Vec::new();
            self.to_writer(&mut out, format.delimiter)?;
            Ok(out)
        }
    }

    pub fn from_reader<R: Read>(name: &str, reader: R, delimiter: u8) -> Result<Table> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let mut table = Table::new(name, headers);

        for result in rdr.records() {
            let record = result?;
            table.push_row(record.iter().map(to_cell).collect())?;
        }

        Ok(table)
    }

    pub fn to_writer<W: Write>(&self, writer: W, delimiter: u8) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);

        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(|c| c.as_deref().unwrap_or("")))?;
        }
        wtr.flush()?;
        Ok(())
    }
}

// ============================================================================
// ROW VIEW
// ============================================================================

/// Borrowed view of one row, addressed by column name
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    table: &'a Table,
    row: usize,
}

impl<'a> RowRef<'a> {
    pub fn new(table: &'a Table, row: usize) -> Self {
        RowRef { table, row }
    }

    pub fn index(&self) -> usize {
        self.row
    }

    pub fn value(&self, column: &str) -> Option<&'a str> {
        self.table.value(self.row, column)
    }
}

// ============================================================================
// FILE FORMAT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFormat {
    pub delimiter: u8,
    pub compressed: bool,
}

impl FileFormat {
    pub const CSV: FileFormat = FileFormat {
        delimiter: b',',
        compressed: false,
    };

    pub const CSV_ZSTD: FileFormat = FileFormat {
        delimiter: b',',
        compressed: true,
    };

    /// `x.csv`, `x.csv.zst`, `x.tsv`, `x.tsv.zst`
    pub fn from_path(path: &Path) -> FileFormat {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let compressed = file_name.ends_with(".zst");
        let inner = file_name.trim_end_matches(".zst");
        let delimiter = if inner.ends_with(".tsv") { b'\t' } else { b',' };
        FileFormat {
            delimiter,
            compressed,
        }
    }
}

fn table_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    file_name
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// Blank and whitespace-only fields are nulls
pub fn to_cell(value: &str) -> Cell {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Parse a date (supports YYYY-MM-DD, MM/DD/YYYY and YYYY-MM-DD HH:MM:SS)
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%m/%d/%Y") {
        return Some(date);
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }

    None
}

/// Year of a bare year ("1965", "1965.0") or of a date
pub fn parse_year(value: &str) -> Option<i32> {
    let trimmed = value.trim();
    if let Ok(number) = trimmed.parse::<f64>() {
        if number.fract() == 0.0 && (1000.0..=9999.0).contains(&number) {
            return Some(number as i32);
        }
        return None;
    }
    use chrono::Datelike;
    parse_date(trimmed).map(|d| d.year())
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Total order over loosely typed values: numeric, then boolean, then date,
/// then plain text
pub fn compare_values(a: &str, b: &str) -> Ordering {
    if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (parse_bool(a), parse_bool(b)) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (parse_date(a), parse_date(b)) {
        return x.cmp(&y);
    }
    a.cmp(b)
}

// ============================================================================
// TESTS
// ============================================================================
