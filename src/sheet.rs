use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};

use crate::error::{ImportError, Result};

/// A single cell keeping both the typed underlying value and, via
/// [`Cell::display`], the text a user would see. Displayed text and the
/// underlying value diverge for dates and currency cells, and both matter:
/// detection works on text, date/amount parsing prefers the typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    DateTime(chrono::NaiveDateTime),
    Bool(bool),
}

impl Cell {
    pub fn display(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(s) => s.trim().to_string(),
            Cell::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Cell::DateTime(dt) => dt.format("%d/%m/%Y").to_string(),
            Cell::Bool(b) => b.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

/// An in-memory worksheet. Uploads are fully buffered before parsing because
/// the same range is scanned several times (format detection, header search,
/// month extraction, data rows).
#[derive(Debug, Default)]
pub struct Grid {
    rows: Vec<Vec<Cell>>,
}

impl Grid {
    pub fn from_rows(rows: Vec<Vec<Cell>>) -> Self {
        Self { rows }
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, row: usize) -> &[Cell] {
        self.rows.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        self.rows.get(row).and_then(|r| r.get(col))
    }

    pub fn display_at(&self, row: usize, col: usize) -> String {
        self.cell(row, col).map(Cell::display).unwrap_or_default()
    }

    pub fn populated_in_row(&self, row: usize) -> usize {
        self.row(row).iter().filter(|c| !c.is_empty()).count()
    }

    pub fn is_effectively_empty(&self) -> bool {
        self.rows.iter().all(|r| r.iter().all(Cell::is_empty))
    }
}

fn trim_cell(text: &str) -> String {
    text.trim().trim_start_matches('\u{feff}').trim().to_string()
}

pub fn extension_of(file_name: &str) -> Result<String> {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" | "xls" | "xlsx" => Ok(ext),
        _ => Err(ImportError::UnsupportedExtension(ext)),
    }
}

/// Loads an uploaded blob into a [`Grid`], dispatching on file extension.
pub fn load_grid(file_name: &str, bytes: &[u8]) -> Result<Grid> {
    match extension_of(file_name)?.as_str() {
        "csv" => load_csv(bytes),
        _ => load_workbook(bytes),
    }
}

fn load_csv(bytes: &[u8]) -> Result<Grid> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for rec in reader.records() {
        let rec = rec.map_err(|e| ImportError::WorkbookRead(format!("bad CSV row: {e}")))?;
        rows.push(
            rec.iter()
                .map(|field| {
                    let text = trim_cell(field);
                    if text.is_empty() {
                        Cell::Empty
                    } else {
                        Cell::Text(text)
                    }
                })
                .collect(),
        );
    }
    Ok(Grid::from_rows(rows))
}

fn load_workbook(bytes: &[u8]) -> Result<Grid> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| ImportError::WorkbookRead(format!("failed to open workbook: {e}")))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let first_sheet = sheet_names
        .first()
        .cloned()
        .ok_or_else(|| ImportError::WorkbookRead("workbook contains no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| ImportError::WorkbookRead(format!("failed to read worksheet: {e}")))?;

    let rows = range
        .rows()
        .map(|row| row.iter().map(convert_cell).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    Ok(Grid::from_rows(rows))
}

fn convert_cell(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) => {
            let text = trim_cell(s);
            if text.is_empty() {
                Cell::Empty
            } else {
                Cell::Text(text)
            }
        }
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(naive) => Cell::DateTime(naive),
            None => Cell::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(trim_cell(s)),
    }
}
