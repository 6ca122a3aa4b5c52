use std::io::Cursor;

use bytes::Bytes;
use calamine::{DataType, Range, Reader, Xlsx};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};
use thiserror::Error;

use reconcile_common::record::RawRow;

pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Error, Debug)]
pub enum SpreadsheetError {
    #[error("failed to read xlsx workbook: {0}")]
    Workbook(String),
    #[error("failed to read sheet {0}: {1}")]
    Sheet(String, String),
    #[error("workbook holds no sheet")]
    NoSheets,
}

/// An uploaded workbook, read lazily one sheet at a time.
pub struct Workbook {
    inner: Xlsx<Cursor<Bytes>>,
}

impl Workbook {
    pub fn open(data: Bytes) -> Result<Self, SpreadsheetError> {
        let inner =
            Xlsx::new(Cursor::new(data)).map_err(|e| SpreadsheetError::Workbook(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.inner.sheet_names().to_vec()
    }

    pub fn sheet(&mut self, name: &str) -> Result<SheetRows, SpreadsheetError> {
        match self.inner.worksheet_range(name) {
            Some(Ok(range)) => Ok(SheetRows::new(range)),
            Some(Err(e)) => Err(SpreadsheetError::Sheet(name.to_owned(), e.to_string())),
            None => Err(SpreadsheetError::Sheet(
                name.to_owned(),
                "no such sheet".to_owned(),
            )),
        }
    }

    pub fn first_sheet(&mut self) -> Result<SheetRows, SpreadsheetError> {
        let name = self
            .sheet_names()
            .into_iter()
            .next()
            .ok_or(SpreadsheetError::NoSheets)?;
        self.sheet(&name)
    }

    /// Rows of every sheet, in sheet order.
    pub fn all_sheets(&mut self) -> Result<impl Iterator<Item = RawRow>, SpreadsheetError> {
        let names = self.sheet_names();
        if names.is_empty() {
            return Err(SpreadsheetError::NoSheets);
        }

        let sheets = names
            .iter()
            .map(|name| self.sheet(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sheets.into_iter().flatten())
    }
}

/// The data rows of one sheet as header → value mappings. The first row is the header.
/// Single pass: once consumed the rows are gone.
pub struct SheetRows {
    range: Range<DataType>,
    headers: Vec<String>,
    next_row: usize,
}

impl SheetRows {
    fn new(range: Range<DataType>) -> Self {
        let headers = (0..range.width())
            .map(|col| {
                range
                    .get((0, col))
                    .and_then(header_text)
                    .unwrap_or_else(|| format!("Unnamed: {col}"))
            })
            .collect();

        Self {
            range,
            headers,
            next_row: 1,
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl Iterator for SheetRows {
    type Item = RawRow;

    fn next(&mut self) -> Option<RawRow> {
        if self.next_row >= self.range.height() {
            return None;
        }
        let row = self.next_row;
        self.next_row += 1;

        let mut out = RawRow::new();
        for (col, header) in self.headers.iter().enumerate() {
            let value = self
                .range
                .get((row, col))
                .map(cell_value)
                .unwrap_or(Value::Null);
            out.insert(header.clone(), value);
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.range.height().saturating_sub(self.next_row);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SheetRows {}

fn header_text(cell: &DataType) -> Option<String> {
    match cell_value(cell) {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn cell_value(cell: &DataType) -> Value {
    match cell {
        DataType::Empty | DataType::Error(_) => Value::Null,
        DataType::String(s) => Value::String(s.clone()),
        DataType::Int(v) => Value::from(*v),
        DataType::Float(v) | DataType::Duration(v) => {
            Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null)
        }
        DataType::Bool(b) => Value::Bool(*b),
        DataType::DateTime(serial) => excel_datetime(*serial)
            .map(|ts| Value::String(ts.format("%Y-%m-%dT%H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        DataType::DateTimeIso(s) | DataType::DurationIso(s) => Value::String(s.clone()),
    }
}

/// Excel stores dates as days since 1899-12-30 (the 1900 leap-year bug included).
fn excel_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (serial * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(Duration::milliseconds(millis))
}
