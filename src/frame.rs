//! Historical event tables fed to replays.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;

use crate::primitive::{Primitive, Value};

/// A nullable cell.
pub type Cell = Option<Value>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row {row} has {actual} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),
}

/// Column-named rows of primitive cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFrame {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl EventFrame {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Result<Self, FrameError> {
        let mut seen = HashSet::new();
        let columns: Vec<String> = columns.iter().map(|c| c.as_ref().to_string()).collect();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(FrameError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn from_rows<S: AsRef<str>>(
        columns: &[S],
        rows: Vec<Vec<Cell>>,
    ) -> Result<Self, FrameError> {
        let mut frame = Self::new(columns)?;
        for row in rows {
            frame.push_row(row)?;
        }
        Ok(frame)
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), FrameError> {
        if row.len() != self.columns.len() {
            return Err(FrameError::RowWidth {
                row: self.rows.len(),
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Cell> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Reads a headed CSV. Each column gets the narrowest type all its
    /// non-empty cells share (int, float, bool, timestamp), else string.
    /// Empty cells are null.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, FrameError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let columns: Vec<&str> = headers.iter().collect();
        let mut raw: Vec<Vec<String>> = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != columns.len() {
                return Err(FrameError::RowWidth {
                    row: idx,
                    expected: columns.len(),
                    actual: record.len(),
                });
            }
            raw.push(record.iter().map(str::to_string).collect());
        }

        let types: Vec<Option<Primitive>> = (0..columns.len())
            .map(|c| infer_column(raw.iter().map(|row| row[c].as_str())))
            .collect();
        let rows = raw
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&types)
                    .map(|(cell, ty)| typed_cell(&cell, *ty))
                    .collect()
            })
            .collect();
        let frame = Self::from_rows(&columns, rows)?;
        debug!(
            component = "frame",
            event = "frame.csv.loaded",
            rows = frame.len(),
            columns = frame.columns.len(),
            "loaded CSV event frame"
        );
        Ok(frame)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, FrameError> {
        Self::from_csv_reader(File::open(path)?)
    }

    /// Runs `sql` and keeps SQLite's storage classes. Blobs become hex strings.
    pub fn from_sqlite(conn: &Connection, sql: &str) -> Result<Self, FrameError> {
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let mut frame = Self::new(&columns)?;

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                cells.push(match row.get_ref(idx)? {
                    ValueRef::Null => None,
                    ValueRef::Integer(i) => Some(Value::Int(i)),
                    ValueRef::Real(f) => Some(Value::Float(f)),
                    ValueRef::Text(t) => Some(Value::Str(String::from_utf8_lossy(t).into_owned())),
                    ValueRef::Blob(b) => Some(Value::Str(hex::encode(b))),
                });
            }
            frame.push_row(cells)?;
        }
        debug!(
            component = "frame",
            event = "frame.sqlite.loaded",
            rows = frame.len(),
            columns = width,
            "loaded SQLite event frame"
        );
        Ok(frame)
    }
}

fn infer_column<'a>(cells: impl Iterator<Item = &'a str>) -> Option<Primitive> {
    let mut candidates = [
        Primitive::Integer,
        Primitive::Float,
        Primitive::Boolean,
        Primitive::Timestamp,
    ]
    .to_vec();
    let mut any = false;
    for cell in cells.filter(|c| !c.is_empty()) {
        any = true;
        candidates.retain(|p| typed_cell(cell, Some(*p)).is_some_and(|v| v.primitive() == Some(*p)));
        if candidates.is_empty() {
            return Some(Primitive::String);
        }
    }
    if !any {
        return None;
    }
    candidates.first().copied()
}

fn typed_cell(raw: &str, primitive: Option<Primitive>) -> Cell {
    if raw.is_empty() {
        return None;
    }
    let parsed = match primitive {
        Some(Primitive::Integer) => raw.parse::<i64>().ok().map(Value::Int),
        Some(Primitive::Float) => raw.parse::<f64>().ok().map(Value::Float),
        Some(Primitive::Boolean) => match raw.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        Some(Primitive::Timestamp) => parse_timestamp(raw).map(Value::Timestamp),
        _ => None,
    };
    Some(parsed.unwrap_or_else(|| Value::Str(raw.to_string())))
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parses RFC 3339, `%Y-%m-%d %H:%M:%S[.f]` (space or `T`) and `%Y-%m-%d`.
/// Naive inputs are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Reads a cell as a timestamp: timestamps as-is, strings parsed, integers as epoch milliseconds.
pub fn cell_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Str(raw) => parse_timestamp(raw),
        Value::Int(ms) => DateTime::from_timestamp_millis(*ms),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn csv_columns_get_inferred_types() {
        let csv = "\
ts,id,amount,flag,note
2024-01-01 00:00:00,1,3,true,x
2024-01-01T00:30:00Z,2,4.5,false,
2024-01-01,3,,TRUE,z
";
        let frame = EventFrame::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(frame.columns(), ["ts", "id", "amount", "flag", "note"]);
        assert_eq!(frame.len(), 3);
        let row = &frame.rows()[1];
        assert_eq!(
            row[0],
            Some(Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()))
        );
        assert_eq!(row[1], Some(Value::Int(2)));
        assert_eq!(row[2], Some(Value::Float(4.5)));
        assert_eq!(row[3], Some(Value::Bool(false)));
        assert_eq!(row[4], None);
        assert_eq!(frame.rows()[2][2], None);
        assert_eq!(frame.rows()[0][2], Some(Value::Float(3.0)));
    }

    #[test]
    fn rejects_ragged_and_duplicate_columns() {
        assert!(matches!(
            EventFrame::new(&["a", "a"]),
            Err(FrameError::DuplicateColumn(_))
        ));
        let mut frame = EventFrame::new(&["a", "b"]).unwrap();
        assert!(matches!(
            frame.push_row(vec![None]),
            Err(FrameError::RowWidth { expected: 2, actual: 1, .. })
        ));
    }

    #[test]
    fn reads_sqlite_queries() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE events (ts TEXT, id INTEGER, amount REAL, note TEXT);
             INSERT INTO events VALUES ('2024-01-01 00:00:00', 1, 2.5, NULL);",
        )
        .unwrap();
        let frame = EventFrame::from_sqlite(&conn, "SELECT * FROM events").unwrap();
        assert_eq!(frame.columns(), ["ts", "id", "amount", "note"]);
        assert_eq!(
            frame.rows()[0],
            vec![
                Some(Value::from("2024-01-01 00:00:00")),
                Some(Value::Int(1)),
                Some(Value::Float(2.5)),
                None
            ]
        );
    }

    #[test]
    fn timestamps_parse_from_common_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_timestamp("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T03:04:05.000"), Some(expected));
        assert!(parse_timestamp("yesterday").is_none());
        assert_eq!(
            cell_timestamp(&Value::Int(expected.timestamp_millis())),
            Some(expected)
        );
    }
}
