//! Driver-neutral result rows.
//!
//! Rows are decoded from `sqlx` at the connection boundary so that the
//! collector never depends on driver types.

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::postgres::types::Oid;
use sqlx::{Column, Row, TypeInfo};

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Unix epoch seconds.
    Timestamp(f64),
    Text(String),
}

impl CellValue {
    /// Numeric value for a metric sample.
    ///
    /// Booleans map to 0/1 and text is accepted only if it parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            CellValue::Timestamp(v) => Some(*v),
            CellValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Label value for a metric sample. Null becomes the empty string.
    pub fn as_label(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(v) => v.to_string(),
            CellValue::Int(v) => v.to_string(),
            CellValue::Float(v) | CellValue::Timestamp(v) => v.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CellValue::Null)
    }
}

/// One result row: column names with their decoded values, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow {
    columns: Vec<(String, CellValue)>,
}

impl ResultRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column to this row.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }

    /// Value of the first column with the given name.
    pub fn get(&self, name: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Decode a PostgreSQL row.
    pub fn from_pg_row(row: &PgRow) -> Self {
        let columns = row
            .columns()
            .iter()
            .map(|column| {
                let value = decode_cell(row, column.ordinal(), column.type_info().name());
                (column.name().to_string(), value)
            })
            .collect();

        Self { columns }
    }
}

/// Decode a single cell by its PostgreSQL type name.
///
/// Types without a dedicated mapping (NUMERIC, INTERVAL, ...) are read as
/// their text form, which rows fetched over the simple query protocol carry.
fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> CellValue {
    let decoded = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(CellValue::from),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .map(|v| CellValue::from(v.map(i64::from))),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .map(|v| CellValue::from(v.map(i64::from))),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(CellValue::from),
        "OID" => row
            .try_get::<Option<Oid>, _>(idx)
            .map(|v| CellValue::from(v.map(|oid| i64::from(oid.0)))),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| CellValue::from(v.map(f64::from))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(CellValue::from),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| v.map_or(CellValue::Null, |ts| timestamp_value(&ts))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .map(|v| v.map_or(CellValue::Null, |ts| timestamp_value(&ts.and_utc()))),
        _ => row
            .try_get_unchecked::<Option<String>, _>(idx)
            .map(|v| v.map_or(CellValue::Null, CellValue::Text)),
    };

    match decoded {
        Ok(value) => value,
        Err(e) => {
            tracing::trace!(column = idx, type_name, error = %e, "Undecodable column");
            CellValue::Null
        }
    }
}

fn timestamp_value(ts: &DateTime<Utc>) -> CellValue {
    CellValue::Timestamp(ts.timestamp_micros() as f64 / 1_000_000.0)
}
