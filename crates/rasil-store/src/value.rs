//! The typed bridge between repository code and the two SQL backends.
//!
//! `Value::Timestamp` is the backend sniff the rest of the system relies on:
//! the SQLite backend binds it as an ISO-8601 string, the PostgreSQL backend
//! as a native timestamp. Repositories never look at the backend kind.

use chrono::NaiveDateTime;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// One fetched row: column names plus values in select order.
#[derive(Debug, Clone, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    fn value(&self, column: &str) -> Result<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
            .ok_or_else(|| StoreError::NotFound(format!("column {}", column)))
    }

    pub fn i64(&self, column: &str) -> Result<i64> {
        match self.value(column)? {
            Value::Int(v) => Ok(*v),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(self.type_err(column, "int", other)),
        }
    }

    pub fn opt_i64(&self, column: &str) -> Result<Option<i64>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            _ => self.i64(column).map(Some),
        }
    }

    pub fn text(&self, column: &str) -> Result<String> {
        match self.value(column)? {
            Value::Text(v) => Ok(v.clone()),
            Value::Int(v) => Ok(v.to_string()),
            other => Err(self.type_err(column, "text", other)),
        }
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<String>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            _ => self.text(column).map(Some),
        }
    }

    pub fn bool(&self, column: &str) -> Result<bool> {
        match self.value(column)? {
            Value::Bool(v) => Ok(*v),
            Value::Int(v) => Ok(*v != 0),
            other => Err(self.type_err(column, "bool", other)),
        }
    }

    /// Timestamps come back as native values from postgres and as ISO-8601
    /// strings from sqlite; both are accepted.
    pub fn timestamp(&self, column: &str) -> Result<NaiveDateTime> {
        match self.value(column)? {
            Value::Timestamp(v) => Ok(*v),
            Value::Text(s) => parse_timestamp(s)
                .ok_or_else(|| self.type_err(column, "timestamp", &Value::Text(s.clone()))),
            other => Err(self.type_err(column, "timestamp", other)),
        }
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<NaiveDateTime>> {
        match self.value(column)? {
            Value::Null => Ok(None),
            _ => self.timestamp(column).map(Some),
        }
    }

    fn type_err(&self, column: &str, expected: &'static str, got: &Value) -> StoreError {
        StoreError::ColumnType {
            column: column.to_string(),
            expected,
            got: got.type_name(),
        }
    }
}

/// Accepts the formats the two backends actually produce: ISO-8601 with or
/// without fractional seconds, with or without a `T` separator or a trailing
/// `Z`.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim().trim_end_matches('Z');
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    None
}

/// Canonical string form for timestamps stored in the embedded backend.
/// Space-separated to stay lexicographically comparable with SQLite's
/// CURRENT_TIMESTAMP default.
pub fn format_timestamp(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(10, 0, 2)
            .unwrap()
    }

    #[test]
    fn timestamp_string_round_trips() {
        let s = format_timestamp(&dt());
        assert_eq!(parse_timestamp(&s).unwrap(), dt());
    }

    #[test]
    fn parses_space_separated_and_zulu_forms() {
        assert_eq!(parse_timestamp("2024-03-05 10:00:02").unwrap(), dt());
        assert_eq!(parse_timestamp("2024-03-05T10:00:02Z").unwrap(), dt());
    }

    #[test]
    fn row_getters_coerce_sqlite_booleans() {
        let row = Row::new(
            vec!["is_active".into(), "name".into()],
            vec![Value::Int(1), Value::Null],
        );
        assert!(row.bool("is_active").unwrap());
        assert_eq!(row.opt_text("name").unwrap(), None);
    }

    #[test]
    fn option_into_value_maps_none_to_null() {
        let v: Value = Option::<String>::None.into();
        assert_eq!(v, Value::Null);
        let v: Value = Some("x").into();
        assert_eq!(v, Value::Text("x".into()));
    }
}
