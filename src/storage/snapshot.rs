//! Full-database snapshot representation.
//!
//! Wire shape: `{ "tables": { "<table>": [ { "<column>": <scalar> }, ... ] } }`.
//! Structured columns travel as JSON-encoded strings inside a row.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

use super::error::{StorageError, StorageResult};

/// One row: column name to scalar value.
pub type SnapshotRow = Map<String, Value>;

/// Point-in-time export of every known table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub tables: BTreeMap<String, Vec<SnapshotRow>>,
}

impl DatabaseSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of a table, if the snapshot carries it.
    pub fn table(&self, name: &str) -> Option<&[SnapshotRow]> {
        self.tables.get(name).map(Vec::as_slice)
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn to_json_bytes(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_slice(bytes: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Decode a SQLite row into a snapshot row using each value's storage class.
pub(crate) fn decode_row(row: &SqliteRow) -> StorageResult<SnapshotRow> {
    let mut out = Map::new();

    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
                "REAL" | "NUMERIC" => Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
                    Value::String(BASE64.encode(bytes))
                }
                _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };

        out.insert(column.name().to_string(), value);
    }

    Ok(out)
}

/// Scalar form of a snapshot value, ready to bind into an INSERT.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BindValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<&Value> for BindValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => BindValue::Null,
            Value::Bool(b) => BindValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => BindValue::Integer(i),
                None => BindValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => BindValue::Text(s.clone()),
            // Structured values are stored as JSON text
            structured => BindValue::Text(structured.to_string()),
        }
    }
}

impl TryFrom<&[u8]> for DatabaseSnapshot {
    type Error = StorageError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_json_slice(bytes)
    }
}
