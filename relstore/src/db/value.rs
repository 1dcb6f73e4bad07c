use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Arguments;
use sqlx::Row;
use sqlx::postgres::{PgArguments, PgRow};
use uuid::Uuid;

use crate::db::DbError;

/// Kinds of values a column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Uuid,
    Timestamp,
    Json,
}

/// A column value resolved once when a command is built.
///
/// Nulls keep their kind so the backend can be handed a typed null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null(ValueKind),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub const fn kind(&self) -> ValueKind {
        match self {
            ColumnValue::Null(kind) => *kind,
            ColumnValue::Bool(_) => ValueKind::Bool,
            ColumnValue::Int(_) => ValueKind::Int,
            ColumnValue::Float(_) => ValueKind::Float,
            ColumnValue::Text(_) => ValueKind::Text,
            ColumnValue::Bytes(_) => ValueKind::Bytes,
            ColumnValue::Uuid(_) => ValueKind::Uuid,
            ColumnValue::Timestamp(_) => ValueKind::Timestamp,
            ColumnValue::Json(_) => ValueKind::Json,
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null(_))
    }

    /// Binds the value as the next positional argument.
    pub fn bind(&self, args: &mut PgArguments) -> Result<(), DbError> {
        let res = match self {
            ColumnValue::Null(kind) => match kind {
                ValueKind::Bool => args.add(None::<bool>),
                ValueKind::Int => args.add(None::<i64>),
                ValueKind::Float => args.add(None::<f64>),
                ValueKind::Text => args.add(None::<String>),
                ValueKind::Bytes => args.add(None::<Vec<u8>>),
                ValueKind::Uuid => args.add(None::<Uuid>),
                ValueKind::Timestamp => args.add(None::<DateTime<Utc>>),
                ValueKind::Json => args.add(None::<serde_json::Value>),
            },
            ColumnValue::Bool(v) => args.add(*v),
            ColumnValue::Int(v) => args.add(*v),
            ColumnValue::Float(v) => args.add(*v),
            ColumnValue::Text(v) => args.add(v.clone()),
            ColumnValue::Bytes(v) => args.add(v.clone()),
            ColumnValue::Uuid(v) => args.add(*v),
            ColumnValue::Timestamp(v) => args.add(*v),
            ColumnValue::Json(v) => args.add(v.clone()),
        };
        res.map_err(|e| DbError::Bind(e.to_string()))
    }

    /// Reads a column of the given kind back out of a result row.
    pub fn decode(row: &PgRow, column: &str, kind: ValueKind) -> Result<Self, DbError> {
        let value = match kind {
            ValueKind::Bool => row.try_get::<Option<bool>, _>(column)?.map(ColumnValue::Bool),
            ValueKind::Int => row.try_get::<Option<i64>, _>(column)?.map(ColumnValue::Int),
            ValueKind::Float => row.try_get::<Option<f64>, _>(column)?.map(ColumnValue::Float),
            ValueKind::Text => row.try_get::<Option<String>, _>(column)?.map(ColumnValue::Text),
            ValueKind::Bytes => row.try_get::<Option<Vec<u8>>, _>(column)?.map(ColumnValue::Bytes),
            ValueKind::Uuid => row.try_get::<Option<Uuid>, _>(column)?.map(ColumnValue::Uuid),
            ValueKind::Timestamp => row
                .try_get::<Option<DateTime<Utc>>, _>(column)?
                .map(ColumnValue::Timestamp),
            ValueKind::Json => row
                .try_get::<Option<serde_json::Value>, _>(column)?
                .map(ColumnValue::Json),
        };
        Ok(value.unwrap_or(ColumnValue::Null(kind)))
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null(_) => f.write_str("NULL"),
            ColumnValue::Bool(v) => write!(f, "{v}"),
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Text(v) => write!(f, "'{v}'"),
            ColumnValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            ColumnValue::Uuid(v) => write!(f, "{v}"),
            ColumnValue::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            ColumnValue::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Int(i64::from(v))
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Float(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<Uuid> for ColumnValue {
    fn from(v: Uuid) -> Self {
        ColumnValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(v: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(v)
    }
}
