//! Row materialization.
//!
//! Source rows are decoded into [`Record`]s -- maps from column name to a
//! small ETL value enum -- so transforms and writers can work on rows
//! without knowing the source query's shape. JSON normalization for the
//! document-index writer lives here too: UUIDs become strings, decimals
//! become floats, dates and timestamps become ISO-8601 strings.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use uuid::Uuid;

/// A single cell value read from a source row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Uuid(Uuid),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(serde_json::Value),
}

/// One materialized source row, keyed by column name.
pub type Record = BTreeMap<String, Value>;

impl Value {
    /// Interpret the value as a timestamp cursor, if it is one.
    ///
    /// Timezone-aware values are normalized to UTC and the zone dropped so
    /// both timestamp flavours produce comparable cursors.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::TimestampTz(ts) => Some(ts.naive_utc()),
            _ => None,
        }
    }

    /// Render the value as a cursor id string (the tie-breaker half of a
    /// checkpoint is stored as text regardless of its column type).
    pub fn to_cursor_id(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Uuid(u) => u.to_string(),
            Value::Text(s) => s.clone(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Value::TimestampTz(ts) => ts.to_rfc3339(),
            Value::Date(d) => d.to_string(),
            Value::Json(v) => v.to_string(),
        }
    }

    /// A short type label for error messages.
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Uuid(_) => "uuid",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Date(_) => "date",
            Value::Json(_) => "json",
        }
    }
}

/// Decode a Postgres row into a [`Record`] by column type.
pub fn record_from_row(row: &PgRow) -> Result<Record> {
    let mut record = Record::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_owned();
        let type_name = column.type_info().name().to_owned();

        let value = decode_cell(row, idx, &type_name)
            .with_context(|| format!("failed to decode column {name:?} ({type_name})"))?;

        record.insert(name, value);
    }

    Ok(record)
}

fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Result<Value> {
    let value = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::Int(v as i64)),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::Int(v as i64)),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float(v as f64)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "NUMERIC" => row.try_get::<Option<Decimal>, _>(idx)?.map(Value::Decimal),
        "UUID" => row.try_get::<Option<Uuid>, _>(idx)?.map(Value::Uuid),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(Value::Text)
        }
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(Value::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(Value::TimestampTz),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(idx)?.map(Value::Date),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(Value::Json),
        other => bail!("unsupported source column type {other}"),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Normalize a value for a JSON document sink.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Decimal(d) => d
            .to_f64()
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Timestamp(ts) => {
            serde_json::Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        Value::TimestampTz(ts) => serde_json::Value::String(ts.to_rfc3339()),
        Value::Date(d) => serde_json::Value::String(d.to_string()),
        Value::Json(v) => v.clone(),
    }
}

/// Normalize a whole record into a JSON object.
pub fn record_to_json(record: &Record) -> serde_json::Map<String, serde_json::Value> {
    record
        .iter()
        .map(|(k, v)| (k.clone(), to_json(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn uuid_normalizes_to_string() {
        let u = Uuid::new_v4();
        assert_eq!(
            to_json(&Value::Uuid(u)),
            serde_json::Value::String(u.to_string())
        );
    }

    #[test]
    fn decimal_normalizes_to_float() {
        let d: Decimal = "12.50".parse().unwrap();
        assert_eq!(to_json(&Value::Decimal(d)), serde_json::json!(12.5));
    }

    #[test]
    fn timestamp_normalizes_to_iso() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 1, 0)
            .unwrap();
        assert_eq!(
            to_json(&Value::Timestamp(ts)),
            serde_json::json!("2024-01-01T00:01:00")
        );
    }

    #[test]
    fn date_normalizes_to_iso() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(to_json(&Value::Date(d)), serde_json::json!("2024-03-15"));
    }

    #[test]
    fn timestamptz_cursor_drops_zone() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T03:00:00+03:00")
            .unwrap()
            .with_timezone(&Utc);
        let cursor = Value::TimestampTz(ts).as_timestamp().unwrap();
        assert_eq!(cursor.to_string(), "2024-01-01 00:00:00");
    }

    #[test]
    fn text_is_not_a_timestamp() {
        assert!(Value::Text("2024-01-01".into()).as_timestamp().is_none());
        assert!(Value::Null.as_timestamp().is_none());
    }

    #[test]
    fn cursor_id_rendering() {
        assert_eq!(Value::Int(42).to_cursor_id(), "42");
        assert_eq!(Value::Text("abc".into()).to_cursor_id(), "abc");
        let u = Uuid::new_v4();
        assert_eq!(Value::Uuid(u).to_cursor_id(), u.to_string());
    }
}
