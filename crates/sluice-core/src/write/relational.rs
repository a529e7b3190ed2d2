//! The relational upsert writer.
//!
//! Per-target SQL is generated from the allowlist catalog entry:
//! `INSERT ... ON CONFLICT (<keys>) DO UPDATE SET <col> = EXCLUDED.<col>`.
//! Replaying a batch over an already-populated sink therefore converges on
//! the same rows. NULL cells are emitted as literals so parameter types
//! always match the source value.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgConnection;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;

use crate::error::ContractError;
use crate::record::{Record, Value};
use crate::targets::{RelationalTarget, TargetCatalog};
use crate::write::Writer;

pub struct RelationalWriter {
    catalog: Arc<TargetCatalog>,
}

impl RelationalWriter {
    pub fn new(catalog: Arc<TargetCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Writer for RelationalWriter {
    async fn write(
        &self,
        conn: &mut PgConnection,
        target: &str,
        rows: &[Record],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Allowlist re-check at the execution boundary.
        let entry = self.catalog.relational(target)?;

        for row in rows {
            let (sql, binds) = build_row_statement(target, entry, row)?;
            let mut query = sqlx::query(&sql);
            for value in binds {
                query = bind_value(query, value);
            }
            query
                .execute(&mut *conn)
                .await
                .with_context(|| format!("upsert into {target} failed"))?;
        }

        Ok(rows.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the upsert statement and bind list for one row.
///
/// Cells holding NULL become literal `NULL` in the statement, so the
/// remaining placeholders carry the source value's own type.
fn build_row_statement<'r>(
    table: &str,
    entry: &RelationalTarget,
    row: &'r Record,
) -> Result<(String, Vec<&'r Value>)> {
    let mut placeholders = Vec::with_capacity(entry.columns.len());
    let mut binds = Vec::with_capacity(entry.columns.len());

    for column in &entry.columns {
        let value = row
            .get(column)
            .ok_or_else(|| ContractError::MissingColumn(column.clone()))?;
        if matches!(value, Value::Null) {
            placeholders.push("NULL".to_owned());
        } else {
            binds.push(value);
            placeholders.push(format!("${}", binds.len()));
        }
    }

    let columns = entry.columns.join(", ");
    let placeholders = placeholders.join(", ");
    let keys = entry.key_columns.join(", ");

    let updates: Vec<String> = entry
        .columns
        .iter()
        .filter(|c| !entry.key_columns.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_owned()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let sql = format!(
        "INSERT INTO {table} ({columns}) VALUES ({placeholders}) \
         ON CONFLICT ({keys}) {conflict_action}"
    );

    Ok((sql, binds))
}

fn bind_value<'q>(
    query: Query<'q, sqlx::Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, sqlx::Postgres, PgArguments> {
    match value {
        // NULL cells never reach the bind list.
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Decimal(d) => query.bind(*d),
        Value::Uuid(u) => query.bind(*u),
        Value::Text(s) => query.bind(s.as_str()),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::TimestampTz(ts) => query.bind(*ts),
        Value::Date(d) => query.bind(*d),
        Value::Json(v) => query.bind(v),
    }
}
