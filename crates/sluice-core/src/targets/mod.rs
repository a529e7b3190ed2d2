//! The administrator-controlled target allowlist.
//!
//! `target_table` on a pipeline is only ever one of two shapes: a
//! relational `schema.table` registered in the catalog, or `es:<index>`
//! where `<index>` is a registered document index. Everything else is
//! rejected at submission time and again at execution time.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::ContractError;
use crate::sql::validate_identifier;

/// Prefix marking a document-index target, e.g. `es:film_dim`.
pub const ES_TARGET_PREFIX: &str = "es:";

/// A registered relational sink: where rows are upserted and how conflicts
/// are keyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalTarget {
    /// Conflict key of the upsert (the target table's primary key).
    pub key_columns: Vec<String>,
    /// All columns written per row, key columns included.
    pub columns: Vec<String>,
}

/// A registered document index: which field becomes the document id, and
/// optional index mappings applied when the index is first created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTarget {
    pub id_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<serde_json::Value>,
}

/// The full allowlist. Built through the validating `add_*` methods; the
/// configuration layer deserializes raw maps and feeds them through here.
#[derive(Debug, Clone, Default)]
pub struct TargetCatalog {
    relational: BTreeMap<String, RelationalTarget>,
    indices: BTreeMap<String, IndexTarget>,
}

impl TargetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relational target. The table must be `schema.table` and
    /// every column a bare identifier; key columns must be a subset of the
    /// written columns.
    pub fn add_relational(
        &mut self,
        table: impl Into<String>,
        target: RelationalTarget,
    ) -> Result<()> {
        let table = table.into();
        validate_table_name(&table)?;

        if target.key_columns.is_empty() {
            bail!("relational target {table:?} needs at least one key column");
        }
        for col in target.key_columns.iter().chain(target.columns.iter()) {
            validate_identifier(col, "target column")?;
        }
        for key in &target.key_columns {
            if !target.columns.contains(key) {
                bail!("relational target {table:?}: key column {key:?} is not in columns");
            }
        }

        self.relational.insert(table, target);
        Ok(())
    }

    /// Register a document index target.
    pub fn add_index(&mut self, index: impl Into<String>, target: IndexTarget) -> Result<()> {
        let index = index.into();
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("index name {index:?} contains invalid characters");
        }
        validate_identifier(&target.id_field, "index id field")?;

        self.indices.insert(index, target);
        Ok(())
    }

    /// Whether a `target_table` value is allowed at all.
    pub fn is_allowed(&self, target: &str) -> bool {
        let target = target.trim();
        if let Some(index) = target.strip_prefix(ES_TARGET_PREFIX) {
            return self.indices.contains_key(index.trim());
        }
        self.relational.contains_key(target)
    }

    /// Look up the relational entry for a target, or fail the contract.
    pub fn relational(&self, target: &str) -> Result<&RelationalTarget> {
        self.relational
            .get(target.trim())
            .ok_or_else(|| ContractError::TargetNotAllowed(target.to_owned()).into())
    }

    /// Resolve an `es:<index>` target into its index name and entry, or
    /// fail the contract.
    pub fn index(&self, target: &str) -> Result<(&str, &IndexTarget)> {
        let target = target.trim();
        let Some(index) = target.strip_prefix(ES_TARGET_PREFIX) else {
            bail!(ContractError::TargetNotAllowed(target.to_owned()));
        };
        let index = index.trim();
        match self.indices.get_key_value(index) {
            Some((name, entry)) => Ok((name.as_str(), entry)),
            None => bail!(ContractError::TargetNotAllowed(target.to_owned())),
        }
    }

    /// Whether a target names a document index (regardless of registration).
    pub fn is_index_target(target: &str) -> bool {
        target.trim().starts_with(ES_TARGET_PREFIX)
    }
}

fn validate_table_name(table: &str) -> Result<()> {
    let mut parts = table.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(schema), Some(name), None) => {
            validate_identifier(schema, "target schema")?;
            validate_identifier(name, "target table")?;
            Ok(())
        }
        _ => bail!("relational target {table:?} must have the form schema.table"),
    }
}
