//! Row transforms.
//!
//! A transform is a named, registered operation over a batch of records.
//! Pipelines reference transforms by identifier; the registry resolves the
//! identifier at execution time. Identifiers must lie under the
//! administrator-controlled namespace prefix so a pipeline definition can
//! only ever reach code that was deliberately registered.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::error::ContractError;
use crate::record::Record;

/// Namespace prefix every registered transform identifier must carry.
pub const TRANSFORM_NAMESPACE: &str = "transforms.";

/// A batch row-transform.
///
/// Implementations may be pure or suspending (I/O-backed lookups are
/// legal). Returning an empty batch short-circuits the remaining chain
/// for that batch.
#[async_trait]
pub trait Transform: Send + Sync {
    /// The registered identifier, e.g. `transforms.normalize_title`.
    fn name(&self) -> &str;

    /// Transform one batch of records.
    async fn apply(&self, rows: Vec<Record>) -> Result<Vec<Record>>;
}

/// The identity transform used by pipelines without a transform step.
pub struct NoopTransform;

#[async_trait]
impl Transform for NoopTransform {
    fn name(&self) -> &str {
        "transforms.noop"
    }

    async fn apply(&self, rows: Vec<Record>) -> Result<Vec<Record>> {
        Ok(rows)
    }
}

/// A transform built from a plain function, for registration without a
/// dedicated type (and for tests).
pub struct FnTransform {
    name: String,
    f: Box<dyn Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync>,
}

impl FnTransform {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(Vec<Record>) -> Result<Vec<Record>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Transform for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, rows: Vec<Record>) -> Result<Vec<Record>> {
        (self.f)(rows)
    }
}

/// Registry of available transforms, keyed by identifier.
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    /// Create a registry containing only the no-op transform.
    pub fn new() -> Self {
        let mut registry = Self {
            transforms: HashMap::new(),
        };
        registry
            .register(Arc::new(NoopTransform))
            .expect("the no-op transform name is namespaced");
        registry
    }

    /// Register a transform under its own name.
    ///
    /// The name must lie under [`TRANSFORM_NAMESPACE`]; registering a
    /// second transform under an existing name replaces the first.
    pub fn register(&mut self, transform: Arc<dyn Transform>) -> Result<()> {
        let name = transform.name().to_owned();
        if !name.starts_with(TRANSFORM_NAMESPACE) || name.len() == TRANSFORM_NAMESPACE.len() {
            bail!(ContractError::TransformOutsideNamespace(
                name,
                TRANSFORM_NAMESPACE
            ));
        }
        self.transforms.insert(name, transform);
        Ok(())
    }

    /// Look up a transform by identifier.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(name).cloned()
    }

    /// Resolve a transform by identifier, failing the contract when it is
    /// not registered.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Transform>> {
        self.get(name)
            .ok_or_else(|| ContractError::UnknownTransform(name.to_owned()).into())
    }

    /// All registered identifiers, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Run a batch through a chain of transforms.
///
/// An empty intermediate batch stops the chain early; there is nothing
/// left for downstream steps to see.
pub async fn apply_chain(
    transforms: &[Arc<dyn Transform>],
    mut rows: Vec<Record>,
) -> Result<Vec<Record>> {
    for transform in transforms {
        if rows.is_empty() {
            break;
        }
        rows = transform.apply(rows).await?;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn row(n: i64) -> Record {
        let mut r = Record::new();
        r.insert("n".to_owned(), Value::Int(n));
        r
    }

    #[tokio::test]
    async fn noop_passes_rows_through() {
        let rows = vec![row(1), row(2)];
        let out = NoopTransform.apply(rows.clone()).await.unwrap();
        assert_eq!(out, rows);
    }

    #[test]
    fn registry_rejects_unnamespaced_transforms() {
        let mut registry = TransformRegistry::new();
        let result = registry.register(Arc::new(FnTransform::new("bare_name", Ok)));
        assert!(result.is_err());
        let result = registry.register(Arc::new(FnTransform::new("transforms.", Ok)));
        assert!(result.is_err());
    }

    #[test]
    fn resolve_unknown_fails() {
        let registry = TransformRegistry::new();
        assert!(registry.resolve("transforms.missing").is_err());
        assert!(registry.get("transforms.noop").is_some());
    }

    #[tokio::test]
    async fn chain_applies_in_order() {
        let double = Arc::new(FnTransform::new("transforms.double", |rows: Vec<Record>| {
            Ok(rows
                .into_iter()
                .map(|mut r| {
                    if let Some(Value::Int(n)) = r.get("n").cloned() {
                        r.insert("n".to_owned(), Value::Int(n * 2));
                    }
                    r
                })
                .collect())
        })) as Arc<dyn Transform>;

        let out = apply_chain(&[double.clone(), double], vec![row(3)])
            .await
            .unwrap();
        assert_eq!(out[0].get("n"), Some(&Value::Int(12)));
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let drop_all = Arc::new(FnTransform::new("transforms.drop", |_| Ok(Vec::new())))
            as Arc<dyn Transform>;
        let boom = Arc::new(FnTransform::new("transforms.boom", |_| {
            anyhow::bail!("downstream step must not run on an empty batch")
        })) as Arc<dyn Transform>;

        let out = apply_chain(&[drop_all, boom], vec![row(1)]).await.unwrap();
        assert!(out.is_empty());
    }
}
