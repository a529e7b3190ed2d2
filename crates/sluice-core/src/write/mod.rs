//! Sink writers.
//!
//! A writer is resolved per pipeline execution from the target string:
//! `es:<index>` targets get the document-index bulk writer, everything
//! else the relational upsert writer. Writers hold no state across runs;
//! `close` releases whatever the execution opened.

pub mod elastic;
pub mod relational;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgConnection;

use crate::record::Record;
use crate::targets::TargetCatalog;

pub use elastic::{ElasticWriter, EsConfig};
pub use relational::RelationalWriter;

/// An idempotent batch sink.
///
/// `write` receives the connection of the current batch transaction;
/// relational writers join it so the batch and its checkpoint commit
/// together, while external sinks ignore it (at-least-once delivery).
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(
        &self,
        conn: &mut PgConnection,
        target: &str,
        rows: &[Record],
    ) -> Result<u64>;

    /// Release any resources held for this execution.
    async fn close(&self) -> Result<()>;
}

/// Pick the writer implementation for a target.
pub fn resolve_writer(
    catalog: Arc<TargetCatalog>,
    es_config: &EsConfig,
    target: &str,
) -> Box<dyn Writer> {
    if TargetCatalog::is_index_target(target) {
        Box::new(ElasticWriter::new(es_config.clone(), catalog))
    } else {
        Box::new(RelationalWriter::new(catalog))
    }
}
