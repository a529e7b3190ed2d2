//! Pipeline execution: the executor opens and closes runs, the strategy
//! modules drive the batched fetch/transform/write/commit loop.

pub mod executor;
mod full;
mod incremental;

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use sluice_db::models::PipelineStatus;
use sluice_db::queries::pipelines as pipelines_db;

use crate::state::PipelineStateMachine;
use crate::targets::TargetCatalog;
use crate::transform::TransformRegistry;
use crate::write::EsConfig;

pub use executor::{Execute, ExecutionOutcome, PipelineExecutor};

/// Everything a strategy needs for one run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub pool: PgPool,
    pub run_id: Uuid,
    pub registry: Arc<TransformRegistry>,
    pub catalog: Arc<TargetCatalog>,
    pub es_config: EsConfig,
}

/// Observe the pipeline status after a committed batch and park the
/// pipeline when a pause came in. Returns `true` when the strategy should
/// stop on this batch boundary.
pub(crate) async fn pause_if_requested(pool: &PgPool, pipeline_id: Uuid) -> Result<bool> {
    let status = pipelines_db::get_status(pool, pipeline_id).await?;
    if status != PipelineStatus::PauseRequested {
        return Ok(false);
    }

    // Lost race here means someone else already moved the pipeline on;
    // either way this execution stops cleanly on the batch boundary.
    PipelineStateMachine::apply_pause(pool, pipeline_id).await?;
    info!(pipeline_id = %pipeline_id, "pause applied after batch");
    Ok(true)
}
