//! The executor: run bookkeeping around a strategy invocation.
//!
//! Opens a run row before the strategy starts, closes it SUCCESS or
//! FAILED afterwards. A connectivity failure re-raises without touching
//! the run -- the row stays RUNNING so startup recovery can mark it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{error, info, warn};

use sluice_db::models::PipelineMode;
use sluice_db::queries::runs as runs_db;

use crate::error::is_connectivity_error;
use crate::exec::{ExecutionContext, full, incremental};
use crate::snapshot::{PipelineSnapshot, build_plan};
use crate::targets::TargetCatalog;
use crate::transform::TransformRegistry;
use crate::write::EsConfig;

/// Final counters of a successful execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub rows_read: i64,
    pub rows_written: i64,
}

/// The dispatcher-facing execution seam.
///
/// The production implementation is [`PipelineExecutor`]; tests substitute
/// their own to exercise the dispatcher's retry and finalization paths.
#[async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, pool: &PgPool, snapshot: &PipelineSnapshot)
    -> Result<ExecutionOutcome>;
}

/// Production executor: records a run, picks a strategy by mode, and
/// closes the run with the outcome.
pub struct PipelineExecutor {
    registry: Arc<TransformRegistry>,
    catalog: Arc<TargetCatalog>,
    es_config: EsConfig,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<TransformRegistry>,
        catalog: Arc<TargetCatalog>,
        es_config: EsConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            es_config,
        }
    }
}

#[async_trait]
impl Execute for PipelineExecutor {
    async fn execute(
        &self,
        pool: &PgPool,
        snapshot: &PipelineSnapshot,
    ) -> Result<ExecutionOutcome> {
        let run = runs_db::start_run(pool, snapshot.id).await?;

        info!(
            pipeline_id = %snapshot.id,
            name = %snapshot.name,
            run_id = %run.id,
            mode = %snapshot.mode,
            "run started"
        );

        let ctx = ExecutionContext {
            pool: pool.clone(),
            run_id: run.id,
            registry: self.registry.clone(),
            catalog: self.catalog.clone(),
            es_config: self.es_config.clone(),
        };

        match run_strategy(&ctx, snapshot).await {
            Ok((rows_read, rows_written)) => {
                runs_db::finish_run_success(pool, run.id, rows_read, rows_written).await?;
                info!(
                    pipeline_id = %snapshot.id,
                    run_id = %run.id,
                    rows_read,
                    rows_written,
                    "run finished SUCCESS"
                );
                Ok(ExecutionOutcome {
                    rows_read,
                    rows_written,
                })
            }
            Err(err) => {
                if is_connectivity_error(&err) {
                    warn!(
                        pipeline_id = %snapshot.id,
                        run_id = %run.id,
                        error = %err,
                        "database unreachable during execution; leaving run RUNNING for recovery"
                    );
                    return Err(err);
                }

                error!(
                    pipeline_id = %snapshot.id,
                    run_id = %run.id,
                    error = %err,
                    "run failed"
                );
                if verbose_error_logging() {
                    error!(
                        run_id = %run.id,
                        detail = ?err,
                        "run failure detail"
                    );
                }

                // The failed batch transaction was already dropped; only
                // the run row needs closing.
                let message = format!("{err:#}");
                if let Err(close_err) =
                    runs_db::finish_run_failed(pool, run.id, &message).await
                {
                    warn!(
                        run_id = %run.id,
                        error = %close_err,
                        "failed to close run as FAILED"
                    );
                }

                Err(err)
            }
        }
    }
}

/// Whether failed runs also log the full error chain. The capped message
/// persisted on the run row is the compact form; the log carries the rest.
fn verbose_error_logging() -> bool {
    std::env::var("SLUICE_LOG_ERROR_CHAINS")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false)
}

async fn run_strategy(
    ctx: &ExecutionContext,
    snapshot: &PipelineSnapshot,
) -> Result<(i64, i64)> {
    // Step-plan validation runs once, before the first batch.
    let plan = build_plan(snapshot, &ctx.catalog)?;

    match snapshot.mode {
        PipelineMode::Full => full::run_full(ctx, snapshot, &plan).await,
        PipelineMode::Incremental => incremental::run_incremental(ctx, snapshot, &plan).await,
    }
}
