//! One runner tick: list candidate pipelines, dispatch each one
//! independently.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, error, info};

use sluice_db::queries::pipelines as pipelines_db;

use crate::dispatch::Dispatcher;
use crate::error::is_connectivity_error;

/// What one tick saw and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickResult {
    pub pipelines_found: usize,
    pub pipelines_processed: usize,
}

pub struct Manager {
    dispatcher: Dispatcher,
}

impl Manager {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Run one tick.
    ///
    /// One pipeline's failure never stops the others: execution errors are
    /// logged and the loop continues. A connectivity failure aborts the
    /// whole tick instead -- every remaining candidate would hit the same
    /// dead database, and the pool needs a chance to recycle.
    pub async fn tick(&self, pool: &PgPool) -> Result<TickResult> {
        let candidates = pipelines_db::list_candidates(pool).await?;

        if candidates.is_empty() {
            debug!("no active pipelines (enabled and RUN_REQUESTED/PAUSE_REQUESTED)");
            return Ok(TickResult::default());
        }

        info!(count = candidates.len(), "found active pipelines");

        let mut processed = 0;

        for pipeline in &candidates {
            match self.dispatcher.dispatch(pool, pipeline).await {
                Ok(()) => processed += 1,
                Err(err) if is_connectivity_error(&err) => {
                    return Err(err).context("tick aborted: database connectivity lost");
                }
                Err(err) => {
                    error!(
                        pipeline_id = %pipeline.id,
                        name = %pipeline.name,
                        error = %err,
                        "pipeline dispatch failed"
                    );
                }
            }
        }

        Ok(TickResult {
            pipelines_found: candidates.len(),
            pipelines_processed: processed,
        })
    }
}
