//! Per-pipeline dispatch: pause application, the claim, the retry loop,
//! and final status transitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use sluice_db::models::{Pipeline, PipelineStatus};

use crate::error::is_connectivity_error;
use crate::exec::Execute;
use crate::snapshot::snapshot_with_steps;
use crate::state::PipelineStateMachine;

/// Default retry policy: three attempts with exponential backoff.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_backoff() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(2),
        Duration::from_secs(4),
    ]
}

/// Dispatches one candidate pipeline per call.
pub struct Dispatcher {
    executor: Arc<dyn Execute>,
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Execute>) -> Self {
        Self::with_retry_policy(executor, DEFAULT_MAX_ATTEMPTS, default_backoff())
    }

    /// Override the retry policy (tests pass zero backoff).
    pub fn with_retry_policy(
        executor: Arc<dyn Execute>,
        max_attempts: u32,
        backoff: Vec<Duration>,
    ) -> Self {
        Self {
            executor,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Handle one candidate pipeline.
    ///
    /// - PAUSE_REQUESTED: apply the pause, nothing runs.
    /// - RUN_REQUESTED: claim, snapshot, execute with retries, finalize.
    /// - RUNNING: another worker (or a prior attempt) owns it; skip.
    pub async fn dispatch(&self, pool: &PgPool, pipeline: &Pipeline) -> Result<()> {
        match pipeline.status {
            PipelineStatus::PauseRequested => {
                let applied = PipelineStateMachine::apply_pause(pool, pipeline.id).await?;
                if applied {
                    info!(
                        pipeline_id = %pipeline.id,
                        name = %pipeline.name,
                        "pause applied"
                    );
                }
                Ok(())
            }
            PipelineStatus::RunRequested => self.claim_and_run(pool, pipeline).await,
            PipelineStatus::Running => {
                debug!(
                    pipeline_id = %pipeline.id,
                    name = %pipeline.name,
                    "skipping pipeline: already RUNNING"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn claim_and_run(&self, pool: &PgPool, pipeline: &Pipeline) -> Result<()> {
        let Some(claimed) = PipelineStateMachine::claim(pool, pipeline.id).await? else {
            debug!(
                pipeline_id = %pipeline.id,
                name = %pipeline.name,
                "claim lost; another runner took this pipeline"
            );
            return Ok(());
        };

        // Freeze the definition and its steps; user edits made after this
        // point do not affect the in-flight execution.
        let snapshot = snapshot_with_steps(pool, &claimed).await?;

        for attempt in 1..=self.max_attempts {
            match self.executor.execute(pool, &snapshot).await {
                Ok(outcome) => {
                    // A pause that was requested and applied mid-run wins;
                    // otherwise finalize RUNNING -> IDLE (conditionally, the
                    // concurrent state always takes precedence).
                    let status =
                        sluice_db::queries::pipelines::get_status(pool, snapshot.id).await?;
                    if status != PipelineStatus::Paused {
                        PipelineStateMachine::finish_to_idle(pool, snapshot.id).await?;
                    }
                    info!(
                        pipeline_id = %snapshot.id,
                        name = %snapshot.name,
                        attempt,
                        rows_read = outcome.rows_read,
                        rows_written = outcome.rows_written,
                        "pipeline finished"
                    );
                    return Ok(());
                }
                Err(err) if is_connectivity_error(&err) => {
                    // Leave the pipeline RUNNING; startup recovery will
                    // re-queue it once the database is reachable again.
                    warn!(
                        pipeline_id = %snapshot.id,
                        name = %snapshot.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "database unreachable during execution; ending tick participation"
                    );
                    return Ok(());
                }
                Err(err) if attempt < self.max_attempts => {
                    let delay = self
                        .backoff
                        .get(attempt as usize - 1)
                        .or_else(|| self.backoff.last())
                        .copied()
                        .unwrap_or(Duration::ZERO);
                    warn!(
                        pipeline_id = %snapshot.id,
                        name = %snapshot.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        pipeline_id = %snapshot.id,
                        name = %snapshot.name,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "pipeline failed terminally"
                    );
                    // Also covers a PAUSE_REQUESTED that arrived during the
                    // failing execution: no zombie requested state survives.
                    PipelineStateMachine::fail_if_active(pool, snapshot.id).await?;
                    return Err(err).with_context(|| {
                        format!(
                            "pipeline {} failed after {} attempts",
                            snapshot.name, self.max_attempts
                        )
                    });
                }
            }
        }

        Ok(())
    }
}
