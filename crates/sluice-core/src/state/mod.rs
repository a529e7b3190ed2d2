//! Pipeline lifecycle state machine.
//!
//! Validates the allowed transition graph and executes each transition as
//! a single conditional UPDATE (see `sluice_db::queries::pipelines`).
//! A transition whose `from` predicate no longer holds affects zero rows;
//! callers receive `false` and treat it as a lost race, never an error --
//! with replicated runners the concurrent state always wins.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use sluice_db::models::{Pipeline, PipelineStatus};
use sluice_db::queries::pipelines as db;

/// The pipeline state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// IDLE | PAUSED | PAUSE_REQUESTED | FAILED -> RUN_REQUESTED   (user run)
/// RUNNING | RUN_REQUESTED | IDLE          -> PAUSE_REQUESTED  (user pause)
/// RUN_REQUESTED                           -> RUNNING          (claim)
/// PAUSE_REQUESTED                         -> PAUSED           (pause applied)
/// RUNNING                                 -> IDLE             (success)
/// RUNNING | PAUSE_REQUESTED               -> FAILED           (terminal failure)
/// RUNNING                                 -> RUN_REQUESTED    (startup recovery)
/// ```
pub struct PipelineStateMachine;

impl PipelineStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: PipelineStatus, to: PipelineStatus) -> bool {
        use sluice_db::models::PipelineStatus::*;
        matches!(
            (from, to),
            (Idle | Paused | PauseRequested | Failed, RunRequested)
                | (Running | RunRequested | Idle, PauseRequested)
                | (RunRequested, Running)
                | (PauseRequested, Paused)
                | (Running, Idle)
                | (Running | PauseRequested, Failed)
                | (Running, RunRequested)
        )
    }

    /// User command: request a run. Returns `true` when the request was
    /// recorded, `false` when the pipeline was already requested, running,
    /// or gone.
    pub async fn request_run(pool: &PgPool, id: Uuid) -> Result<bool> {
        let rows = db::transition_status(
            pool,
            id,
            &PipelineStatus::RUNNABLE_FROM,
            PipelineStatus::RunRequested,
        )
        .await?;
        Ok(rows > 0)
    }

    /// User command: request a pause. The strategy observes the request on
    /// the next batch boundary and parks the pipeline cleanly.
    pub async fn request_pause(pool: &PgPool, id: Uuid) -> Result<bool> {
        let rows = db::transition_status(
            pool,
            id,
            &PipelineStatus::PAUSABLE_FROM,
            PipelineStatus::PauseRequested,
        )
        .await?;
        Ok(rows > 0)
    }

    /// Claim a pipeline for exclusive execution: RUN_REQUESTED -> RUNNING.
    ///
    /// Returns the claimed definition, or `None` when another replica won.
    pub async fn claim(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>> {
        db::claim_run_requested(pool, id).await
    }

    /// Apply a pending pause: PAUSE_REQUESTED -> PAUSED.
    pub async fn apply_pause(pool: &PgPool, id: Uuid) -> Result<bool> {
        let rows = db::transition_status(
            pool,
            id,
            &[PipelineStatus::PauseRequested],
            PipelineStatus::Paused,
        )
        .await?;
        Ok(rows > 0)
    }

    /// Finalize a successful execution: RUNNING -> IDLE.
    ///
    /// Conditional on the row still being RUNNING: a pause applied during
    /// the last batch wins over the finalization.
    pub async fn finish_to_idle(pool: &PgPool, id: Uuid) -> Result<bool> {
        let rows = db::transition_status(
            pool,
            id,
            &[PipelineStatus::Running],
            PipelineStatus::Idle,
        )
        .await?;
        Ok(rows > 0)
    }

    /// Terminal failure: {RUNNING, PAUSE_REQUESTED} -> FAILED.
    ///
    /// PAUSE_REQUESTED is included so an execution that exhausted its
    /// retries while a pause was pending does not leave a zombie request.
    pub async fn fail_if_active(pool: &PgPool, id: Uuid) -> Result<bool> {
        let rows = db::transition_status(
            pool,
            id,
            &[PipelineStatus::Running, PipelineStatus::PauseRequested],
            PipelineStatus::Failed,
        )
        .await?;
        Ok(rows > 0)
    }
}
