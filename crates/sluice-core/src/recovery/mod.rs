//! Startup crash recovery.
//!
//! A runner that dies mid-execution leaves pipelines in RUNNING and their
//! runs open. On the next startup those runs are closed as FAILED with a
//! recovery marker (history never lies about a crash), and the pipelines
//! are re-queued so the next tick resumes them from their checkpoints.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, warn};

use sluice_db::queries::pipelines as pipelines_db;
use sluice_db::queries::runs as runs_db;

/// What startup recovery found and fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    pub pipelines_requeued: u64,
    pub runs_failed: u64,
}

/// Recover pipelines stuck in RUNNING after a crash.
///
/// Order matters: the orphaned runs are closed first, then the pipelines
/// are re-queued. Re-queueing first would let another tick claim a
/// pipeline and open a fresh RUNNING run that this pass would then wrongly
/// close.
pub async fn recover_on_startup(pool: &PgPool) -> Result<RecoveryReport> {
    let stuck = pipelines_db::list_running_ids(pool).await?;

    if stuck.is_empty() {
        debug!("no pipelines stuck in RUNNING");
        return Ok(RecoveryReport::default());
    }

    let runs_failed = runs_db::fail_orphaned_runs(pool, &stuck).await?;
    let pipelines_requeued = pipelines_db::requeue_running(pool, &stuck).await?;

    warn!(
        pipelines = pipelines_requeued,
        runs = runs_failed,
        "recovered pipelines stuck in RUNNING after a crash"
    );

    Ok(RecoveryReport {
        pipelines_requeued,
        runs_failed,
    })
}
