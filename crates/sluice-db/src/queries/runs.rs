//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Run;

/// Maximum length of a persisted run error message.
pub const ERROR_MESSAGE_CAP: usize = 2_000;

/// Truncate an error message to [`ERROR_MESSAGE_CAP`] characters, marking
/// the cut so readers know the log holds the full text.
pub fn cap_error_message(message: &str) -> String {
    let message = message.trim();
    if message.chars().count() <= ERROR_MESSAGE_CAP {
        return message.to_owned();
    }
    let truncated: String = message.chars().take(ERROR_MESSAGE_CAP).collect();
    format!("{truncated}...(truncated)")
}

/// Open a new run for a pipeline: inserts a RUNNING row and returns it.
pub async fn start_run(pool: &PgPool, pipeline_id: Uuid) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (pipeline_id, status, rows_read, rows_written) \
         VALUES ($1, 'RUNNING', 0, 0) \
         RETURNING *",
    )
    .bind(pipeline_id)
    .fetch_one(pool)
    .await
    .context("failed to start run")?;

    Ok(run)
}

/// Close a run as SUCCESS with its final counters.
pub async fn finish_run_success(
    pool: &PgPool,
    run_id: Uuid,
    rows_read: i64,
    rows_written: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE runs \
         SET status = 'SUCCESS', finished_at = NOW(), \
             rows_read = $2, rows_written = $3 \
         WHERE id = $1",
    )
    .bind(run_id)
    .bind(rows_read)
    .bind(rows_written)
    .execute(pool)
    .await
    .context("failed to finish run as SUCCESS")?;

    Ok(())
}

/// Close a run as FAILED with a capped error message.
pub async fn finish_run_failed(pool: &PgPool, run_id: Uuid, error_message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE runs \
         SET status = 'FAILED', finished_at = NOW(), error_message = $2 \
         WHERE id = $1",
    )
    .bind(run_id)
    .bind(cap_error_message(error_message))
    .execute(pool)
    .await
    .context("failed to finish run as FAILED")?;

    Ok(())
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List the most recent runs of a pipeline, newest first.
pub async fn list_runs_for_pipeline(
    pool: &PgPool,
    pipeline_id: Uuid,
    limit: i64,
) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE pipeline_id = $1 \
         ORDER BY started_at DESC \
         LIMIT $2",
    )
    .bind(pipeline_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list runs")?;

    Ok(runs)
}

/// Mark orphaned RUNNING runs of the given pipelines as FAILED with a
/// recovery marker, so crashed executions stay visible in history.
/// Returns the number of runs rewritten.
pub async fn fail_orphaned_runs(pool: &PgPool, pipeline_ids: &[Uuid]) -> Result<u64> {
    if pipeline_ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "UPDATE runs \
         SET status = 'FAILED', finished_at = NOW(), \
             error_message = 'recovered after runner crash' \
         WHERE pipeline_id = ANY($1) AND status = 'RUNNING'",
    )
    .bind(pipeline_ids)
    .execute(pool)
    .await
    .context("failed to fail orphaned runs")?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_keeps_short_messages() {
        assert_eq!(cap_error_message("boom"), "boom");
    }

    #[test]
    fn cap_trims_whitespace() {
        assert_eq!(cap_error_message("  boom \n"), "boom");
    }

    #[test]
    fn cap_truncates_long_messages() {
        let long = "x".repeat(ERROR_MESSAGE_CAP + 500);
        let capped = cap_error_message(&long);
        assert!(capped.ends_with("...(truncated)"));
        assert_eq!(
            capped.chars().count(),
            ERROR_MESSAGE_CAP + "...(truncated)".len()
        );
    }
}
