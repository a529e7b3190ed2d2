//! Database query functions for the `pipelines` table.
//!
//! Status changes are compare-and-swap UPDATEs: the WHERE clause pins the
//! expected `from` states, and a zero row count means another actor moved
//! the pipeline first. Callers treat that as a lost race, not an error.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Pipeline, PipelineKind, PipelineMode, PipelineStatus};

/// Fields for inserting a new pipeline. Server-side defaults fill in the
/// id, status, and timestamps.
#[derive(Debug, Clone)]
pub struct NewPipeline<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub kind: PipelineKind,
    pub mode: PipelineMode,
    pub enabled: bool,
    pub source_query: Option<&'a str>,
    pub transform_name: Option<&'a str>,
    pub target_table: &'a str,
    pub batch_size: i32,
    pub incremental_key: Option<&'a str>,
    pub incremental_id_key: Option<&'a str>,
}

/// Partial update of a pipeline definition. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct PipelinePatch {
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub source_query: Option<String>,
    pub transform_name: Option<String>,
    pub target_table: Option<String>,
    pub batch_size: Option<i32>,
    pub incremental_key: Option<String>,
    pub incremental_id_key: Option<String>,
}

/// Insert a new pipeline row. Returns the inserted pipeline with
/// server-generated defaults (id, status, created_at).
pub async fn insert_pipeline(pool: &PgPool, new: &NewPipeline<'_>) -> Result<Pipeline> {
    let pipeline = sqlx::query_as::<_, Pipeline>(
        "INSERT INTO pipelines \
         (name, description, kind, mode, enabled, source_query, transform_name, \
          target_table, batch_size, incremental_key, incremental_id_key) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(new.name)
    .bind(new.description)
    .bind(new.kind)
    .bind(new.mode)
    .bind(new.enabled)
    .bind(new.source_query)
    .bind(new.transform_name)
    .bind(new.target_table)
    .bind(new.batch_size)
    .bind(new.incremental_key)
    .bind(new.incremental_id_key)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline")?;

    Ok(pipeline)
}

/// Fetch a single pipeline by ID.
pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline")?;

    Ok(pipeline)
}

/// Fetch a single pipeline by its unique name.
pub async fn get_pipeline_by_name(pool: &PgPool, name: &str) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline by name")?;

    Ok(pipeline)
}

/// List all pipelines, ordered by name.
pub async fn list_pipelines(pool: &PgPool) -> Result<Vec<Pipeline>> {
    let pipelines = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list pipelines")?;

    Ok(pipelines)
}

/// List the pipelines a tick must look at: enabled, and in a requested
/// state (RUN_REQUESTED or PAUSE_REQUESTED), ordered by name.
pub async fn list_candidates(pool: &PgPool) -> Result<Vec<Pipeline>> {
    let pipelines = sqlx::query_as::<_, Pipeline>(
        "SELECT * FROM pipelines \
         WHERE enabled = TRUE \
           AND status IN ('RUN_REQUESTED', 'PAUSE_REQUESTED') \
         ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list candidate pipelines")?;

    Ok(pipelines)
}

/// Read the current status of a pipeline.
pub async fn get_status(pool: &PgPool, id: Uuid) -> Result<PipelineStatus> {
    let status: PipelineStatus =
        sqlx::query_scalar("SELECT status FROM pipelines WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .context("failed to read pipeline status")?;

    Ok(status)
}

/// Atomically transition a pipeline from any of the `from` states to `to`.
///
/// Returns the number of rows affected: 1 when the swap happened, 0 when
/// the current status was not in `from` (lost race) or the row is gone.
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: &[PipelineStatus],
    to: PipelineStatus,
) -> Result<u64> {
    let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();

    let result = sqlx::query(
        "UPDATE pipelines \
         SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = ANY($3)",
    )
    .bind(to)
    .bind(id)
    .bind(&from)
    .execute(pool)
    .await
    .context("failed to transition pipeline status")?;

    Ok(result.rows_affected())
}

/// Claim a pipeline for execution: RUN_REQUESTED -> RUNNING.
///
/// Returns the claimed row, or `None` when another runner won the claim
/// (or the user withdrew the request) in the meantime.
pub async fn claim_run_requested(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>> {
    let claimed = sqlx::query_as::<_, Pipeline>(
        "UPDATE pipelines \
         SET status = 'RUNNING', updated_at = NOW() \
         WHERE id = $1 AND status = 'RUN_REQUESTED' \
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to claim pipeline")?;

    Ok(claimed)
}

/// List the IDs of all pipelines currently marked RUNNING.
///
/// After a clean shutdown this is empty; anything found here at startup is
/// an orphan from a crashed runner.
pub async fn list_running_ids(pool: &PgPool) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT id FROM pipelines WHERE status = 'RUNNING'")
            .fetch_all(pool)
            .await
            .context("failed to list running pipelines")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Re-queue crashed pipelines: RUNNING -> RUN_REQUESTED for every id in
/// the list that is still RUNNING. Returns the number of rows re-queued.
pub async fn requeue_running(pool: &PgPool, ids: &[Uuid]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "UPDATE pipelines \
         SET status = 'RUN_REQUESTED', updated_at = NOW() \
         WHERE id = ANY($1) AND status = 'RUNNING'",
    )
    .bind(ids)
    .execute(pool)
    .await
    .context("failed to re-queue running pipelines")?;

    Ok(result.rows_affected())
}

/// Apply a partial update to a pipeline definition. Returns the updated
/// row, or `None` when the pipeline does not exist.
pub async fn update_pipeline(
    pool: &PgPool,
    id: Uuid,
    patch: &PipelinePatch,
) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>(
        "UPDATE pipelines SET \
             description = COALESCE($2, description), \
             enabled = COALESCE($3, enabled), \
             source_query = COALESCE($4, source_query), \
             transform_name = COALESCE($5, transform_name), \
             target_table = COALESCE($6, target_table), \
             batch_size = COALESCE($7, batch_size), \
             incremental_key = COALESCE($8, incremental_key), \
             incremental_id_key = COALESCE($9, incremental_id_key), \
             updated_at = NOW() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .bind(patch.description.as_deref())
    .bind(patch.enabled)
    .bind(patch.source_query.as_deref())
    .bind(patch.transform_name.as_deref())
    .bind(patch.target_table.as_deref())
    .bind(patch.batch_size)
    .bind(patch.incremental_key.as_deref())
    .bind(patch.incremental_id_key.as_deref())
    .fetch_optional(pool)
    .await
    .context("failed to update pipeline")?;

    Ok(pipeline)
}
