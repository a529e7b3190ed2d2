//! Database query functions for the `checkpoints` table.
//!
//! The upsert takes a plain connection instead of the pool so callers can
//! run it inside the same transaction as the batch write: the cursor must
//! never advance ahead of committed data.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::Checkpoint;

/// Fetch the checkpoint for a pipeline, if one has been written.
pub async fn get_checkpoint(pool: &PgPool, pipeline_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint =
        sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// Upsert the checkpoint cursor. Both halves of the cursor are written
/// together; a checkpoint with only one of them set never exists.
pub async fn upsert_checkpoint(
    conn: &mut PgConnection,
    pipeline_id: Uuid,
    last_value: &str,
    last_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO checkpoints (pipeline_id, last_processed_value, last_processed_id) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (pipeline_id) DO UPDATE \
         SET last_processed_value = EXCLUDED.last_processed_value, \
             last_processed_id = EXCLUDED.last_processed_id, \
             updated_at = NOW()",
    )
    .bind(pipeline_id)
    .bind(last_value)
    .bind(last_id)
    .execute(conn)
    .await
    .context("failed to upsert checkpoint")?;

    Ok(())
}

/// Delete the checkpoint of a pipeline (used when an operator resets an
/// incremental pipeline to re-read from the beginning).
pub async fn delete_checkpoint(pool: &PgPool, pipeline_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE pipeline_id = $1")
        .bind(pipeline_id)
        .execute(pool)
        .await
        .context("failed to delete checkpoint")?;

    Ok(result.rows_affected())
}
