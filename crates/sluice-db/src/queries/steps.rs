//! Database query functions for the `pipeline_steps` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PipelineStep, StepKind};

/// Fields for inserting a new pipeline step.
#[derive(Debug, Clone)]
pub struct NewStep<'a> {
    pub pipeline_id: Uuid,
    pub order_index: i32,
    pub step_kind: StepKind,
    pub body: &'a str,
    pub target_table: Option<&'a str>,
}

/// Insert a step row. The `(pipeline_id, order_index)` pair is unique, so
/// inserting a duplicate position fails.
pub async fn insert_step(pool: &PgPool, new: &NewStep<'_>) -> Result<PipelineStep> {
    let step = sqlx::query_as::<_, PipelineStep>(
        "INSERT INTO pipeline_steps \
         (pipeline_id, order_index, step_kind, body, target_table) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.pipeline_id)
    .bind(new.order_index)
    .bind(new.step_kind)
    .bind(new.body)
    .bind(new.target_table)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline step")?;

    Ok(step)
}

/// List all steps of a pipeline in execution order.
pub async fn list_steps_for_pipeline(
    pool: &PgPool,
    pipeline_id: Uuid,
) -> Result<Vec<PipelineStep>> {
    let steps = sqlx::query_as::<_, PipelineStep>(
        "SELECT * FROM pipeline_steps \
         WHERE pipeline_id = $1 \
         ORDER BY order_index ASC",
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await
    .context("failed to list pipeline steps")?;

    Ok(steps)
}
