//! Pipeline snapshots and execution plans.
//!
//! The dispatcher snapshots a pipeline (definition plus ordered steps) the
//! moment it wins the claim. Operator edits made while the run is in
//! flight do not reach the executing strategy; the snapshot is the only
//! view the rest of the run ever sees.

use anyhow::{Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use sluice_db::models::{Pipeline, PipelineKind, PipelineMode, PipelineStep, StepKind};
use sluice_db::queries::steps as steps_db;

use crate::error::ContractError;
use crate::targets::TargetCatalog;

/// Immutable view of one pipeline step.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub id: Uuid,
    pub order_index: i32,
    pub kind: StepKind,
    pub body: String,
    pub target_table: Option<String>,
}

impl From<PipelineStep> for StepSnapshot {
    fn from(step: PipelineStep) -> Self {
        Self {
            id: step.id,
            order_index: step.order_index,
            kind: step.step_kind,
            body: step.body,
            target_table: step.target_table,
        }
    }
}

/// Immutable view of a pipeline taken at claim time.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub id: Uuid,
    pub name: String,
    pub kind: PipelineKind,
    pub mode: PipelineMode,
    pub batch_size: i32,
    pub source_query: Option<String>,
    pub transform_name: Option<String>,
    pub target_table: String,
    pub incremental_key: Option<String>,
    pub incremental_id_key: Option<String>,
    pub steps: Vec<StepSnapshot>,
}

impl PipelineSnapshot {
    /// Snapshot just the definition (no steps).
    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self {
            id: pipeline.id,
            name: pipeline.name.clone(),
            kind: pipeline.kind,
            mode: pipeline.mode,
            batch_size: pipeline.batch_size,
            source_query: pipeline.source_query.clone(),
            transform_name: pipeline.transform_name.clone(),
            target_table: pipeline.target_table.clone(),
            incremental_key: pipeline.incremental_key.clone(),
            incremental_id_key: pipeline.incremental_id_key.clone(),
            steps: Vec::new(),
        }
    }
}

/// Snapshot a pipeline with its ordered steps.
pub async fn snapshot_with_steps(pool: &PgPool, pipeline: &Pipeline) -> Result<PipelineSnapshot> {
    let steps = steps_db::list_steps_for_pipeline(pool, pipeline.id).await?;

    let mut snapshot = PipelineSnapshot::from_pipeline(pipeline);
    snapshot.steps = steps.into_iter().map(StepSnapshot::from).collect();
    Ok(snapshot)
}

/// What a strategy actually runs: one reader query, a transform chain,
/// and the effective sink.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub reader_sql: String,
    pub transform_names: Vec<String>,
    pub target_table: String,
}

/// Validate a snapshot and flatten it into an [`ExecutionPlan`].
///
/// Single-step pipelines read `source_query` and apply the pipeline's own
/// transform (if any). Multi-step pipelines must start with exactly one
/// SQL step (the sole reader), continue with transform steps only, and
/// may override the sink only on the last step. The effective target must
/// pass the allowlist either way.
pub fn build_plan(snapshot: &PipelineSnapshot, catalog: &TargetCatalog) -> Result<ExecutionPlan> {
    let plan = if snapshot.steps.is_empty() {
        single_step_plan(snapshot)?
    } else {
        multi_step_plan(snapshot)?
    };

    if !catalog.is_allowed(&plan.target_table) {
        bail!(ContractError::TargetNotAllowed(plan.target_table.clone()));
    }

    Ok(plan)
}

fn single_step_plan(snapshot: &PipelineSnapshot) -> Result<ExecutionPlan> {
    let reader_sql = match snapshot.source_query.as_deref().map(str::trim) {
        Some(q) if !q.is_empty() => q.to_owned(),
        _ => bail!("pipeline {} has an empty source_query", snapshot.name),
    };

    let transform_names = match snapshot.kind {
        PipelineKind::Transform => match snapshot.transform_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => vec![name.to_owned()],
            _ => bail!(
                "transform pipeline {} requires transform_name",
                snapshot.name
            ),
        },
        PipelineKind::Sql | PipelineKind::Es => Vec::new(),
    };

    Ok(ExecutionPlan {
        reader_sql,
        transform_names,
        target_table: snapshot.target_table.clone(),
    })
}

fn multi_step_plan(snapshot: &PipelineSnapshot) -> Result<ExecutionPlan> {
    let mut steps: Vec<&StepSnapshot> = snapshot.steps.iter().collect();
    steps.sort_by_key(|s| s.order_index);

    let mut seen = std::collections::HashSet::new();
    for step in &steps {
        if !seen.insert(step.order_index) {
            bail!(
                "pipeline {} has duplicate step order_index {}",
                snapshot.name,
                step.order_index
            );
        }
        if step.body.trim().is_empty() {
            bail!(
                "pipeline {} step {} has an empty body",
                snapshot.name,
                step.order_index
            );
        }
    }

    let first = steps[0];
    if first.kind != StepKind::Sql {
        bail!(
            "pipeline {}: the first step must be SQL (the sole reader)",
            snapshot.name
        );
    }

    for step in &steps[1..] {
        if step.kind != StepKind::Transform {
            bail!(
                "pipeline {}: only transform steps may follow the reader (step {})",
                snapshot.name,
                step.order_index
            );
        }
    }

    let last_index = steps.len() - 1;
    for step in &steps[..last_index] {
        if step.target_table.is_some() {
            bail!(
                "pipeline {}: only the last step may override target_table (step {})",
                snapshot.name,
                step.order_index
            );
        }
    }

    let target_table = steps[last_index]
        .target_table
        .clone()
        .unwrap_or_else(|| snapshot.target_table.clone());

    let transform_names = steps[1..]
        .iter()
        .map(|s| s.body.trim().to_owned())
        .collect();

    Ok(ExecutionPlan {
        reader_sql: first.body.trim().to_owned(),
        transform_names,
        target_table,
    })
}
