//! Pipeline management commands: create, list, show, update, run, pause,
//! and run history.
//!
//! Submission-time validation lives here; the runner core re-validates the
//! security-sensitive pieces (identifiers, target allowlist) at execution
//! time as defence in depth.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use sluice_core::sql::validate_identifier;
use sluice_core::state::PipelineStateMachine;
use sluice_core::targets::TargetCatalog;
use sluice_core::transform::TRANSFORM_NAMESPACE;
use sluice_db::models::{Pipeline, PipelineKind, PipelineMode, PipelineStatus, StepKind};
use sluice_db::queries::checkpoints as checkpoints_db;
use sluice_db::queries::pipelines::{self as pipelines_db, NewPipeline, PipelinePatch};
use sluice_db::queries::runs as runs_db;
use sluice_db::queries::steps::{self as steps_db, NewStep};

/// Arguments for `sluice pipeline create`.
#[derive(clap::Args, Debug)]
pub struct CreateArgs {
    /// Unique pipeline name (3..64 chars, [A-Za-z0-9_-])
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub description: Option<String>,
    /// Pipeline kind: sql, transform, or es
    #[arg(long, default_value = "sql")]
    pub kind: String,
    /// Execution mode: full or incremental
    #[arg(long, default_value = "full")]
    pub mode: String,
    /// Source SELECT text
    #[arg(long)]
    pub source_query: String,
    /// Registered transform identifier (required for kind=transform)
    #[arg(long)]
    pub transform_name: Option<String>,
    /// Allowlisted sink: schema.table or es:<index>
    #[arg(long)]
    pub target_table: String,
    #[arg(long, default_value_t = 1000)]
    pub batch_size: i32,
    /// Timestamp-like cursor column (required for incremental mode)
    #[arg(long)]
    pub incremental_key: Option<String>,
    /// Tie-breaker cursor column (required for incremental mode)
    #[arg(long)]
    pub incremental_id_key: Option<String>,
    /// Create the pipeline disabled
    #[arg(long)]
    pub disabled: bool,
}

/// Arguments for `sluice pipeline add-step`.
#[derive(clap::Args, Debug)]
pub struct AddStepArgs {
    /// Pipeline name
    pub pipeline: String,
    /// Position within the pipeline (unique, executed ascending)
    #[arg(long)]
    pub order_index: i32,
    /// Step kind: sql (first step only) or transform
    #[arg(long)]
    pub kind: String,
    /// SQL text or transform identifier
    #[arg(long)]
    pub body: String,
    /// Sink override (only legal on the last step)
    #[arg(long)]
    pub target_table: Option<String>,
}

/// Arguments for `sluice pipeline update`.
#[derive(clap::Args, Debug)]
pub struct UpdateArgs {
    /// Pipeline name
    pub name: String,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub enabled: Option<bool>,
    #[arg(long)]
    pub source_query: Option<String>,
    #[arg(long)]
    pub transform_name: Option<String>,
    #[arg(long)]
    pub target_table: Option<String>,
    #[arg(long)]
    pub batch_size: Option<i32>,
    #[arg(long)]
    pub incremental_key: Option<String>,
    #[arg(long)]
    pub incremental_id_key: Option<String>,
}

// -----------------------------------------------------------------------
// Validation
// -----------------------------------------------------------------------

fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(3..=64).contains(&len) {
        bail!("pipeline name must be 3..64 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("pipeline name must match [A-Za-z0-9_-]");
    }
    Ok(())
}

fn validate_batch_size(batch_size: i32) -> Result<()> {
    if !(1..=50_000).contains(&batch_size) {
        bail!("batch_size must be 1..50000");
    }
    Ok(())
}

fn validate_transform_name(name: &str) -> Result<()> {
    if !name.starts_with(TRANSFORM_NAMESPACE) || name.len() == TRANSFORM_NAMESPACE.len() {
        bail!("transform name must lie under the {TRANSFORM_NAMESPACE:?} namespace");
    }
    Ok(())
}

/// Validate a full definition and parse the enum fields.
pub fn validate_definition(
    args: &CreateArgs,
    catalog: &TargetCatalog,
) -> Result<(PipelineKind, PipelineMode)> {
    validate_name(&args.name)?;
    validate_batch_size(args.batch_size)?;

    let kind: PipelineKind = args.kind.parse()?;
    let mode: PipelineMode = args.mode.parse()?;

    if args.source_query.trim().is_empty() {
        bail!("source_query must not be empty");
    }

    if !catalog.is_allowed(&args.target_table) {
        bail!("target_table {:?} is not in the allowlist", args.target_table);
    }

    if kind == PipelineKind::Transform {
        match args.transform_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => validate_transform_name(name)?,
            _ => bail!("transform pipelines require --transform-name"),
        }
    }

    if mode == PipelineMode::Incremental {
        let (Some(inc_key), Some(id_key)) = (
            args.incremental_key.as_deref(),
            args.incremental_id_key.as_deref(),
        ) else {
            bail!("incremental mode requires --incremental-key and --incremental-id-key");
        };

        let inc_key = validate_identifier(inc_key, "incremental_key")?;
        let id_key = validate_identifier(id_key, "incremental_id_key")?;

        // Lightweight contract check, not a SQL parser: both cursor
        // columns must at least appear in the SELECT text.
        let query = args.source_query.to_lowercase();
        if !query.contains(&inc_key.to_lowercase()) {
            bail!("source_query must include incremental_key in its SELECT output");
        }
        if !query.contains(&id_key.to_lowercase()) {
            bail!("source_query must include incremental_id_key in its SELECT output");
        }
    }

    Ok((kind, mode))
}

fn validate_patch(args: &UpdateArgs, catalog: &TargetCatalog) -> Result<()> {
    if let Some(batch_size) = args.batch_size {
        validate_batch_size(batch_size)?;
    }
    if let Some(ref target) = args.target_table {
        if !catalog.is_allowed(target) {
            bail!("target_table {target:?} is not in the allowlist");
        }
    }
    if let Some(ref name) = args.transform_name {
        validate_transform_name(name.trim())?;
    }
    if let Some(ref key) = args.incremental_key {
        validate_identifier(key, "incremental_key")?;
    }
    if let Some(ref key) = args.incremental_id_key {
        validate_identifier(key, "incremental_id_key")?;
    }
    Ok(())
}

async fn get_by_name(pool: &PgPool, name: &str) -> Result<Pipeline> {
    pipelines_db::get_pipeline_by_name(pool, name)
        .await?
        .with_context(|| format!("pipeline {name:?} not found"))
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

pub async fn create(pool: &PgPool, catalog: &TargetCatalog, args: &CreateArgs) -> Result<()> {
    let (kind, mode) = validate_definition(args, catalog)?;

    let new = NewPipeline {
        name: &args.name,
        description: args.description.as_deref(),
        kind,
        mode,
        enabled: !args.disabled,
        source_query: Some(args.source_query.as_str()),
        transform_name: args.transform_name.as_deref(),
        target_table: &args.target_table,
        batch_size: args.batch_size,
        incremental_key: args.incremental_key.as_deref(),
        incremental_id_key: args.incremental_id_key.as_deref(),
    };

    let pipeline = pipelines_db::insert_pipeline(pool, &new).await?;
    println!("created pipeline {} ({})", pipeline.name, pipeline.id);
    Ok(())
}

pub async fn list(pool: &PgPool) -> Result<()> {
    let pipelines = pipelines_db::list_pipelines(pool).await?;
    if pipelines.is_empty() {
        println!("no pipelines");
        return Ok(());
    }

    for p in pipelines {
        let enabled = if p.enabled { "" } else { " (disabled)" };
        println!(
            "{:<32} {:<12} {:<5} {:<12} -> {}{}",
            p.name, p.kind.to_string(), p.mode.to_string(), p.status.to_string(),
            p.target_table, enabled
        );
    }
    Ok(())
}

pub async fn show(pool: &PgPool, name: &str) -> Result<()> {
    let p = get_by_name(pool, name).await?;

    println!("name:        {}", p.name);
    println!("id:          {}", p.id);
    println!("kind:        {}", p.kind);
    println!("mode:        {}", p.mode);
    println!("status:      {}", p.status);
    println!("enabled:     {}", p.enabled);
    println!("target:      {}", p.target_table);
    println!("batch size:  {}", p.batch_size);
    if let Some(ref desc) = p.description {
        println!("description: {desc}");
    }
    if let Some(ref key) = p.incremental_key {
        println!("cursor:      ({key}, {})", p.incremental_id_key.as_deref().unwrap_or("?"));
    }

    if let Some(checkpoint) = checkpoints_db::get_checkpoint(pool, p.id).await? {
        println!(
            "checkpoint:  value={} id={} (updated {})",
            checkpoint.last_processed_value.as_deref().unwrap_or("-"),
            checkpoint.last_processed_id.as_deref().unwrap_or("-"),
            checkpoint.updated_at
        );
    }
    Ok(())
}

pub async fn update(pool: &PgPool, catalog: &TargetCatalog, args: &UpdateArgs) -> Result<()> {
    validate_patch(args, catalog)?;

    let pipeline = get_by_name(pool, &args.name).await?;

    // Only RUNNING locks the definition: the in-flight snapshot must not
    // change under the executing strategy. A merely requested pipeline is
    // still editable.
    if pipeline.status == PipelineStatus::Running {
        bail!("pipeline {:?} is RUNNING; updates are rejected while it executes", args.name);
    }

    let patch = PipelinePatch {
        description: args.description.clone(),
        enabled: args.enabled,
        source_query: args.source_query.clone(),
        transform_name: args.transform_name.clone(),
        target_table: args.target_table.clone(),
        batch_size: args.batch_size,
        incremental_key: args.incremental_key.clone(),
        incremental_id_key: args.incremental_id_key.clone(),
    };

    let updated = pipelines_db::update_pipeline(pool, pipeline.id, &patch)
        .await?
        .with_context(|| format!("pipeline {:?} disappeared during update", args.name))?;

    println!("updated pipeline {}", updated.name);
    Ok(())
}

pub async fn add_step(pool: &PgPool, catalog: &TargetCatalog, args: &AddStepArgs) -> Result<()> {
    let kind: StepKind = args.kind.parse()?;

    if args.body.trim().is_empty() {
        bail!("step body must not be empty");
    }
    if kind == StepKind::Transform {
        validate_transform_name(args.body.trim())?;
    }
    if let Some(ref target) = args.target_table {
        if !catalog.is_allowed(target) {
            bail!("target_table {target:?} is not in the allowlist");
        }
    }

    let pipeline = get_by_name(pool, &args.pipeline).await?;
    if pipeline.status == PipelineStatus::Running {
        bail!(
            "pipeline {:?} is RUNNING; updates are rejected while it executes",
            args.pipeline
        );
    }

    let step = steps_db::insert_step(
        pool,
        &NewStep {
            pipeline_id: pipeline.id,
            order_index: args.order_index,
            step_kind: kind,
            body: &args.body,
            target_table: args.target_table.as_deref(),
        },
    )
    .await?;

    println!(
        "added step {} to pipeline {} at position {}",
        step.id, pipeline.name, step.order_index
    );
    Ok(())
}

pub async fn reset_checkpoint(pool: &PgPool, name: &str) -> Result<()> {
    let pipeline = get_by_name(pool, name).await?;
    if pipeline.status == PipelineStatus::Running {
        bail!("pipeline {name:?} is RUNNING; reset it once it stops");
    }

    let deleted = checkpoints_db::delete_checkpoint(pool, pipeline.id).await?;
    if deleted > 0 {
        println!("checkpoint for pipeline {name} dropped; the next run starts from scratch");
    } else {
        println!("pipeline {name} has no checkpoint");
    }
    Ok(())
}

pub async fn request_run(pool: &PgPool, name: &str) -> Result<()> {
    let pipeline = get_by_name(pool, name).await?;

    // Idempotent: an already requested or running pipeline keeps its state.
    if matches!(
        pipeline.status,
        PipelineStatus::RunRequested | PipelineStatus::Running
    ) {
        println!("pipeline {name} is already {}", pipeline.status);
        return Ok(());
    }

    if PipelineStateMachine::request_run(pool, pipeline.id).await? {
        println!("pipeline {name} -> RUN_REQUESTED");
    } else {
        let status = pipelines_db::get_status(pool, pipeline.id).await?;
        println!("pipeline {name} not transitioned (now {status})");
    }
    Ok(())
}

pub async fn request_pause(pool: &PgPool, name: &str) -> Result<()> {
    let pipeline = get_by_name(pool, name).await?;

    if matches!(
        pipeline.status,
        PipelineStatus::PauseRequested | PipelineStatus::Paused
    ) {
        println!("pipeline {name} is already {}", pipeline.status);
        return Ok(());
    }

    if PipelineStateMachine::request_pause(pool, pipeline.id).await? {
        println!("pipeline {name} -> PAUSE_REQUESTED");
    } else {
        let status = pipelines_db::get_status(pool, pipeline.id).await?;
        println!("pipeline {name} not transitioned (now {status})");
    }
    Ok(())
}

pub async fn runs(pool: &PgPool, name: &str, limit: i64) -> Result<()> {
    let pipeline = get_by_name(pool, name).await?;
    let runs = runs_db::list_runs_for_pipeline(pool, pipeline.id, limit).await?;

    if runs.is_empty() {
        println!("no runs for pipeline {name}");
        return Ok(());
    }

    for run in runs {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_owned());
        let error = run
            .error_message
            .map(|e| format!(" error={e}"))
            .unwrap_or_default();
        println!(
            "{} {:<7} started={} finished={} read={} written={}{}",
            run.id,
            run.status.to_string(),
            run.started_at.to_rfc3339(),
            finished,
            run.rows_read,
            run.rows_written,
            error
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
