use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a pipeline.
///
/// Stored as uppercase text in the `pipelines.status` column; every
/// transition between these states is a conditional single-statement
/// UPDATE (see `queries::pipelines`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Idle,
    RunRequested,
    Running,
    PauseRequested,
    Paused,
    Failed,
}

impl PipelineStatus {
    /// All states a user `run` command may transition from.
    pub const RUNNABLE_FROM: [PipelineStatus; 4] = [
        Self::Idle,
        Self::Paused,
        Self::PauseRequested,
        Self::Failed,
    ];

    /// All states a user `pause` command may transition from.
    pub const PAUSABLE_FROM: [PipelineStatus; 3] =
        [Self::Running, Self::RunRequested, Self::Idle];
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::RunRequested => "RUN_REQUESTED",
            Self::Running => "RUNNING",
            Self::PauseRequested => "PAUSE_REQUESTED",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for PipelineStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "RUN_REQUESTED" => Ok(Self::RunRequested),
            "RUNNING" => Ok(Self::Running),
            "PAUSE_REQUESTED" => Ok(Self::PauseRequested),
            "PAUSED" => Ok(Self::Paused),
            "FAILED" => Ok(Self::Failed),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PipelineStatus`] string.
#[derive(Debug, Clone)]
pub struct StatusParseError(pub String);

impl fmt::Display for StatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline status: {:?}", self.0)
    }
}

impl std::error::Error for StatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of a pipeline -- determines how the transform chain is resolved.
///
/// `Sql` and `Es` pipelines pass rows through unchanged; `Transform`
/// pipelines run the registered row-transform named by `transform_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Sql,
    Transform,
    Es,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sql => "sql",
            Self::Transform => "transform",
            Self::Es => "es",
        };
        f.write_str(s)
    }
}

impl FromStr for PipelineKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql" => Ok(Self::Sql),
            "transform" => Ok(Self::Transform),
            "es" => Ok(Self::Es),
            other => Err(KindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PipelineKind`] string.
#[derive(Debug, Clone)]
pub struct KindParseError(pub String);

impl fmt::Display for KindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline kind: {:?}", self.0)
    }
}

impl std::error::Error for KindParseError {}

// ---------------------------------------------------------------------------

/// Execution mode of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Re-read the whole source with offset pagination on every run.
    Full,
    /// Resume from the durable checkpoint cursor.
    Incremental,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        };
        f.write_str(s)
    }
}

impl FromStr for PipelineMode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(ModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PipelineMode`] string.
#[derive(Debug, Clone)]
pub struct ModeParseError(pub String);

impl fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline mode: {:?}", self.0)
    }
}

impl std::error::Error for ModeParseError {}

// ---------------------------------------------------------------------------

/// Kind of a step within a multi-step pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Sql,
    Transform,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sql => "sql",
            Self::Transform => "transform",
        };
        f.write_str(s)
    }
}

impl FromStr for StepKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sql" => Ok(Self::Sql),
            "transform" => Ok(Self::Transform),
            other => Err(KindParseError(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A pipeline definition -- the operator-owned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: PipelineKind,
    pub mode: PipelineMode,
    pub enabled: bool,
    pub status: PipelineStatus,
    pub source_query: Option<String>,
    pub transform_name: Option<String>,
    pub target_table: String,
    pub batch_size: i32,
    pub incremental_key: Option<String>,
    pub incremental_id_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered step of a multi-step pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineStep {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub order_index: i32,
    pub step_kind: StepKind,
    pub body: String,
    pub target_table: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One execution attempt of a pipeline, owned by the runner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub rows_read: i64,
    pub rows_written: i64,
    pub error_message: Option<String>,
}

/// The durable resumable cursor of an incremental pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub pipeline_id: Uuid,
    pub last_processed_value: Option<String>,
    pub last_processed_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
