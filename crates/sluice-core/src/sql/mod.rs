//! SQL assembly for the batched readers.
//!
//! Cursor column names are interpolated into ORDER BY and column position,
//! where parameter binding is impossible, so they must pass the strict
//! identifier validator first. Every value position binds a parameter.

use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;

use sluice_db::models::Checkpoint;

use crate::error::ContractError;

/// Validate that `name` is a bare SQL identifier (`^[A-Za-z_][A-Za-z0-9_]*$`).
///
/// Returns the trimmed identifier. `what` names the field for the error
/// message.
pub fn validate_identifier<'a>(name: &'a str, what: &'static str) -> Result<&'a str> {
    let name = name.trim();
    let mut chars = name.chars();

    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if !valid {
        bail!(ContractError::InvalidIdentifier {
            what,
            value: name.to_owned(),
        });
    }

    Ok(name)
}

/// Case-insensitive word scan. `words` are matched as consecutive
/// whitespace-separated tokens.
fn contains_words(query: &str, words: &[&str]) -> bool {
    let tokens: Vec<String> = query
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ';' || c == ',')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect();

    tokens
        .windows(words.len())
        .any(|w| w.iter().map(String::as_str).eq(words.iter().copied()))
}

/// Strip trailing whitespace and semicolons from a source query.
fn normalize_query(query: &str) -> &str {
    query.trim().trim_end_matches(';').trim_end()
}

/// Wrap a source query with offset pagination:
/// `SELECT * FROM (<q>) AS src LIMIT <limit> OFFSET <offset>`.
///
/// The source query must carry its own deterministic ORDER BY and must not
/// paginate itself; both violations are rejected here rather than producing
/// nondeterministic batches downstream.
pub fn paginate(base_query: &str, limit: i64, offset: i64) -> Result<String> {
    let q = normalize_query(base_query);

    if q.is_empty() {
        bail!("source query is empty");
    }
    if !contains_words(q, &["order", "by"]) {
        bail!("full mode requires a deterministic ORDER BY in the source query");
    }
    if contains_words(q, &["limit"]) || contains_words(q, &["offset"]) {
        bail!("source query must not contain LIMIT/OFFSET; pagination is applied by the runner");
    }

    Ok(format!("SELECT * FROM ({q}) AS src LIMIT {limit} OFFSET {offset}"))
}

/// The resumable cursor of an incremental pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    /// The last processed value of the incremental key column.
    pub value: NaiveDateTime,
    /// Tie-breaker: the last processed value of the id column.
    pub id: CursorId,
}

/// The tie-breaker half of a cursor.
///
/// Stored as text in the checkpoint row; bound as BIGINT when the stored
/// form parses as an integer so comparisons against integer id columns
/// keep numeric ordering.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorId {
    Int(i64),
    Text(String),
}

impl CursorId {
    pub fn parse(s: &str) -> Self {
        match s.parse::<i64>() {
            Ok(i) => CursorId::Int(i),
            Err(_) => CursorId::Text(s.to_owned()),
        }
    }
}

impl Cursor {
    /// Decode a cursor from a checkpoint row.
    ///
    /// Returns `None` when no checkpoint value has been written yet. A
    /// checkpoint with a value but no id violates the both-advance-together
    /// invariant and is rejected.
    pub fn from_checkpoint(checkpoint: Option<&Checkpoint>) -> Result<Option<Cursor>> {
        let Some(checkpoint) = checkpoint else {
            return Ok(None);
        };

        let Some(raw_value) = checkpoint
            .last_processed_value
            .as_deref()
            .filter(|v| !v.is_empty())
        else {
            return Ok(None);
        };

        let Some(raw_id) = checkpoint
            .last_processed_id
            .as_deref()
            .filter(|v| !v.is_empty())
        else {
            bail!("checkpoint has a value but no id; cursor halves must advance together");
        };

        let value: NaiveDateTime = raw_value
            .parse()
            .with_context(|| format!("checkpoint value {raw_value:?} is not an ISO timestamp"))?;

        Ok(Some(Cursor {
            value,
            id: CursorId::parse(raw_id),
        }))
    }

    /// Encode the cursor value for checkpoint storage.
    pub fn encode_value(value: &NaiveDateTime) -> String {
        value.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
    }
}

/// SQL for the first incremental batch (no prior checkpoint): everything,
/// ordered by the cursor columns, limited. `$1` binds the limit.
pub fn incremental_first_batch(base_query: &str, inc_key: &str, id_key: &str) -> Result<String> {
    let q = normalize_query(base_query);
    let inc = validate_identifier(inc_key, "incremental_key")?;
    let id = validate_identifier(id_key, "incremental_id_key")?;

    Ok(format!(
        "SELECT * FROM ({q}) AS src \
         ORDER BY src.{inc}, src.{id} \
         LIMIT $1"
    ))
}

/// SQL for a resumed incremental batch: strictly after the cursor,
/// tie-broken by the id column. Binds `$1` = last value, `$2` = last id,
/// `$3` = limit.
pub fn incremental_resume_batch(base_query: &str, inc_key: &str, id_key: &str) -> Result<String> {
    let q = normalize_query(base_query);
    let inc = validate_identifier(inc_key, "incremental_key")?;
    let id = validate_identifier(id_key, "incremental_id_key")?;

    Ok(format!(
        "SELECT * FROM ({q}) AS src \
         WHERE (src.{inc} > $1) OR (src.{inc} = $1 AND src.{id} > $2) \
         ORDER BY src.{inc}, src.{id} \
         LIMIT $3"
    ))
}
