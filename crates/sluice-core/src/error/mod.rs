//! Error classification.
//!
//! Two error families drive control flow:
//!
//! - **Connectivity errors** (the database is unreachable or a connection
//!   died mid-flight) abort the current tick without failing the pipeline;
//!   the row stays RUNNING and startup recovery re-queues it.
//! - Everything else is an **execution error**: the run is closed FAILED
//!   and the dispatcher retries with backoff. [`ContractError`]s are a
//!   subset of execution errors that fail identically on every retry.

use thiserror::Error;

/// A violation of the pipeline contract: bad configuration or data that no
/// amount of retrying will fix. Still retried for uniformity; the pipeline
/// ends in FAILED either way.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("invalid {what}: {value:?}; expected a SQL identifier such as 'updated_at'")]
    InvalidIdentifier { what: &'static str, value: String },

    #[error("target table {0:?} is not in the allowlist")]
    TargetNotAllowed(String),

    #[error("transform {0:?} is not registered")]
    UnknownTransform(String),

    #[error("transform name {0:?} must lie under the {1:?} namespace")]
    TransformOutsideNamespace(String, &'static str),

    #[error("row does not contain column {0:?}")]
    MissingColumn(String),

    #[error("cursor column {column:?} must hold a non-null timestamp, got {actual}")]
    BadCursorValue { column: String, actual: String },
}

/// Message fragments that identify transport-layer failures regardless of
/// which error type carried them.
const CONNECTIVITY_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "connection was closed",
    "connection does not exist",
    "broken pipe",
    "failed to lookup address",
    "no address associated with hostname",
    "the database system is starting up",
    "pool timed out",
];

/// Classify an error as a connectivity failure.
///
/// Walks the whole cause chain: a sqlx I/O, TLS, or pool error anywhere in
/// the chain counts, as does a bare `std::io::Error` or any message
/// containing one of the transport-failure markers.
pub fn is_connectivity_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(sqlx_err) = cause.downcast_ref::<sqlx::Error>() {
            match sqlx_err {
                sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => return true,
                _ => {}
            }
        }

        if cause.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }

        let msg = cause.to_string().to_lowercase();
        if CONNECTIVITY_MARKERS.iter().any(|m| msg.contains(m)) {
            return true;
        }
    }

    false
}
