//! Error taxonomy for a reconciliation run.
//!
//! Per-item problems (`ValidationError`, failed calendar calls) are counted in
//! the run summary. `SourceError` aborts a single category. `SyncError` is
//! fatal for the whole run.
use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// A raw source item that cannot be turned into a `SyncItem`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing identifier field `{0}`")]
    MissingId(&'static str),
    #[error("missing time field `{0}`")]
    MissingTime(&'static str),
    #[error("unparseable time field `{field}`: {value}")]
    BadTime { field: &'static str, value: String },
    #[error("end time precedes start time")]
    EndBeforeStart,
}

/// Failure reported by the source platform for one category fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source rejected the credential")]
    Unauthorized,
    #[error("source rate limited the request")]
    RateLimited,
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("invalid source payload: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether another attempt within the same run may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited | SourceError::Transient(_))
    }
}

/// Failures that stop the entire run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("another run holds the state lock at {0}")]
    StateConflict(PathBuf),
    #[error("credential file {path} unusable: {reason}")]
    Credentials { path: PathBuf, reason: String },
    #[error("failed to build client: {0}")]
    Client(#[source] anyhow::Error),
    #[error("state store failure: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl SyncError {
    pub fn persistence(err: impl Into<anyhow::Error>) -> Self {
        SyncError::Persistence(err.into())
    }
}
