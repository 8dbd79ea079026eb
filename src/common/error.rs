use std::time::Duration;
use thiserror::Error;

/// Batch-level failures. Per-record problems never surface here; they are
/// collected as `ValidationIssue`s instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to read extract {locator}: {reason}")]
    Read {
        locator: String,
        reason: String,
        retryable: bool,
    },

    #[error("failed to write {object_key}: {reason}")]
    Write {
        object_key: String,
        reason: String,
        retryable: bool,
    },

    #[error("batch {batch_id} failed the quality gate: {reason}")]
    QualityGate { batch_id: String, reason: String },

    #[error("catalog notification for {table_name} at {partition_path} failed: {reason}")]
    Notify {
        table_name: String,
        partition_path: String,
        reason: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("no table bundle registered for '{0}'")]
    UnknownTable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Transient failures worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Read { retryable, .. } | PipelineError::Write { retryable, .. } => *retryable,
            PipelineError::Notify { .. } | PipelineError::Timeout { .. } | PipelineError::Io(_) => true,
            _ => false,
        }
    }
}

/// Errors raised by object store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// Reasons a single value could not be masked. The offending value is never
/// carried in the error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MaskingError {
    #[error("expected {expected}, found {found_len} characters")]
    UnexpectedFormat { expected: &'static str, found_len: usize },

    #[error("unsupported value type {0}")]
    UnsupportedType(&'static str),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
