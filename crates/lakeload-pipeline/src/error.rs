//! Pipeline error types
//!
//! Every error that can be retried carries a [`FailureKind`] so callers (and
//! the run report) can tell a permanent fault from an exhausted transient one.

use std::fmt;
use thiserror::Error;

use crate::retry::{RetryError, Retryable};

/// Classification attached to storage and database failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Not-found, access denied, constraint violation, syntax error
    Permanent,
    /// Timeout, 5xx, connection reset (only seen before retry gives up)
    Transient,
    /// A transient fault that kept happening until the attempt budget ran out
    TransientExhausted,
    /// The run was cancelled while the operation was waiting to retry
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Permanent => "permanent",
            FailureKind::Transient => "transient",
            FailureKind::TransientExhausted => "transient-exhausted",
            FailureKind::Cancelled => "cancelled",
        })
    }
}

/// Raw object-store failure, before retry classification is final
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct StoreError {
    pub transient: bool,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Errors from locating or fetching a batch
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("No date folders matching '{pattern}' under '{root}'")]
    NoBatch { root: String, pattern: String },

    #[error("Date folder '{0}' does not exist")]
    FolderNotFound(String),

    #[error("Invalid discovery configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error ({kind}) on '{key}' after {attempts} attempt(s): {message}")]
    Storage {
        key: String,
        kind: FailureKind,
        attempts: u32,
        message: String,
    },
}

impl DiscoveryError {
    pub fn from_retry(key: &str, err: RetryError<StoreError>) -> Self {
        let kind = err.kind();
        let attempts = err.attempts();
        let message = err
            .last_error()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "cancelled before first attempt".to_string());
        Self::Storage {
            key: key.to_string(),
            kind,
            attempts,
            message,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            DiscoveryError::Storage { kind, .. } => *kind,
            _ => FailureKind::Permanent,
        }
    }
}

/// Errors from the database gateway
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Database error ({kind}) after {attempts} attempt(s): {message}")]
    Database {
        kind: FailureKind,
        attempts: u32,
        message: String,
    },

    #[error("Connection pool exhausted after {attempts} attempt(s)")]
    PoolExhausted { attempts: u32 },

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Database configuration error: {0}")]
    Config(String),
}

impl QueryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            QueryError::Database { kind, .. } => *kind,
            QueryError::PoolExhausted { .. } => FailureKind::TransientExhausted,
            QueryError::Aborted(_) | QueryError::InvalidIdentifier(_) | QueryError::Config(_) => {
                FailureKind::Permanent
            },
        }
    }

    /// Pool exhaustion that survived every retry stops the whole run
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, QueryError::PoolExhausted { .. })
    }
}

/// One failed chunk of a bulk load
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Aggregate outcome of a bulk load where at least one batch failed
#[derive(Error, Debug)]
#[error("{} of {total_batches} batch(es) failed loading '{table}' (failed: {indices}); {rows_loaded} row(s) loaded", failures.len(), indices = self.failed_indices_display())]
pub struct BulkLoadError {
    pub table: String,
    pub total_batches: usize,
    pub rows_loaded: u64,
    pub failures: Vec<BatchFailure>,
    /// Set when a failure was pool exhaustion after retries
    pub pool_exhausted: bool,
}

impl BulkLoadError {
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.batch_index).collect()
    }

    fn failed_indices_display(&self) -> String {
        self.failed_indices()
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Failure importing one column file
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Failed to decode '{path}': {message}")]
    Decode { path: String, message: String },

    #[error("Schema mismatch for '{table}': {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("Failed to fetch '{0}'")]
    Fetch(#[source] DiscoveryError),

    #[error(transparent)]
    Load(#[from] BulkLoadError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Failure from the external embedding capability
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Request(String),

    /// 5xx, 429, timeout or connection failure
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding request gave up ({kind}) after {attempts} attempt(s): {message}")]
    Retry {
        kind: FailureKind,
        attempts: u32,
        message: String,
    },

    #[error("Embedding provider returned {got} vector(s) for {expected} input(s)")]
    CountMismatch { expected: usize, got: usize },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl EmbeddingError {
    /// Classify an HTTP status from the provider
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::Unavailable(message)
        } else {
            Self::Request(message)
        }
    }

    /// Permanent errors come back unchanged; exhaustion and cancellation are
    /// tagged with their kind and attempt count
    pub fn from_retry(err: RetryError<EmbeddingError>) -> Self {
        let kind = err.kind();
        let attempts = err.attempts();
        match err {
            RetryError::Permanent { error, .. } => error,
            other => Self::Retry {
                kind,
                attempts,
                message: other
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "cancelled before first attempt".to_string()),
            },
        }
    }
}

impl Retryable for EmbeddingError {
    fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Unavailable(_))
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(err: reqwest::Error) -> Self {
        let transient = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .is_some_and(|s| s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS);
        if transient {
            Self::Unavailable(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Failure building the search index for one column
#[derive(Error, Debug)]
#[error("Index build failed for column '{column}': {source}")]
pub struct IndexError {
    pub column: String,
    #[source]
    pub source: QueryError,
}

/// Invalid configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file '{path}': {message}")]
    File { path: String, message: String },
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Unexpected fault escaping a pipeline component.
///
/// The orchestrator turns these into `failure` stage results; only
/// [`PipelineError::is_run_fatal`] errors stop the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub fn is_run_fatal(&self) -> bool {
        match self {
            PipelineError::Query(e) => e.is_run_fatal(),
            PipelineError::Import(ImportError::Query(e)) => e.is_run_fatal(),
            PipelineError::Import(ImportError::Load(e)) => e.pool_exhausted,
            PipelineError::Index(e) => e.source.is_run_fatal(),
            _ => false,
        }
    }
}
