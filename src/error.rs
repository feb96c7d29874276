//! Error types for the exporter.
//!
//! A single `ExporterError` enum covers every failure a run can surface. The task graph is the
//! only place that decides a failure is fatal to the run; everything else just returns one of
//! these variants.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::resilience::{classify_connection_error, ConnectionErrorClass};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExporterError {
    /// Unsupported dialect, missing mapping, invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote endpoint actively refused the connection (not yet listening)
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Any other connectivity failure (authentication, DNS, TLS, permissions)
    #[error("Connection error: {0}")]
    ConnectionFatal(String),

    #[error("Connection retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A preprocessing statement or export query failed
    #[error("Query error: {0}")]
    Query(String),

    #[error("Filesystem error during {operation} on '{}': {reason}", path.display())]
    Filesystem {
        operation: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Archive error: {0}")]
    Archive(String),

    /// Authentication, stream or remote-write failure during transfer
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Aggregated orphan recovery failures; reported but never fatal to a run
    #[error("Orphan check failed for {} path(s): {}", failures.len(), failures.join("; "))]
    OrphanCheck { failures: Vec<String> },

    /// Invalid task graph (cycle, unknown dependency, duplicate step) or missing step input
    #[error("Task graph error: {0}")]
    Graph(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl ExporterError {
    /// Only an actively refused connection is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExporterError::ConnectionRefused(_))
    }

    /// Short machine-readable name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ExporterError::Configuration(_) => "configuration",
            ExporterError::ConnectionRefused(_) => "connection_refused",
            ExporterError::ConnectionFatal(_) => "connection_fatal",
            ExporterError::RetriesExhausted { .. } => "retries_exhausted",
            ExporterError::Query(_) => "query",
            ExporterError::Filesystem { .. } => "filesystem",
            ExporterError::Archive(_) => "archive",
            ExporterError::Transfer(_) => "transfer",
            ExporterError::OrphanCheck { .. } => "orphan_check",
            ExporterError::Graph(_) => "graph",
            ExporterError::TaskPanicked(_) => "task_panicked",
        }
    }

    pub fn filesystem(operation: impl Into<String>, path: impl AsRef<Path>, err: io::Error) -> Self {
        ExporterError::Filesystem {
            operation: operation.into(),
            path: path.as_ref().to_path_buf(),
            reason: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for ExporterError {
    fn from(err: sqlx::Error) -> Self {
        match classify_connection_error(&err) {
            ConnectionErrorClass::Refused => ExporterError::ConnectionRefused(err.to_string()),
            ConnectionErrorClass::Fatal => ExporterError::ConnectionFatal(err.to_string()),
            ConnectionErrorClass::NotConnection => ExporterError::Query(err.to_string()),
        }
    }
}

impl From<crate::config::ConfigurationError> for ExporterError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        ExporterError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
