//! Error types for crossmatrix.

use std::path::PathBuf;
use thiserror::Error;

/// Backend operation that produced an error or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Build,
    Run,
    Exec,
    CopyOut,
    Destroy,
    Prepare,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Build => "build",
            Operation::Run => "run",
            Operation::Exec => "exec",
            Operation::CopyOut => "copy-out",
            Operation::Destroy => "destroy",
            Operation::Prepare => "prepare",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unsupported platform/architecture combination: {platform}/{architecture}")]
    UnsupportedCombination {
        platform: String,
        architecture: String,
    },

    // Execution errors
    #[error("Backend {operation} failed: {message}")]
    Backend {
        operation: Operation,
        message: String,
    },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: Operation, seconds: u64 },

    #[error("Resource leak: {resource} not torn down after {attempts} attempts: {message}")]
    ResourceLeak {
        resource: String,
        attempts: u32,
        message: String,
    },

    #[error("Invalid job status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Aggregation invariant violated: {0}")]
    Aggregation(String),

    #[error("Run cancelled")]
    Cancelled,

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn backend(operation: Operation, message: impl Into<String>) -> Self {
        Error::Backend {
            operation,
            message: message.into(),
        }
    }

    pub fn timeout(operation: Operation, limit: std::time::Duration) -> Self {
        Error::Timeout {
            operation,
            seconds: limit.as_secs(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Errors raised while loading or validating a matrix document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("{}:{line}:{column}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{}: {field}: {message}", path.display())]
    Invalid {
        path: PathBuf,
        field: String,
        message: String,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Build a parse error from a serde_yaml error, keeping its location.
    pub fn from_yaml(path: impl Into<PathBuf>, err: serde_yaml::Error) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));
        ConfigError::Parse {
            path: path.into(),
            line,
            column,
            message: err.to_string(),
        }
    }
}
