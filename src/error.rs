//! Error types for the indexing pipeline
//!
//! Every layer of the pipeline surfaces failures through [`IndexError`].
//! The decision and plan layers are all-or-nothing; execution failures are
//! per-task and classified by the scheduler.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors raised by the indexing pipeline
#[derive(Debug, Error)]
pub enum IndexError {
    /// Invalid or missing configuration; aborts before discovery
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Filesystem access failure during discovery
    #[error("discovery error at {path}: {message}")]
    Discovery { path: PathBuf, message: String },

    /// Inconsistent decision report; indicates a bug, aborts the run
    #[error("decision error: {0}")]
    Decision(String),

    /// Dependency cycle, missing dependency id, or id collision in a plan
    #[error("plan validation error: {0}")]
    PlanValidation(String),

    /// Filesystem failure while executing a task
    #[error("task I/O error for {target}: {message}")]
    TaskIo { target: PathBuf, message: String },

    /// LLM transport failure after retries were exhausted
    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    /// LLM output still missing the end sentinel after all continuation
    /// attempts; no artifact is written for the target
    #[error("truncated LLM response for {target} after {attempts} continuation attempts")]
    TruncationDetected { target: PathBuf, attempts: usize },

    /// Path outside the mapped source root, or a root collision
    #[error("path mapping error: {0}")]
    PathMapping(String),

    /// Catch-all for errors that do not fit the taxonomy
    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Create a generic error from any displayable value
    pub fn other(msg: impl Into<String>) -> Self {
        IndexError::Other(msg.into())
    }

    /// Wrap an I/O error that occurred while working on `target`
    pub fn task_io(target: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        IndexError::TaskIo {
            target: target.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error represents a truncated LLM response
    pub fn is_truncation(&self) -> bool {
        matches!(self, IndexError::TruncationDetected { .. })
    }

    /// Process exit code for a run that aborted with this error
    ///
    /// 1 = plan validation, 3 = fatal task failure, 4 = configuration.
    pub fn exit_code(&self) -> i32 {
        match self {
            IndexError::PlanValidation(_) => 1,
            IndexError::Configuration(_) | IndexError::PathMapping(_) => 4,
            _ => 3,
        }
    }
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Other(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Other(format!("serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(IndexError::PlanValidation("cycle".into()).exit_code(), 1);
        assert_eq!(IndexError::Configuration("bad".into()).exit_code(), 4);
        assert_eq!(
            IndexError::task_io(PathBuf::from("a.txt"), "denied").exit_code(),
            3
        );
    }

    #[test]
    fn test_truncation_predicate() {
        let err = IndexError::TruncationDetected {
            target: PathBuf::from("src/a.txt"),
            attempts: 3,
        };
        assert!(err.is_truncation());
        assert!(!IndexError::other("x").is_truncation());
    }
}
