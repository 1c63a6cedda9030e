/// Unified error type for the window engine
/// Provides structured error handling with categories for different failure modes
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Memory reservation refused while spill is disabled
    #[error("Over-commit: {message}")]
    OverCommit {
        message: String,
        limit: Option<usize>,
        reserved: Option<usize>,
    },

    /// Spill read/write failure that survived the single retry
    #[error("Spill IO error: {message}")]
    SpillIo {
        message: String,
        path: Option<String>,
        source_message: Option<String>,
    },

    /// Input page schema does not match the configured source types
    #[error("Type mismatch: {message}")]
    TypeMismatch {
        message: String,
        channel: Option<usize>,
    },

    /// Operator contract misuse, indicates a driver bug
    #[error("Invariant violation: {message}")]
    InvariantViolation {
        message: String,
        operator: Option<String>,
    },

    /// Surfaced for work rejected after close()
    #[error("Cancelled: {message}")]
    Cancelled {
        message: String,
    },
}

impl EngineError {
    pub fn over_commit(message: impl Into<String>) -> Self {
        Self::OverCommit {
            message: message.into(),
            limit: None,
            reserved: None,
        }
    }

    pub fn over_commit_with_usage(message: impl Into<String>, limit: usize, reserved: usize) -> Self {
        Self::OverCommit {
            message: message.into(),
            limit: Some(limit),
            reserved: Some(reserved),
        }
    }

    pub fn spill_io(message: impl Into<String>) -> Self {
        Self::SpillIo {
            message: message.into(),
            path: None,
            source_message: None,
        }
    }

    pub fn spill_io_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::SpillIo {
            message: message.into(),
            path: Some(path.into()),
            source_message: None,
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
            channel: None,
        }
    }

    pub fn type_mismatch_at(message: impl Into<String>, channel: usize) -> Self {
        Self::TypeMismatch {
            message: message.into(),
            channel: Some(channel),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
            operator: None,
        }
    }

    pub fn invariant_in(message: impl Into<String>, operator: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
            operator: Some(operator.into()),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::SpillIo {
            message: err.to_string(),
            path: None,
            source_message: None,
        }
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::InvariantViolation {
            message: format!("arrow error: {err}"),
            operator: None,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::InvariantViolation {
            message: err.to_string(),
            operator: None,
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
