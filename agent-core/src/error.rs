//! Error types shared across the agent

use std::time::Duration;
use thiserror::Error;

/// Invalid or missing configuration, detected at construction time
///
/// Always fatal at startup: a worker pool never starts with a grader
/// that failed to build.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A required value was not provided
    #[error("missing required configuration value: {0}")]
    Missing(&'static str),

    /// A value was provided but is not acceptable
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigurationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A single grading attempt failed
///
/// Recoverable per message: the worker settles the delivery according to
/// its failure policy and keeps consuming.
#[derive(Debug, Error)]
pub enum GradingError {
    /// The grading backend could not be reached
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend did not answer within the configured timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered with a non-success HTTP status
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The backend answered but the body could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The grading process exited unsuccessfully
    #[error("grading process failed (exit code {code:?}): {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },
}

impl GradingError {
    /// Stable, low-cardinality name of the failure kind for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            GradingError::Connection(_) => "connection",
            GradingError::Timeout(_) => "timeout",
            GradingError::Status { .. } => "status",
            GradingError::MalformedResponse(_) => "malformed_response",
            GradingError::ProcessFailed { .. } => "process_failed",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GradingError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grading_error_kinds() {
        assert_eq!(GradingError::Connection("refused".into()).kind(), "connection");
        assert_eq!(GradingError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(
            GradingError::Status {
                status: 500,
                body: String::new()
            }
            .kind(),
            "status"
        );
        assert!(GradingError::Timeout(Duration::from_millis(5)).is_timeout());
        assert!(!GradingError::MalformedResponse("eof".into()).is_timeout());
    }

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError::invalid("workers", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration value for workers: must be greater than 0"
        );
        assert_eq!(
            ConfigurationError::Missing("url").to_string(),
            "missing required configuration value: url"
        );
    }
}
