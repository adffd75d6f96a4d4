//! Custom error types for autopatch.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the execution core.

use thiserror::Error;

/// Main error type for autopatch operations
#[derive(Error, Debug)]
pub enum AutopatchError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Loop Errors
    // =========================================================================
    /// Language-model backend failed or returned nothing usable
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Circuit breaker or call budget refused a model call
    #[error("Model calls blocked: {reason}")]
    CircuitOpen { reason: String },

    // =========================================================================
    // Patch & Policy Errors
    // =========================================================================
    /// Target path escapes the project root
    #[error("Path escapes project root: {path}")]
    PathOutsideRoot { path: String },

    /// Operation could not be applied
    #[error("Patch failed for {target}: {message}")]
    Patch { target: String, message: String },

    /// Every operation of the loop is held for approval
    #[error("Operations awaiting approval: {ids}")]
    PolicyBlocked { ids: String },

    // =========================================================================
    // Transaction Errors
    // =========================================================================
    /// Checkpoint transaction error
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Worker Errors
    // =========================================================================
    /// No job with this id was ever submitted
    #[error("Unknown job: {id}")]
    JobNotFound { id: String },

    /// A job did not finish within the wait timeout
    #[error("Job {id} still {status} after {waited_ms}ms")]
    JobWaitTimeout {
        id: String,
        status: String,
        waited_ms: u64,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AutopatchError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a patch error
    pub fn patch(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Patch {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Transaction { .. } | Self::Git { .. } => 4,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for autopatch results
pub type Result<T> = std::result::Result<T, AutopatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AutopatchError::patch("a.py", "search text not found");
        assert_eq!(err.to_string(), "Patch failed for a.py: search text not found");

        let err = AutopatchError::PolicyBlocked {
            ids: "1, 2".into(),
        };
        assert_eq!(err.to_string(), "Operations awaiting approval: 1, 2");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AutopatchError::transaction("stash pop conflict").exit_code(), 4);
        assert_eq!(AutopatchError::git("reset", "bad revision").exit_code(), 4);
        assert_eq!(
            AutopatchError::MissingTool { tool: "git".into() }.exit_code(),
            6
        );
        assert_eq!(AutopatchError::config("test").exit_code(), 7);
        assert_eq!(AutopatchError::backend("unreachable").exit_code(), 1);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: AutopatchError = io_err.into();
        assert!(matches!(err, AutopatchError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_error_from_anyhow_is_transparent() {
        let err: AutopatchError = anyhow::anyhow!("lock held by pid 42").into();
        assert_eq!(err.to_string(), "lock held by pid 42");
    }
}
