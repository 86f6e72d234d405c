//! Error types for the audit daemon.

use thiserror::Error;

/// Result type alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors that can occur in the audit daemon.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The daemon was stopped by an external signal. This is the only error
    /// that terminates the daemon loop.
    #[error("Daemon was interrupted by an external signal")]
    Interrupted,

    /// A control-plane operation failed.
    #[error("Control plane {op} failed: {message}")]
    ControlPlane {
        /// The operation that failed.
        op: String,
        /// Error message.
        message: String,
    },

    /// Querying the orchestrator inventory failed.
    #[error("Orchestrator inventory query failed: {message}")]
    Inventory {
        /// Error message.
        message: String,
    },

    /// Sending a deletion notification to the monitor failed.
    #[error("Deletion notification failed: {message}")]
    Notify {
        /// Error message.
        message: String,
    },

    /// Installing a signal handler failed.
    #[error("Failed to install signal handler: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
}

impl AuditError {
    /// Wraps any error as a control-plane operation failure.
    pub fn control_plane(op: &str, err: impl std::fmt::Display) -> Self {
        AuditError::ControlPlane {
            op: op.to_string(),
            message: err.to_string(),
        }
    }
}
