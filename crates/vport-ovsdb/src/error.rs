//! Error types for OVSDB operations.

use thiserror::Error;

/// Result type alias for OVSDB operations.
pub type OvsdbResult<T> = Result<T, OvsdbError>;

/// Errors that can occur while talking to the vswitch OVSDB server.
#[derive(Debug, Error)]
pub enum OvsdbError {
    /// Failed to dial the OVSDB Unix socket.
    #[error("Failed to connect to OVSDB endpoint '{endpoint}': {source}")]
    Connect {
        /// The socket path that was dialed.
        endpoint: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A JSON-RPC call failed at the protocol level.
    #[error("OVSDB RPC '{method}' failed: {message}")]
    Rpc {
        /// The JSON-RPC method.
        method: String,
        /// Error message.
        message: String,
    },

    /// A table operation failed. Wraps the transport error so callers only
    /// ever see the failing operation and table name.
    #[error("OVSDB {op} on table '{table}' failed: {message}")]
    Table {
        /// The table the operation targeted.
        table: String,
        /// The operation that failed (insert, delete, select, update).
        op: String,
        /// Error message.
        message: String,
    },

    /// A select matched no row where exactly one was required.
    #[error("No row found in table '{table}' matching {condition}")]
    RowNotFound {
        /// The table that was queried.
        table: String,
        /// Human-readable rendering of the condition.
        condition: String,
    },

    /// A monitor row update carried a present-but-empty value.
    #[error("Malformed row update: column '{column}' present but empty")]
    MalformedRowUpdate {
        /// The offending column.
        column: String,
    },

    /// A second registration was attempted for a still-active port name.
    #[error("Already registered for port updates on '{port}'")]
    DuplicateRegistration {
        /// The port name.
        port: String,
    },

    /// The connection (or the dispatcher behind it) has gone away.
    #[error("OVSDB connection closed")]
    ConnectionClosed,
}

impl OvsdbError {
    /// Wraps any error as a table operation failure.
    pub(crate) fn table(table: &str, op: &str, err: impl std::fmt::Display) -> Self {
        OvsdbError::Table {
            table: table.to_string(),
            op: op.to_string(),
            message: err.to_string(),
        }
    }
}
