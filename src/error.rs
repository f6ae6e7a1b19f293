//! Error types shared by the connection and transaction layers.
//!
//! Every fallible operation in this crate returns [`TxResult`]. Errors are
//! surfaced synchronously and never retried internally.

use thiserror::Error;

use crate::owner::OwnerId;

/// Result type for connection and transaction operations.
pub type TxResult<T> = Result<T, TxError>;

/// Errors that can occur while driving connections and transactions.
#[derive(Debug, Error)]
pub enum TxError {
    /// The connection source handed out a connection in an unexpected state.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A transaction was driven from a context that does not own it.
    #[error("invalid owner context: transaction belongs to {owner}, called from {caller}")]
    ThreadAffinity { owner: OwnerId, caller: OwnerId },

    /// Operation attempted against a dead transaction or a closed handle.
    #[error("invalid operation: {0}")]
    InvalidState(String),

    /// Transaction control attempted through a guarded connection.
    #[error("operation not supported by guarded connection: {operation}")]
    Unsupported { operation: &'static str },

    /// The underlying connection has already been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Write attempted on a read-only connection.
    #[error("connection is read-only")]
    ReadOnly,

    /// The statement could not be understood by the backend.
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// JSON value could not be parsed or rendered.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other failure reported by the backend.
    #[error("backend error: {0}")]
    Backend(String),
}

impl TxError {
    /// Check if this error comes from misuse of the transaction API rather
    /// than from the connection itself.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            TxError::ThreadAffinity { .. }
                | TxError::InvalidState(_)
                | TxError::Unsupported { .. }
        )
    }

    /// Check if this error was raised by the underlying connection.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            TxError::ConnectionClosed
                | TxError::ReadOnly
                | TxError::InvalidStatement(_)
                | TxError::Json(_)
                | TxError::Backend(_)
        )
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub(crate) fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }
}
