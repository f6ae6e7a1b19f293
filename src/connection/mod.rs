//! Connection capability and its guarded form.
//!
//! [`Connection`] is the full surface of a database connection as seen by
//! this crate: transaction control (auto-commit, commit, rollback, isolation,
//! savepoints) plus statement execution and session metadata. Real
//! connections come from a [`ConnectionSource`]; [`ConnectionGuard`] is the
//! same surface with the transaction-control subset rejected.
//!
//! ```text
//!   ConnectionSource ──connection()──▶ Box<dyn Connection>
//!                                            │ owned by a moderator
//!                                            ▼
//!                                     ConnectionGuard  (handed to callers)
//! ```

mod guard;
mod isolation;
pub mod memory;
mod result;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TxResult;

pub use guard::ConnectionGuard;
pub use isolation::IsolationLevel;
pub use memory::{MemoryConfig, MemoryConnection, MemoryDatabase, MemoryStats};
pub use result::{QueryResult, ResultSet, Row};

/// A savepoint marker returned by [`Connection::set_savepoint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Savepoint {
    /// Backend-assigned identifier.
    pub id: u64,
    /// Name given at creation, if any.
    pub name: Option<String>,
}

/// Static description of a connection's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Backend product name.
    pub product_name: String,
    /// Backend product version.
    pub product_version: String,
    /// Whether the backend supports savepoints.
    pub supports_savepoints: bool,
}

/// A database connection.
///
/// Implementations are used from one owner at a time but must be `Send` so
/// a transaction can be created on one thread and inspected from another.
pub trait Connection: Send {
    // ==================== Transaction Control ====================

    /// Whether every statement commits on its own.
    fn auto_commit(&self) -> TxResult<bool>;

    /// Switch auto-commit mode.
    fn set_auto_commit(&mut self, enabled: bool) -> TxResult<()>;

    /// Commit pending work.
    fn commit(&mut self) -> TxResult<()>;

    /// Discard pending work.
    fn rollback(&mut self) -> TxResult<()>;

    /// Current isolation level.
    fn isolation_level(&self) -> TxResult<IsolationLevel>;

    /// Change the isolation level.
    fn set_isolation_level(&mut self, level: IsolationLevel) -> TxResult<()>;

    /// Create a savepoint inside the current transaction.
    fn set_savepoint(&mut self, name: Option<&str>) -> TxResult<Savepoint>;

    /// Forget a savepoint and every savepoint created after it.
    fn release_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()>;

    /// Undo the work done since `savepoint` was created.
    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()>;

    // ==================== Lifecycle ====================

    /// Release the connection. Closing twice is not an error.
    fn close(&mut self) -> TxResult<()>;

    /// Whether [`Connection::close`] has been called.
    fn is_closed(&self) -> TxResult<bool>;

    /// Check the connection is usable, waiting at most `timeout`.
    fn is_valid(&self, timeout: Duration) -> TxResult<bool>;

    // ==================== Statements ====================

    /// Execute a statement.
    fn execute(&mut self, statement: &str) -> TxResult<QueryResult>;

    /// The statement as the backend would run it.
    fn native_statement(&self, statement: &str) -> TxResult<String>;

    // ==================== Session & Metadata ====================

    /// Backend description.
    fn metadata(&self) -> TxResult<ConnectionMetadata>;

    /// Whether writes are refused.
    fn is_read_only(&self) -> TxResult<bool>;

    /// Refuse or allow writes.
    fn set_read_only(&mut self, read_only: bool) -> TxResult<()>;

    /// Current catalog.
    fn catalog(&self) -> TxResult<Option<String>>;

    /// Select a catalog.
    fn set_catalog(&mut self, catalog: Option<String>) -> TxResult<()>;

    /// Client info properties.
    fn client_info(&self) -> TxResult<BTreeMap<String, String>>;

    /// Set a client info property.
    fn set_client_info(&mut self, name: &str, value: &str) -> TxResult<()>;

    /// Warnings reported since the last [`Connection::clear_warnings`].
    fn warnings(&self) -> TxResult<Vec<String>>;

    /// Drop accumulated warnings.
    fn clear_warnings(&mut self) -> TxResult<()>;
}

/// Supplier of real connections.
///
/// Connections handed out must start with auto-commit enabled.
pub trait ConnectionSource: Send + Sync {
    /// Obtain a connection. May block.
    fn connection(&self) -> TxResult<Box<dyn Connection>>;
}

impl<F> ConnectionSource for F
where
    F: Fn() -> TxResult<Box<dyn Connection>> + Send + Sync,
{
    fn connection(&self) -> TxResult<Box<dyn Connection>> {
        self()
    }
}
