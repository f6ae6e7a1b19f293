//! nestedtx - nested transaction scopes over one database connection
//!
//! Application code opens and closes what look like nested transactions;
//! only the outermost commit, or any rollback, reaches the real connection.
//! Each transaction tree is bound to the owner context that opened it.
//!
//! # Example
//!
//! ```no_run
//! use nestedtx::connection::{Connection, MemoryDatabase};
//! use nestedtx::transaction::TransactionSource;
//!
//! let source = TransactionSource::new(MemoryDatabase::default());
//!
//! let mut tx = source.begin_transaction().unwrap();
//! source.connection().unwrap().execute("PUT user:1 {\"name\": \"Alice\"}").unwrap();
//! tx.commit().unwrap();
//! ```

pub mod connection;
pub mod error;
pub mod owner;
pub mod repl;
pub mod transaction;

pub use error::{TxError, TxResult};
pub use owner::{OwnerId, OwnerScope};
