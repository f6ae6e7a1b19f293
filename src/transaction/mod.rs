//! Nested transaction management.
//!
//! Application code opens scopes with
//! [`TransactionSource::begin_transaction`]. The first scope of an owner
//! acquires a connection and switches it to manual commit; nested scopes
//! only bump a depth counter. The real commit happens when the outermost
//! scope commits. Rolling back any scope, or dropping its handle without a
//! commit, rolls back the whole tree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionSource                         │
//! │      (registry: one live moderator per owner context)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!  ┌───────────────────┐  ┌─────────────┐  ┌──────────────────┐
//!  │ TransactionHandle │─▶│  Moderator  │◀─│ ConnectionGuard  │
//!  │   (one per scope) │  │ (depth, conn)│  │ (no tx control)  │
//!  └───────────────────┘  └─────────────┘  └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use nestedtx::connection::{Connection, MemoryDatabase};
//! use nestedtx::transaction::TransactionSource;
//!
//! let db = MemoryDatabase::default();
//! let source = TransactionSource::new(db.clone());
//!
//! let mut outer = source.begin_transaction()?;
//! source.connection()?.execute("PUT a 1")?;
//!
//! let mut inner = source.begin_transaction()?;
//! source.connection()?.execute("PUT b 2")?;
//! inner.commit()?; // bookkeeping only
//!
//! outer.commit()?; // the real commit
//! assert_eq!(db.stats().commits, 1);
//! # Ok::<(), nestedtx::TxError>(())
//! ```

mod handle;
mod moderator;
mod registry;
mod source;

pub use handle::TransactionHandle;
pub use moderator::{TransactionInfo, ABORTED_DEPTH, INITIAL_DEPTH, ORIGINAL_DEPTH};
pub use source::TransactionSource;

pub(crate) use moderator::SharedModerator;
