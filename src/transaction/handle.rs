//! Scoped transaction handle.

use std::fmt;

use tracing::warn;

use crate::connection::ConnectionGuard;
use crate::error::{TxError, TxResult};
use crate::owner::OwnerId;
use crate::transaction::moderator::SharedModerator;

/// One nesting level of a transaction tree.
///
/// Returned by every [`TransactionSource::begin_transaction`] call. A scope
/// ends in exactly one of two ways:
/// - [`TransactionHandle::commit`] records this level's commit; the real
///   commit happens when the outermost level commits.
/// - dropping the handle (or [`TransactionHandle::rollback`]) without a
///   successful commit rolls back the *entire* tree, including every
///   enclosing scope.
///
/// [`TransactionSource::begin_transaction`]: crate::transaction::TransactionSource::begin_transaction
#[must_use = "dropping a transaction handle rolls back the whole transaction"]
pub struct TransactionHandle {
    moderator: SharedModerator,
    closed: bool,
}

impl TransactionHandle {
    pub(crate) fn new(moderator: SharedModerator) -> Self {
        Self {
            moderator,
            closed: false,
        }
    }

    /// Commit this nesting level.
    ///
    /// Fails with [`TxError::InvalidState`] if the handle is already closed
    /// or the tree is no longer alive, and with [`TxError::ThreadAffinity`]
    /// when called outside the owner context. On failure the handle stays
    /// open, so dropping it still rolls back.
    pub fn commit(&mut self) -> TxResult<()> {
        if self.closed {
            return Err(TxError::invalid_state("transaction handle already closed"));
        }
        self.moderator.lock().commit(OwnerId::current())?;
        self.closed = true;
        Ok(())
    }

    /// Roll back the whole tree now and report the outcome.
    ///
    /// A no-op if the handle is closed or the tree is already dead.
    pub fn rollback(mut self) -> TxResult<()> {
        let result = self.release();
        self.closed = true;
        result
    }

    fn release(&mut self) -> TxResult<()> {
        if self.closed {
            return Ok(());
        }
        self.moderator.lock().rollback(OwnerId::current())?;
        self.closed = true;
        Ok(())
    }

    /// Guarded connection of this transaction.
    pub fn connection(&self) -> TxResult<ConnectionGuard> {
        self.moderator.lock().connection(OwnerId::current())?;
        Ok(ConnectionGuard::new(self.moderator.clone()))
    }

    /// Current nesting depth of the tree.
    pub fn depth(&self) -> i32 {
        self.moderator.lock().depth()
    }

    /// Owner of the tree.
    pub fn owner(&self) -> OwnerId {
        self.moderator.lock().owner()
    }

    /// Unique id of the tree this handle belongs to.
    pub fn transaction_id(&self) -> String {
        self.moderator.lock().id().to_string()
    }

    /// Whether this handle has committed or rolled back.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fails unless the whole tree has been committed.
    pub fn ensure_committed(&self) -> TxResult<()> {
        self.moderator.lock().ensure_committed()
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "rollback on scope exit failed");
        }
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let moderator = self.moderator.lock();
        write!(
            f,
            "transaction {}: depth:{}: owner:{}",
            moderator.id(),
            moderator.depth(),
            moderator.owner()
        )
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let moderator = self.moderator.lock();
        f.debug_struct("TransactionHandle")
            .field("transaction_id", &moderator.id())
            .field("depth", &moderator.depth())
            .field("closed", &self.closed)
            .finish()
    }
}
