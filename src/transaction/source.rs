//! Transaction source - entry point for connections and transaction scopes.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionGuard, ConnectionSource};
use crate::error::{TxError, TxResult};
use crate::owner::OwnerId;
use crate::transaction::handle::TransactionHandle;
use crate::transaction::moderator::{Moderator, SharedModerator, TransactionInfo};
use crate::transaction::registry::Registry;

/// Connection source with nested transaction scopes.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
/// Each owner context gets its own transaction tree.
#[derive(Clone)]
pub struct TransactionSource {
    inner: Arc<TransactionSourceInner>,
}

struct TransactionSourceInner {
    /// Supplier of real connections.
    source: Box<dyn ConnectionSource>,
    /// Live moderators by owner.
    registry: Arc<Registry>,
}

impl TransactionSource {
    /// Wrap a connection source.
    pub fn new<S>(source: S) -> Self
    where
        S: ConnectionSource + 'static,
    {
        Self {
            inner: Arc::new(TransactionSourceInner {
                source: Box::new(source),
                registry: Arc::new(Registry::new()),
            }),
        }
    }

    /// Get a connection for the calling owner.
    ///
    /// Outside a transaction this is a plain auto-commit connection from the
    /// wrapped source. Inside one it is a [`ConnectionGuard`] over the
    /// transaction's connection.
    pub fn connection(&self) -> TxResult<Box<dyn Connection>> {
        let owner = OwnerId::current();
        match self.inner.registry.get(owner) {
            None => self.inner.source.connection(),
            Some(moderator) => {
                moderator.lock().connection(owner)?;
                Ok(Box::new(ConnectionGuard::new(moderator)))
            }
        }
    }

    /// Connections with explicit credentials are not supported.
    pub fn connection_with_credentials(
        &self,
        _user: &str,
        _password: &str,
    ) -> TxResult<Box<dyn Connection>> {
        Err(TxError::unsupported("connection_with_credentials"))
    }

    /// Begin a transaction scope, nested inside the caller's open one if any.
    pub fn begin_transaction(&self) -> TxResult<TransactionHandle> {
        let owner = OwnerId::current();
        let moderator = match self.inner.registry.get(owner) {
            Some(moderator) => moderator,
            None => self.open_moderator(owner)?,
        };

        moderator.lock().begin(owner)?;
        Ok(TransactionHandle::new(moderator))
    }

    fn open_moderator(&self, owner: OwnerId) -> TxResult<SharedModerator> {
        let moderator = Moderator::open(
            owner,
            &*self.inner.source,
            Arc::downgrade(&self.inner.registry),
        )?;
        let tx_id = moderator.id().to_string();
        debug!(%tx_id, %owner, "registering transaction");
        Ok(self
            .inner
            .registry
            .insert(owner, tx_id, moderator.into_shared()))
    }

    /// Execute a function within a transaction scope.
    ///
    /// If the function returns Ok, the scope is committed. If it returns Err
    /// or panics, the whole transaction tree is rolled back.
    pub fn with_transaction<F, T>(&self, f: F) -> TxResult<T>
    where
        F: FnOnce(&mut ConnectionGuard) -> TxResult<T>,
    {
        let mut tx = self.begin_transaction()?;
        let mut conn = tx.connection()?;

        match f(&mut conn) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback after failed scope");
                }
                Err(e)
            }
        }
    }

    /// Get the number of owners with an open transaction.
    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Check if `owner` has an open transaction.
    pub fn is_active(&self, owner: OwnerId) -> bool {
        self.inner.registry.contains(owner)
    }

    /// Snapshot of the open transaction of `owner`.
    pub fn transaction_info(&self, owner: OwnerId) -> Option<TransactionInfo> {
        let moderator = self.inner.registry.get(owner)?;
        let info = moderator.lock().info();
        Some(info)
    }

    /// Snapshots of every open transaction.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.inner
            .registry
            .moderators()
            .into_iter()
            .map(|moderator| moderator.lock().info())
            .collect()
    }
}

impl fmt::Debug for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSource")
            .field("active_count", &self.active_count())
            .finish()
    }
}
