//! Transaction depth state machine.
//!
//! One moderator exists per owner while that owner has a transaction tree
//! open. It owns the real connection and is the only code allowed to commit
//! or roll it back.
//!
//! ```text
//!            begin              begin             commit
//!  INITIAL(-1) ──▶ ORIGINAL(0) ──▶ 1 ──▶ … ──▶ n ──▶ n-1 ──▶ … ──▶ 0
//!      ▲                                                            │
//!      └────────────── commit at 0: real commit ────────────────────┘
//!
//!  rollback at any depth >= 0: real rollback ──▶ ABORTED(-2)
//! ```
//!
//! There is no partial rollback: rolling back an inner scope aborts the whole
//! tree.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::connection::{Connection, ConnectionSource};
use crate::error::{TxError, TxResult};
use crate::owner::OwnerId;
use crate::transaction::registry::Registry;

/// Depth of a tree that was rolled back.
pub const ABORTED_DEPTH: i32 = -2;

/// Depth of a tree with no open scope.
pub const INITIAL_DEPTH: i32 = -1;

/// Depth of the outermost open scope.
pub const ORIGINAL_DEPTH: i32 = 0;

/// Moderator shared by the registry and every handle of the tree.
pub(crate) type SharedModerator = Arc<Mutex<Moderator>>;

/// Snapshot of a live transaction tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionInfo {
    /// Unique transaction id.
    pub id: String,
    /// Owner driving the transaction.
    pub owner: OwnerId,
    /// Current nesting depth.
    pub depth: i32,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
}

pub(crate) struct Moderator {
    id: String,
    owner: OwnerId,
    depth: i32,
    connection: Box<dyn Connection>,
    /// Set once auto-commit has been restored and the connection closed.
    released: bool,
    started_at: DateTime<Utc>,
    registry: Weak<Registry>,
}

impl Moderator {
    /// Acquire a connection for `owner` and switch it to manual commit.
    pub(crate) fn open(
        owner: OwnerId,
        source: &dyn ConnectionSource,
        registry: Weak<Registry>,
    ) -> TxResult<Self> {
        let mut connection = source.connection()?;

        let auto_commit = match connection.auto_commit() {
            Ok(auto_commit) => auto_commit,
            Err(e) => {
                let _ = connection.close();
                return Err(e);
            }
        };
        if !auto_commit {
            let _ = connection.close();
            return Err(TxError::Configuration(
                "initial auto-commit mode is false".into(),
            ));
        }
        if let Err(e) = connection.set_auto_commit(false) {
            let _ = connection.close();
            return Err(e);
        }

        let id = Ulid::new().to_string().to_lowercase();
        debug!(tx_id = %id, %owner, "opened transaction connection");

        Ok(Self {
            id,
            owner,
            depth: INITIAL_DEPTH,
            connection,
            released: false,
            started_at: Utc::now(),
            registry,
        })
    }

    pub(crate) fn into_shared(self) -> SharedModerator {
        Arc::new(Mutex::new(self))
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn owner(&self) -> OwnerId {
        self.owner
    }

    pub(crate) fn depth(&self) -> i32 {
        self.depth
    }

    pub(crate) fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id.clone(),
            owner: self.owner,
            depth: self.depth,
            started_at: self.started_at,
        }
    }

    pub(crate) fn ensure_owner(&self, caller: OwnerId) -> TxResult<()> {
        if caller != self.owner {
            return Err(TxError::ThreadAffinity {
                owner: self.owner,
                caller,
            });
        }
        Ok(())
    }

    /// The real connection, while the tree is alive.
    pub(crate) fn connection(&mut self, caller: OwnerId) -> TxResult<&mut dyn Connection> {
        self.ensure_owner(caller)?;
        if self.depth < ORIGINAL_DEPTH {
            return Err(TxError::invalid_state(
                "connection access on dead transaction",
            ));
        }
        Ok(&mut *self.connection)
    }

    /// Open one more scope.
    pub(crate) fn begin(&mut self, caller: OwnerId) -> TxResult<()> {
        self.ensure_owner(caller)?;
        if self.depth < INITIAL_DEPTH {
            return Err(TxError::invalid_state("begin on dead transaction"));
        }
        self.depth += 1;
        debug!(tx_id = %self.id, depth = self.depth, "begin");
        Ok(())
    }

    /// Close the innermost scope, committing for real at the outermost one.
    pub(crate) fn commit(&mut self, caller: OwnerId) -> TxResult<()> {
        self.ensure_owner(caller)?;
        match self.depth {
            ORIGINAL_DEPTH => {
                self.connection.commit()?;
                let released = self.release_connection();
                self.unregister();
                self.depth = INITIAL_DEPTH;
                info!(tx_id = %self.id, owner = %self.owner, "transaction committed");
                released
            }
            depth if depth > ORIGINAL_DEPTH => {
                self.depth -= 1;
                debug!(tx_id = %self.id, depth = self.depth, "inner commit");
                Ok(())
            }
            _ => Err(TxError::invalid_state("commit on dead transaction")),
        }
    }

    /// Abort the whole tree.
    ///
    /// Whatever the depth, the registry entry is removed afterwards, even if
    /// the real rollback fails.
    pub(crate) fn rollback(&mut self, caller: OwnerId) -> TxResult<()> {
        let result = if self.depth >= ORIGINAL_DEPTH {
            self.ensure_owner(caller)?;
            let rolled_back = self.connection.rollback();
            let released = self.release_connection();
            info!(
                tx_id = %self.id,
                owner = %self.owner,
                depth = self.depth,
                "transaction rolled back"
            );
            self.depth = ABORTED_DEPTH;
            rolled_back.and(released)
        } else {
            Ok(())
        };
        self.unregister();
        result
    }

    /// Fails unless every scope of the tree has been committed.
    pub(crate) fn ensure_committed(&self) -> TxResult<()> {
        if self.depth != INITIAL_DEPTH {
            return Err(TxError::invalid_state("transaction not committed"));
        }
        Ok(())
    }

    /// Restore auto-commit and close; reports the first failure.
    fn release_connection(&mut self) -> TxResult<()> {
        self.released = true;
        let restored = self.connection.set_auto_commit(true);
        let closed = self.connection.close();
        restored.and(closed)
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.owner, &self.id);
        }
    }
}

impl Drop for Moderator {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.depth >= ORIGINAL_DEPTH {
            warn!(tx_id = %self.id, depth = self.depth, "dropping live transaction");
            if let Err(e) = self.connection.rollback() {
                warn!(tx_id = %self.id, error = %e, "rollback on drop failed");
            }
        }
        if let Err(e) = self.release_connection() {
            warn!(tx_id = %self.id, error = %e, "releasing connection on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryConfig, MemoryDatabase};

    fn setup() -> (MemoryDatabase, Arc<Registry>) {
        (MemoryDatabase::default(), Arc::new(Registry::new()))
    }

    fn open(db: &MemoryDatabase, registry: &Arc<Registry>) -> Moderator {
        Moderator::open(OwnerId::current(), db, Arc::downgrade(registry)).unwrap()
    }

    #[test]
    fn test_open_disables_auto_commit() {
        let (db, registry) = setup();
        let mut moderator = open(&db, &registry);
        let owner = OwnerId::current();

        assert_eq!(moderator.depth(), INITIAL_DEPTH);
        moderator.begin(owner).unwrap();
        assert!(!moderator.connection(owner).unwrap().auto_commit().unwrap());
    }

    #[test]
    fn test_open_rejects_manual_commit_connection() {
        let db = MemoryDatabase::new(MemoryConfig::default().initial_auto_commit(false));
        let registry = Arc::new(Registry::new());

        let result = Moderator::open(OwnerId::current(), &db, Arc::downgrade(&registry));
        assert!(matches!(result, Err(TxError::Configuration(_))));
        assert_eq!(db.stats().closed, 1);
    }

    #[test]
    fn test_depth_transitions() {
        let (db, registry) = setup();
        let mut moderator = open(&db, &registry);
        let owner = OwnerId::current();

        moderator.begin(owner).unwrap();
        moderator.begin(owner).unwrap();
        moderator.begin(owner).unwrap();
        assert_eq!(moderator.depth(), 2);

        moderator.commit(owner).unwrap();
        moderator.commit(owner).unwrap();
        assert_eq!(moderator.depth(), ORIGINAL_DEPTH);
        assert_eq!(db.stats().commits, 0);
        assert!(moderator.ensure_committed().is_err());

        moderator.commit(owner).unwrap();
        assert_eq!(moderator.depth(), INITIAL_DEPTH);
        assert_eq!(db.stats().commits, 1);
        assert_eq!(db.stats().closed, 1);
        moderator.ensure_committed().unwrap();

        assert!(matches!(
            moderator.commit(owner),
            Err(TxError::InvalidState(_))
        ));
        assert!(matches!(
            moderator.connection(owner),
            Err(TxError::InvalidState(_))
        ));
    }

    #[test]
    fn test_rollback_at_inner_depth_aborts_tree() {
        let (db, registry) = setup();
        let mut moderator = open(&db, &registry);
        let owner = OwnerId::current();

        moderator.begin(owner).unwrap();
        moderator.begin(owner).unwrap();
        moderator.rollback(owner).unwrap();

        assert_eq!(moderator.depth(), ABORTED_DEPTH);
        assert_eq!(db.stats().rollbacks, 1);
        assert!(matches!(moderator.begin(owner), Err(TxError::InvalidState(_))));
        assert!(matches!(moderator.commit(owner), Err(TxError::InvalidState(_))));

        // rolling back a dead tree is a no-op
        moderator.rollback(owner).unwrap();
        assert_eq!(db.stats().rollbacks, 1);
    }

    #[test]
    fn test_other_owner_is_rejected() {
        let (db, registry) = setup();
        let mut moderator = open(&db, &registry);
        let owner = OwnerId::current();
        let intruder = OwnerId::new_unique();

        moderator.begin(owner).unwrap();
        assert!(matches!(
            moderator.begin(intruder),
            Err(TxError::ThreadAffinity { .. })
        ));
        assert!(matches!(
            moderator.commit(intruder),
            Err(TxError::ThreadAffinity { .. })
        ));
        assert!(matches!(
            moderator.rollback(intruder),
            Err(TxError::ThreadAffinity { .. })
        ));
        assert_eq!(moderator.depth(), ORIGINAL_DEPTH);

        let stats = db.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 0);
    }

    #[test]
    fn test_drop_releases_live_connection() {
        let (db, registry) = setup();
        {
            let mut moderator = open(&db, &registry);
            moderator.begin(OwnerId::current()).unwrap();
        }
        let stats = db.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.closed, 1);
    }
}
