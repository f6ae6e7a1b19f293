//! Guarded view of a moderator-owned connection.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::{Connection, ConnectionMetadata, IsolationLevel, QueryResult, Savepoint};
use crate::error::{TxError, TxResult};
use crate::owner::OwnerId;
use crate::transaction::SharedModerator;

/// Connection handed to code running inside a transaction scope.
///
/// Statements and session calls reach the transaction's real connection.
/// Calls that would end or reconfigure the transaction fail with
/// [`TxError::Unsupported`]; only transaction handles may do that.
/// [`Connection::close`] is accepted and ignored.
///
/// Every forwarded call checks that the caller owns the transaction and that
/// the transaction is still alive.
pub struct ConnectionGuard {
    moderator: SharedModerator,
}

impl ConnectionGuard {
    pub(crate) fn new(moderator: SharedModerator) -> Self {
        Self { moderator }
    }

    /// Nesting depth of the guarded transaction.
    pub fn depth(&self) -> i32 {
        self.moderator.lock().depth()
    }

    fn forward<R>(&self, f: impl FnOnce(&mut dyn Connection) -> TxResult<R>) -> TxResult<R> {
        let mut moderator = self.moderator.lock();
        let connection = moderator.connection(OwnerId::current())?;
        f(connection)
    }
}

impl Connection for ConnectionGuard {
    fn auto_commit(&self) -> TxResult<bool> {
        self.forward(|c| c.auto_commit())
    }

    fn set_auto_commit(&mut self, _enabled: bool) -> TxResult<()> {
        Err(TxError::unsupported("set_auto_commit"))
    }

    fn commit(&mut self) -> TxResult<()> {
        Err(TxError::unsupported("commit"))
    }

    fn rollback(&mut self) -> TxResult<()> {
        Err(TxError::unsupported("rollback"))
    }

    fn isolation_level(&self) -> TxResult<IsolationLevel> {
        self.forward(|c| c.isolation_level())
    }

    fn set_isolation_level(&mut self, _level: IsolationLevel) -> TxResult<()> {
        Err(TxError::unsupported("set_isolation_level"))
    }

    fn set_savepoint(&mut self, _name: Option<&str>) -> TxResult<Savepoint> {
        Err(TxError::unsupported("set_savepoint"))
    }

    fn release_savepoint(&mut self, _savepoint: &Savepoint) -> TxResult<()> {
        Err(TxError::unsupported("release_savepoint"))
    }

    fn rollback_to_savepoint(&mut self, _savepoint: &Savepoint) -> TxResult<()> {
        Err(TxError::unsupported("rollback_to_savepoint"))
    }

    fn close(&mut self) -> TxResult<()> {
        // the moderator closes the real connection
        Ok(())
    }

    fn is_closed(&self) -> TxResult<bool> {
        self.forward(|c| c.is_closed())
    }

    fn is_valid(&self, timeout: Duration) -> TxResult<bool> {
        self.forward(|c| c.is_valid(timeout))
    }

    fn execute(&mut self, statement: &str) -> TxResult<QueryResult> {
        self.forward(|c| c.execute(statement))
    }

    fn native_statement(&self, statement: &str) -> TxResult<String> {
        self.forward(|c| c.native_statement(statement))
    }

    fn metadata(&self) -> TxResult<ConnectionMetadata> {
        self.forward(|c| c.metadata())
    }

    fn is_read_only(&self) -> TxResult<bool> {
        self.forward(|c| c.is_read_only())
    }

    fn set_read_only(&mut self, read_only: bool) -> TxResult<()> {
        self.forward(|c| c.set_read_only(read_only))
    }

    fn catalog(&self) -> TxResult<Option<String>> {
        self.forward(|c| c.catalog())
    }

    fn set_catalog(&mut self, catalog: Option<String>) -> TxResult<()> {
        self.forward(|c| c.set_catalog(catalog))
    }

    fn client_info(&self) -> TxResult<BTreeMap<String, String>> {
        self.forward(|c| c.client_info())
    }

    fn set_client_info(&mut self, name: &str, value: &str) -> TxResult<()> {
        self.forward(|c| c.set_client_info(name, value))
    }

    fn warnings(&self) -> TxResult<Vec<String>> {
        self.forward(|c| c.warnings())
    }

    fn clear_warnings(&mut self) -> TxResult<()> {
        self.forward(|c| c.clear_warnings())
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::connection::MemoryDatabase;
    use crate::transaction::TransactionSource;

    fn setup() -> (MemoryDatabase, TransactionSource) {
        let db = MemoryDatabase::default();
        let source = TransactionSource::new(db.clone());
        (db, source)
    }

    #[test]
    fn test_rejects_transaction_control() {
        let (db, source) = setup();
        let _tx = source.begin_transaction().unwrap();
        let mut conn = source.connection().unwrap();

        assert!(matches!(
            conn.commit(),
            Err(TxError::Unsupported { operation: "commit" })
        ));
        assert!(matches!(
            conn.rollback(),
            Err(TxError::Unsupported { operation: "rollback" })
        ));
        assert!(matches!(
            conn.set_auto_commit(true),
            Err(TxError::Unsupported { operation: "set_auto_commit" })
        ));
        assert!(matches!(
            conn.set_isolation_level(IsolationLevel::Serializable),
            Err(TxError::Unsupported { .. })
        ));
        assert!(matches!(conn.set_savepoint(None), Err(TxError::Unsupported { .. })));

        let sp = Savepoint { id: 1, name: None };
        assert!(conn.release_savepoint(&sp).is_err());
        assert!(conn.rollback_to_savepoint(&sp).is_err());

        // close is accepted and leaves the transaction usable
        conn.close().unwrap();
        assert!(!conn.is_closed().unwrap());
        conn.execute("PUT a 1").unwrap();

        let stats = db.stats();
        assert_eq!(stats.commits, 0);
        assert_eq!(stats.rollbacks, 0);
        assert_eq!(stats.closed, 0);
    }

    #[test]
    fn test_forwards_reads_and_session_calls() {
        let (_db, source) = setup();
        let _tx = source.begin_transaction().unwrap();
        let mut conn = source.connection().unwrap();

        assert!(!conn.auto_commit().unwrap());
        conn.execute("PUT k {\"v\": 1}").unwrap();
        let result = conn.execute("GET k").unwrap();
        assert_eq!(result.rows().unwrap().get(0).unwrap()["value"], json!({"v": 1}));

        conn.set_client_info("app", "test").unwrap();
        assert_eq!(conn.client_info().unwrap().len(), 1);
        conn.set_catalog(Some("other".into())).unwrap();
        assert_eq!(conn.catalog().unwrap().as_deref(), Some("other"));
        assert!(conn.is_valid(Duration::from_secs(1)).unwrap());
        assert_eq!(conn.isolation_level().unwrap(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_dead_transaction_rejects_access() {
        let (_db, source) = setup();
        let mut tx = source.begin_transaction().unwrap();
        let mut conn = source.connection().unwrap();
        tx.commit().unwrap();

        assert!(matches!(conn.execute("GET a"), Err(TxError::InvalidState(_))));
        // close stays a no-op even now
        conn.close().unwrap();
    }

    #[test]
    fn test_rejects_other_owner() {
        let (_db, source) = setup();
        let _tx = source.begin_transaction().unwrap();
        let mut conn = source.connection().unwrap();

        let _scope = OwnerId::new_unique().enter();
        assert!(matches!(
            conn.execute("GET a"),
            Err(TxError::ThreadAffinity { .. })
        ));
    }
}
