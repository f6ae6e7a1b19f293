//! In-memory backend.
//!
//! [`MemoryDatabase`] keeps committed data as a sorted map of keys to JSON
//! values and hands out [`MemoryConnection`]s. It understands four
//! statements:
//!
//! ```text
//! PUT <key> <json>     insert or replace a value
//! GET <key>            read one value
//! DELETE <key>         remove a value
//! SCAN [prefix]        read every value whose key starts with prefix
//! ```
//!
//! With auto-commit disabled, writes are buffered per connection and become
//! visible to other connections only on commit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use super::{
    Connection, ConnectionMetadata, ConnectionSource, IsolationLevel, QueryResult, ResultSet,
    Row, Savepoint,
};
use crate::error::{TxError, TxResult};

/// Buffered writes: `None` marks a deletion.
type Overlay = BTreeMap<String, Option<Value>>;

/// In-memory backend configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Name reported as the catalog of new connections.
    pub name: String,
    /// Auto-commit mode of new connections.
    pub initial_auto_commit: bool,
    /// Read-only mode of new connections.
    pub read_only: bool,
    /// Isolation level of new connections.
    pub isolation: IsolationLevel,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            name: "memory".into(),
            initial_auto_commit: true,
            read_only: false,
            isolation: IsolationLevel::default(),
        }
    }
}

impl MemoryConfig {
    /// Create a new configuration with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set initial_auto_commit flag.
    pub fn initial_auto_commit(mut self, value: bool) -> Self {
        self.initial_auto_commit = value;
        self
    }

    /// Set read_only flag.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Set isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }
}

/// Counters of what reached the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Connections handed out.
    pub opened: u64,
    /// Connections closed.
    pub closed: u64,
    /// Real commits, including the implicit one when auto-commit is switched
    /// back on with pending writes.
    pub commits: u64,
    /// Real rollbacks.
    pub rollbacks: u64,
}

struct MemoryInner {
    config: MemoryConfig,
    data: RwLock<BTreeMap<String, Value>>,
    stats: Mutex<MemoryStats>,
    next_savepoint: AtomicU64,
}

/// Shared in-memory database. Cloning shares the data.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                config,
                data: RwLock::new(BTreeMap::new()),
                stats: Mutex::new(MemoryStats::default()),
                next_savepoint: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        self.inner.stats.lock().opened += 1;
        let config = &self.inner.config;
        MemoryConnection {
            db: self.inner.clone(),
            auto_commit: config.initial_auto_commit,
            read_only: config.read_only,
            isolation: config.isolation,
            catalog: Some(config.name.clone()),
            client_info: BTreeMap::new(),
            warnings: Vec::new(),
            pending: Overlay::new(),
            savepoints: Vec::new(),
            closed: false,
        }
    }

    /// Committed value for `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.data.read().get(key).cloned()
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    /// Check if no key is committed.
    pub fn is_empty(&self) -> bool {
        self.inner.data.read().is_empty()
    }

    /// Snapshot of the backend counters.
    pub fn stats(&self) -> MemoryStats {
        *self.inner.stats.lock()
    }

    /// The configuration this database was created with.
    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl ConnectionSource for MemoryDatabase {
    fn connection(&self) -> TxResult<Box<dyn Connection>> {
        Ok(Box::new(self.connect()))
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.inner.config.name)
            .field("keys", &self.len())
            .finish()
    }
}

/// Parsed statement.
#[derive(Debug, PartialEq)]
enum Statement<'a> {
    Put { key: &'a str, value: Value },
    Get { key: &'a str },
    Delete { key: &'a str },
    Scan { prefix: &'a str },
}

impl<'a> Statement<'a> {
    fn parse(input: &'a str) -> TxResult<Self> {
        let input = input.trim().trim_end_matches(';').trim();
        let (verb, rest) = match input.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (input, ""),
        };

        match verb.to_uppercase().as_str() {
            "PUT" => {
                let (key, value) = rest.split_once(char::is_whitespace).ok_or_else(|| {
                    TxError::InvalidStatement("usage: PUT <key> <json>".into())
                })?;
                let value = serde_json::from_str(value.trim())?;
                Ok(Statement::Put { key, value })
            }
            "GET" => Ok(Statement::Get {
                key: single_key(rest, "GET")?,
            }),
            "DELETE" => Ok(Statement::Delete {
                key: single_key(rest, "DELETE")?,
            }),
            "SCAN" if !rest.contains(char::is_whitespace) => Ok(Statement::Scan { prefix: rest }),
            "" => Err(TxError::InvalidStatement("empty statement".into())),
            _ => Err(TxError::InvalidStatement(format!(
                "unrecognized statement: {}",
                input
            ))),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Statement::Put { .. } | Statement::Delete { .. })
    }
}

fn single_key<'a>(rest: &'a str, verb: &str) -> TxResult<&'a str> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return Err(TxError::InvalidStatement(format!("usage: {} <key>", verb)));
    }
    Ok(rest)
}

fn row(key: &str, value: Value) -> Row {
    let mut row = Row::new();
    row.insert("key".to_string(), Value::String(key.to_string()));
    row.insert("value".to_string(), value);
    row
}

/// A connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    db: Arc<MemoryInner>,
    auto_commit: bool,
    read_only: bool,
    isolation: IsolationLevel,
    catalog: Option<String>,
    client_info: BTreeMap<String, String>,
    warnings: Vec<String>,
    pending: Overlay,
    savepoints: Vec<(Savepoint, Overlay)>,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> TxResult<()> {
        if self.closed {
            return Err(TxError::ConnectionClosed);
        }
        Ok(())
    }

    fn ensure_in_transaction(&self, operation: &str) -> TxResult<()> {
        self.ensure_open()?;
        if self.auto_commit {
            return Err(TxError::invalid_state(format!(
                "{} while auto-commit is enabled",
                operation
            )));
        }
        Ok(())
    }

    /// Apply buffered writes to the shared data.
    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.savepoints.clear();
        let mut data = self.db.data.write();
        for (key, value) in pending {
            match value {
                Some(value) => data.insert(key, value),
                None => data.remove(&key),
            };
        }
        self.db.stats.lock().commits += 1;
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        match self.pending.get(key) {
            Some(buffered) => buffered.clone(),
            None => self.db.data.read().get(key).cloned(),
        }
    }

    fn write(&mut self, key: &str, value: Option<Value>) -> usize {
        let existed = self.lookup(key).is_some();
        let affected = if value.is_some() || existed { 1 } else { 0 };
        if self.auto_commit {
            let mut data = self.db.data.write();
            match value {
                Some(value) => data.insert(key.to_string(), value),
                None => data.remove(key),
            };
        } else {
            self.pending.insert(key.to_string(), value);
        }
        affected
    }

    fn scan(&self, prefix: &str) -> ResultSet {
        let mut merged: BTreeMap<String, Value> = self
            .db
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in self.pending.iter().filter(|(k, _)| k.starts_with(prefix)) {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }

        let mut rs = ResultSet::new(vec!["key".to_string(), "value".to_string()]);
        for (key, value) in merged {
            rs.push(row(&key, value));
        }
        rs
    }

    fn savepoint_index(&self, savepoint: &Savepoint) -> TxResult<usize> {
        self.savepoints
            .iter()
            .position(|(sp, _)| sp.id == savepoint.id)
            .ok_or_else(|| TxError::invalid_state(format!("unknown savepoint {}", savepoint.id)))
    }
}

impl Connection for MemoryConnection {
    fn auto_commit(&self) -> TxResult<bool> {
        self.ensure_open()?;
        Ok(self.auto_commit)
    }

    fn set_auto_commit(&mut self, enabled: bool) -> TxResult<()> {
        self.ensure_open()?;
        if enabled && !self.auto_commit && !self.pending.is_empty() {
            self.flush();
        }
        self.auto_commit = enabled;
        Ok(())
    }

    fn commit(&mut self) -> TxResult<()> {
        self.ensure_in_transaction("commit")?;
        trace!(pending = self.pending.len(), "memory commit");
        self.flush();
        Ok(())
    }

    fn rollback(&mut self) -> TxResult<()> {
        self.ensure_in_transaction("rollback")?;
        trace!(pending = self.pending.len(), "memory rollback");
        self.pending.clear();
        self.savepoints.clear();
        self.db.stats.lock().rollbacks += 1;
        Ok(())
    }

    fn isolation_level(&self) -> TxResult<IsolationLevel> {
        self.ensure_open()?;
        Ok(self.isolation)
    }

    fn set_isolation_level(&mut self, level: IsolationLevel) -> TxResult<()> {
        self.ensure_open()?;
        if level != IsolationLevel::ReadCommitted {
            self.warnings
                .push(format!("{} is not enforced by the memory backend", level));
        }
        self.isolation = level;
        Ok(())
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> TxResult<Savepoint> {
        self.ensure_in_transaction("savepoint")?;
        let savepoint = Savepoint {
            id: self.db.next_savepoint.fetch_add(1, Ordering::Relaxed),
            name: name.map(str::to_string),
        };
        self.savepoints
            .push((savepoint.clone(), self.pending.clone()));
        Ok(savepoint)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()> {
        self.ensure_in_transaction("release savepoint")?;
        let index = self.savepoint_index(savepoint)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> TxResult<()> {
        self.ensure_in_transaction("rollback to savepoint")?;
        let index = self.savepoint_index(savepoint)?;
        self.pending = self.savepoints[index].1.clone();
        self.savepoints.truncate(index + 1);
        Ok(())
    }

    fn close(&mut self) -> TxResult<()> {
        if self.closed {
            return Ok(());
        }
        self.pending.clear();
        self.savepoints.clear();
        self.closed = true;
        self.db.stats.lock().closed += 1;
        Ok(())
    }

    fn is_closed(&self) -> TxResult<bool> {
        Ok(self.closed)
    }

    fn is_valid(&self, _timeout: Duration) -> TxResult<bool> {
        Ok(!self.closed)
    }

    fn execute(&mut self, statement: &str) -> TxResult<QueryResult> {
        self.ensure_open()?;
        let statement = Statement::parse(statement)?;
        if statement.is_write() && self.read_only {
            return Err(TxError::ReadOnly);
        }

        let result = match statement {
            Statement::Put { key, value } => QueryResult::modified(self.write(key, Some(value))),
            Statement::Delete { key } => QueryResult::modified(self.write(key, None)),
            Statement::Get { key } => {
                let mut rs = ResultSet::new(vec!["key".to_string(), "value".to_string()]);
                if let Some(value) = self.lookup(key) {
                    rs.push(row(key, value));
                }
                QueryResult::Rows(rs)
            }
            Statement::Scan { prefix } => QueryResult::Rows(self.scan(prefix)),
        };
        Ok(result)
    }

    fn native_statement(&self, statement: &str) -> TxResult<String> {
        self.ensure_open()?;
        let statement = statement.trim().trim_end_matches(';').trim();
        let (verb, rest) = statement
            .split_once(char::is_whitespace)
            .unwrap_or((statement, ""));
        if rest.is_empty() {
            Ok(verb.to_uppercase())
        } else {
            Ok(format!("{} {}", verb.to_uppercase(), rest.trim()))
        }
    }

    fn metadata(&self) -> TxResult<ConnectionMetadata> {
        self.ensure_open()?;
        Ok(ConnectionMetadata {
            product_name: "nestedtx-memory".to_string(),
            product_version: env!("CARGO_PKG_VERSION").to_string(),
            supports_savepoints: true,
        })
    }

    fn is_read_only(&self) -> TxResult<bool> {
        self.ensure_open()?;
        Ok(self.read_only)
    }

    fn set_read_only(&mut self, read_only: bool) -> TxResult<()> {
        self.ensure_open()?;
        self.read_only = read_only;
        Ok(())
    }

    fn catalog(&self) -> TxResult<Option<String>> {
        self.ensure_open()?;
        Ok(self.catalog.clone())
    }

    fn set_catalog(&mut self, catalog: Option<String>) -> TxResult<()> {
        self.ensure_open()?;
        self.catalog = catalog;
        Ok(())
    }

    fn client_info(&self) -> TxResult<BTreeMap<String, String>> {
        self.ensure_open()?;
        Ok(self.client_info.clone())
    }

    fn set_client_info(&mut self, name: &str, value: &str) -> TxResult<()> {
        self.ensure_open()?;
        self.client_info.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn warnings(&self) -> TxResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.warnings.clone())
    }

    fn clear_warnings(&mut self) -> TxResult<()> {
        self.ensure_open()?;
        self.warnings.clear();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> MemoryDatabase {
        MemoryDatabase::new(MemoryConfig::new("test"))
    }

    #[test]
    fn test_parse_statements() {
        assert_eq!(
            Statement::parse("put user:1 {\"name\": \"Alice\"};").unwrap(),
            Statement::Put {
                key: "user:1",
                value: json!({"name": "Alice"}),
            }
        );
        assert_eq!(
            Statement::parse("GET user:1").unwrap(),
            Statement::Get { key: "user:1" }
        );
        assert_eq!(
            Statement::parse("SCAN").unwrap(),
            Statement::Scan { prefix: "" }
        );
        assert!(Statement::parse("GET").is_err());
        assert!(Statement::parse("PUT key").is_err());
        assert!(Statement::parse("DROP TABLE users").is_err());
        assert!(matches!(
            Statement::parse("PUT key {not json"),
            Err(TxError::Json(_))
        ));
    }

    #[test]
    fn test_auto_commit_writes_are_visible() {
        let db = setup();
        let mut conn = db.connect();

        let result = conn.execute("PUT a 1").unwrap();
        assert_eq!(result.rows_affected(), Some(1));
        assert_eq!(db.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_buffered_writes_commit_and_rollback() {
        let db = setup();
        let mut conn = db.connect();
        conn.set_auto_commit(false).unwrap();

        conn.execute("PUT a 1").unwrap();
        assert_eq!(db.get("a"), None);
        let rs = conn.execute("GET a").unwrap();
        assert_eq!(rs.rows().unwrap().len(), 1);

        conn.commit().unwrap();
        assert_eq!(db.get("a"), Some(json!(1)));

        conn.execute("DELETE a").unwrap();
        conn.rollback().unwrap();
        assert_eq!(db.get("a"), Some(json!(1)));

        let stats = db.stats();
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.rollbacks, 1);
    }

    #[test]
    fn test_commit_requires_manual_mode() {
        let db = setup();
        let mut conn = db.connect();
        assert!(matches!(conn.commit(), Err(TxError::InvalidState(_))));
        assert!(matches!(conn.rollback(), Err(TxError::InvalidState(_))));
    }

    #[test]
    fn test_enabling_auto_commit_flushes() {
        let db = setup();
        let mut conn = db.connect();
        conn.set_auto_commit(false).unwrap();
        conn.execute("PUT a true").unwrap();

        conn.set_auto_commit(true).unwrap();
        assert_eq!(db.get("a"), Some(json!(true)));
        assert_eq!(db.stats().commits, 1);
    }

    #[test]
    fn test_scan_merges_pending() {
        let db = setup();
        let mut writer = db.connect();
        writer.execute("PUT user:1 \"alice\"").unwrap();
        writer.execute("PUT user:2 \"bob\"").unwrap();
        writer.execute("PUT order:1 10").unwrap();

        let mut conn = db.connect();
        conn.set_auto_commit(false).unwrap();
        conn.execute("DELETE user:1").unwrap();
        conn.execute("PUT user:3 \"carol\"").unwrap();

        let result = conn.execute("SCAN user:").unwrap();
        let keys: Vec<_> = result
            .rows()
            .unwrap()
            .iter()
            .map(|row| row["key"].clone())
            .collect();
        assert_eq!(keys, vec![json!("user:2"), json!("user:3")]);
    }

    #[test]
    fn test_savepoints() {
        let db = setup();
        let mut conn = db.connect();
        assert!(conn.set_savepoint(None).is_err());

        conn.set_auto_commit(false).unwrap();
        conn.execute("PUT a 1").unwrap();
        let sp = conn.set_savepoint(Some("before_b")).unwrap();
        assert_eq!(sp.name.as_deref(), Some("before_b"));
        conn.execute("PUT b 2").unwrap();

        conn.rollback_to_savepoint(&sp).unwrap();
        conn.commit().unwrap();
        assert_eq!(db.get("a"), Some(json!(1)));
        assert_eq!(db.get("b"), None);

        conn.release_savepoint(&sp).unwrap_err();
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let db = MemoryDatabase::new(MemoryConfig::new("ro").read_only(true));
        let mut conn = db.connect();
        assert!(matches!(conn.execute("PUT a 1"), Err(TxError::ReadOnly)));
        assert!(conn.execute("GET a").is_ok());
    }

    #[test]
    fn test_close_discards_and_counts() {
        let db = setup();
        {
            let mut conn = db.connect();
            conn.set_auto_commit(false).unwrap();
            conn.execute("PUT a 1").unwrap();
            conn.close().unwrap();
            conn.close().unwrap();
            assert!(conn.is_closed().unwrap());
            assert!(matches!(conn.execute("GET a"), Err(TxError::ConnectionClosed)));
        }
        {
            let _dropped = db.connect();
        }

        assert_eq!(db.get("a"), None);
        let stats = db.stats();
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 2);
    }

    #[test]
    fn test_session_properties() {
        let db = setup();
        let mut conn = db.connect();

        assert_eq!(conn.catalog().unwrap().as_deref(), Some("test"));
        conn.set_client_info("app", "shell").unwrap();
        assert_eq!(conn.client_info().unwrap()["app"], "shell");

        conn.set_isolation_level(IsolationLevel::Serializable).unwrap();
        assert_eq!(conn.isolation_level().unwrap(), IsolationLevel::Serializable);
        assert_eq!(conn.warnings().unwrap().len(), 1);
        conn.clear_warnings().unwrap();
        assert!(conn.warnings().unwrap().is_empty());

        assert_eq!(conn.native_statement("get  a;").unwrap(), "GET a");
        assert!(conn.metadata().unwrap().supports_savepoints);
    }
}
