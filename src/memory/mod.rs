// ============================================================================
// Loopback database
// ============================================================================
//
// An in-process stand-in for a real server. It speaks the same transaction
// control language the sandbox emits (BEGIN, COMMIT, ROLLBACK, SAVEPOINT,
// RELEASE SAVEPOINT, ROLLBACK TO SAVEPOINT, SET TRANSACTION ISOLATION LEVEL)
// and records every statement it receives, so sandbox behavior can be
// asserted without a live database.
//
// Semantics:
// - Each connection holds at most one transaction, working on a private
//   snapshot taken at BEGIN. COMMIT publishes the tables it modified.
// - Statements outside a transaction autocommit.
// - BEGIN inside a transaction, COMMIT / ROLLBACK outside one are no-ops.
// - A failing statement leaves the transaction usable.
//
// ============================================================================

mod control;
mod engine;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::core::{DbError, Result};
use crate::interface::{ConnectionSource, DatabaseConnection};
use crate::result::QueryResult;
use crate::sql::{Query, normalize};
use crate::transaction::IsolationLevel;
use control::Control;
use engine::{Frame, Tables};

struct Shared {
    committed: RwLock<Tables>,
    journal: Mutex<Vec<String>>,
    fail_next: Mutex<Vec<String>>,
    isolation_history: Mutex<Vec<IsolationLevel>>,
    refuse_connections: AtomicBool,
    open_connections: AtomicUsize,
    next_id: AtomicU64,
}

/// In-memory database with real transaction and savepoint semantics.
///
/// Cloning is cheap; all clones share the same data.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: RwLock::new(Tables::new()),
                journal: Mutex::new(Vec::new()),
                fail_next: Mutex::new(Vec::new()),
                isolation_history: Mutex::new(Vec::new()),
                refuse_connections: AtomicBool::new(false),
                open_connections: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new connection.
    pub fn connect(&self) -> Result<MemoryConnection> {
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(DbError::AcquisitionFailed("connection refused".into()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "loopback connection opened");

        Ok(MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            transaction: None,
            next_isolation: None,
            session_isolation: None,
            released: false,
        })
    }

    /// Every statement received so far, across all connections, in order.
    pub async fn journal(&self) -> Vec<String> {
        self.shared.journal.lock().await.clone()
    }

    pub async fn clear_journal(&self) {
        self.shared.journal.lock().await.clear();
    }

    /// Connections opened and not yet released.
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }

    /// Make the next statement starting with `prefix` fail once.
    pub async fn fail_next(&self, prefix: &str) {
        self.shared
            .fail_next
            .lock()
            .await
            .push(normalize(prefix));
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Isolation levels requested through SET TRANSACTION statements.
    pub async fn isolation_history(&self) -> Vec<IsolationLevel> {
        self.shared.isolation_history.lock().await.clone()
    }

    /// Committed row count of `table`.
    pub async fn table_len(&self, table: &str) -> Result<usize> {
        let committed = self.shared.committed.read().await;
        committed
            .get(&table.to_lowercase())
            .map(|t| t.rows.len())
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))
    }

    /// Names of all committed tables, sorted.
    pub async fn table_names(&self) -> Vec<String> {
        let committed = self.shared.committed.read().await;
        let mut names: Vec<String> = committed.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionSource for MemoryDatabase {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>> {
        Ok(Box::new(self.connect()?))
    }
}

struct TxnState {
    frame: Frame,
    savepoints: Vec<(String, Frame)>,
    isolation: IsolationLevel,
}

/// One connection to a [`MemoryDatabase`].
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    transaction: Option<TxnState>,
    next_isolation: Option<IsolationLevel>,
    session_isolation: Option<IsolationLevel>,
    released: bool,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Isolation level of the open transaction.
    pub fn transaction_isolation(&self) -> Option<IsolationLevel> {
        self.transaction.as_ref().map(|txn| txn.isolation)
    }

    async fn take_injected_failure(&self, sql: &str) -> Option<String> {
        let normalized = normalize(sql);
        let mut pending = self.shared.fail_next.lock().await;
        let pos = pending.iter().position(|prefix| normalized.starts_with(prefix))?;
        Some(pending.remove(pos))
    }

    async fn run_control(&mut self, control: Control) -> Result<QueryResult> {
        match control {
            Control::Begin(level) => {
                if self.transaction.is_some() {
                    trace!(connection = self.id, "BEGIN inside transaction ignored");
                    return Ok(QueryResult::empty());
                }
                let isolation = level
                    .or(self.next_isolation.take())
                    .or(self.session_isolation)
                    .unwrap_or(IsolationLevel::ReadCommitted);
                let committed = self.shared.committed.read().await;
                self.transaction = Some(TxnState {
                    frame: Frame::from_committed(&committed),
                    savepoints: Vec::new(),
                    isolation,
                });
            }
            Control::Commit => {
                if let Some(txn) = self.transaction.take() {
                    let mut committed = self.shared.committed.write().await;
                    txn.frame.publish(&mut committed);
                }
            }
            Control::Rollback => {
                self.transaction = None;
            }
            Control::Savepoint(name) => {
                let txn = self.transaction_mut("SAVEPOINT")?;
                let snapshot = txn.frame.clone();
                txn.savepoints.push((name, snapshot));
            }
            Control::Release(name) => {
                let txn = self.transaction_mut("RELEASE SAVEPOINT")?;
                let pos = savepoint_position(txn, &name)?;
                txn.savepoints.truncate(pos);
            }
            Control::RollbackTo(name) => {
                let txn = self.transaction_mut("ROLLBACK TO SAVEPOINT")?;
                let pos = savepoint_position(txn, &name)?;
                txn.frame = txn.savepoints[pos].1.clone();
                txn.savepoints.truncate(pos + 1);
            }
            Control::SetIsolation {
                level,
                session_scope,
            } => {
                self.shared.isolation_history.lock().await.push(level);
                if session_scope {
                    self.session_isolation = Some(level);
                } else if let Some(txn) = self.transaction.as_mut() {
                    txn.isolation = level;
                } else {
                    self.next_isolation = Some(level);
                }
            }
        }
        Ok(QueryResult::empty())
    }

    fn transaction_mut(&mut self, statement: &str) -> Result<&mut TxnState> {
        self.transaction.as_mut().ok_or_else(|| {
            DbError::ExecutionError(format!(
                "{} can only be used in transaction blocks",
                statement
            ))
        })
    }

    fn close(&mut self) {
        if !self.released {
            self.released = true;
            self.transaction = None;
            self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
            debug!(connection = self.id, "loopback connection closed");
        }
    }
}

fn savepoint_position(txn: &TxnState, name: &str) -> Result<usize> {
    txn.savepoints
        .iter()
        .rposition(|(existing, _)| existing == name)
        .ok_or_else(|| DbError::ExecutionError(format!("savepoint \"{}\" does not exist", name)))
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    async fn query(&mut self, query: Query) -> Result<QueryResult> {
        if self.released {
            return Err(DbError::ExecutionError(
                "Connection has been released".into(),
            ));
        }

        self.shared.journal.lock().await.push(query.sql().to_string());
        trace!(connection = self.id, sql = %query, "loopback statement");

        if let Some(prefix) = self.take_injected_failure(query.sql()).await {
            return Err(DbError::ExecutionError(format!(
                "Injected failure for statement starting with '{}'",
                prefix
            )));
        }

        if let Some(control) = control::parse(query.sql())? {
            return self.run_control(control).await;
        }

        match self.transaction.as_mut() {
            Some(txn) => engine::execute(&mut txn.frame, &query),
            None => {
                let mut committed = self.shared.committed.write().await;
                let mut frame = Frame::from_committed(&committed);
                let result = engine::execute(&mut frame, &query)?;
                frame.publish(&mut committed);
                Ok(result)
            }
        }
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.query(Query::new("BEGIN")).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.query(Query::new("COMMIT")).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.query(Query::new("ROLLBACK")).await.map(|_| ())
    }

    async fn release(&mut self) -> Result<()> {
        self.close();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    async fn seeded() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().unwrap();
        conn.execute("CREATE TABLE employee (id INT, first_name TEXT)")
            .await
            .unwrap();
        conn.execute("INSERT INTO employee VALUES (1, 'Lisa')")
            .await
            .unwrap();
        conn.release().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_private() {
        let db = seeded().await;
        let mut a = db.connect().unwrap();
        let mut b = db.connect().unwrap();

        a.begin_transaction().await.unwrap();
        a.execute("INSERT INTO employee VALUES (2, 'Mark')").await.unwrap();

        let seen_by_b = b.execute("SELECT * FROM employee").await.unwrap();
        assert_eq!(seen_by_b.row_count(), 1);

        a.commit().await.unwrap();
        let seen_by_b = b.execute("SELECT * FROM employee").await.unwrap();
        assert_eq!(seen_by_b.row_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_keeps_rows_committed_meanwhile() {
        let db = seeded().await;
        let mut a = db.connect().unwrap();
        let mut b = db.connect().unwrap();

        a.begin_transaction().await.unwrap();
        a.execute("INSERT INTO employee VALUES (2, 'Mark')").await.unwrap();
        a.execute("UPDATE employee SET first_name = 'Liz' WHERE id = 1")
            .await
            .unwrap();

        b.execute("INSERT INTO employee VALUES (3, 'Ann')").await.unwrap();
        a.commit().await.unwrap();

        let result = b
            .execute("SELECT first_name FROM employee")
            .await
            .unwrap();
        let mut names: Vec<&str> = result
            .column_values("first_name")
            .into_iter()
            .filter_map(Value::as_str)
            .collect();
        names.sort();
        assert_eq!(names, vec!["Ann", "Liz", "Mark"]);
    }

    #[tokio::test]
    async fn test_rolled_back_savepoint_changes_are_not_replayed() {
        let db = seeded().await;
        let mut conn = db.connect().unwrap();
        conn.begin_transaction().await.unwrap();
        conn.execute("SAVEPOINT sp_1").await.unwrap();
        conn.execute("INSERT INTO employee VALUES (2, 'Mark')").await.unwrap();
        conn.execute("ROLLBACK TO SAVEPOINT sp_1").await.unwrap();
        conn.execute("INSERT INTO employee VALUES (3, 'Ann')").await.unwrap();
        conn.commit().await.unwrap();

        assert_eq!(db.table_len("employee").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let db = seeded().await;
        let mut conn = db.connect().unwrap();
        conn.begin_transaction().await.unwrap();
        conn.execute("DELETE FROM employee").await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(db.table_len("employee").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_and_release() {
        let db = seeded().await;
        let mut conn = db.connect().unwrap();
        conn.begin_transaction().await.unwrap();

        conn.execute("SAVEPOINT sp_1").await.unwrap();
        conn.execute("INSERT INTO employee VALUES (2, 'Mark')").await.unwrap();
        conn.execute("ROLLBACK TO SAVEPOINT sp_1").await.unwrap();
        let result = conn.execute("SELECT * FROM employee").await.unwrap();
        assert_eq!(result.row_count(), 1);

        // ROLLBACK TO keeps the savepoint; RELEASE removes it.
        conn.execute("INSERT INTO employee VALUES (3, 'Ann')").await.unwrap();
        conn.execute("RELEASE SAVEPOINT sp_1").await.unwrap();
        assert!(conn.execute("RELEASE SAVEPOINT sp_1").await.is_err());

        conn.commit().await.unwrap();
        assert_eq!(db.table_len("employee").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_savepoint_requires_transaction() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().unwrap();
        let err = conn.execute("SAVEPOINT sp_1").await.unwrap_err();
        assert!(matches!(err, DbError::ExecutionError(_)));
    }

    #[tokio::test]
    async fn test_redundant_control_statements_are_noops() {
        let db = seeded().await;
        let mut conn = db.connect().unwrap();
        conn.execute("COMMIT").await.unwrap();
        conn.execute("ROLLBACK").await.unwrap();

        conn.execute("BEGIN").await.unwrap();
        conn.execute("INSERT INTO employee VALUES (2, 'Mark')").await.unwrap();
        conn.execute("BEGIN").await.unwrap();
        assert!(conn.in_transaction());
        conn.execute("ROLLBACK").await.unwrap();
        assert_eq!(db.table_len("employee").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_isolation_applies_to_next_transaction() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().unwrap();
        conn.execute("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .await
            .unwrap();
        conn.begin_transaction().await.unwrap();
        assert_eq!(
            conn.transaction_isolation(),
            Some(IsolationLevel::Serializable)
        );
        conn.rollback().await.unwrap();

        conn.begin_transaction().await.unwrap();
        assert_eq!(
            conn.transaction_isolation(),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            db.isolation_history().await,
            vec![IsolationLevel::Serializable]
        );
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let db = MemoryDatabase::new();
        db.fail_next("savepoint").await;
        let mut conn = db.connect().unwrap();
        conn.begin_transaction().await.unwrap();

        assert!(conn.execute("SAVEPOINT sp_1").await.is_err());
        assert!(conn.execute("SAVEPOINT sp_1").await.is_ok());
        assert_eq!(
            db.journal().await,
            vec!["BEGIN", "SAVEPOINT sp_1", "SAVEPOINT sp_1"]
        );
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().unwrap();
        let other = db.connect().unwrap();
        assert_eq!(db.open_connections(), 2);

        conn.release().await.unwrap();
        conn.release().await.unwrap();
        drop(other);
        assert_eq!(db.open_connections(), 0);

        db.refuse_connections(true);
        assert!(matches!(
            db.connect(),
            Err(DbError::AcquisitionFailed(_))
        ));
    }
}
