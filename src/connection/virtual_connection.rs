use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::{DbError, Result};
use crate::interface::DatabaseConnection;
use crate::result::QueryResult;
use crate::sql::{Query, StatementKind};
use crate::transaction::{NestedTransaction, Session};

/// Connection handed to application code while a sandbox session is live.
///
/// Owns no physical resources: every statement runs on the session's single
/// real connection. At most one nested transaction is open per virtual
/// connection; `release` does nothing.
#[derive(Debug)]
pub struct VirtualConnection {
    id: u64,
    session: Arc<Session>,
    transaction: Option<NestedTransaction>,
}

impl VirtualConnection {
    pub(crate) fn new(id: u64, session: Arc<Session>) -> Self {
        Self {
            id,
            session,
            transaction: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id()
    }

    /// The open nested transaction, if any.
    pub fn transaction(&self) -> Option<&NestedTransaction> {
        self.transaction.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Forget the nested transaction once it reached a terminal state.
    fn settle(&mut self) {
        if self
            .transaction
            .as_ref()
            .is_some_and(|txn| txn.state().is_terminal())
        {
            self.transaction = None;
        }
    }
}

#[async_trait]
impl DatabaseConnection for VirtualConnection {
    async fn query(&mut self, query: Query) -> Result<QueryResult> {
        if let Some(txn) = self.transaction.as_mut() {
            let result = txn.query(query).await;
            self.settle();
            return result;
        }

        match query.kind() {
            StatementKind::Begin => {
                self.begin_transaction().await?;
                Ok(QueryResult::empty())
            }
            kind @ (StatementKind::Commit | StatementKind::Rollback) => {
                if self.session.is_terminated() {
                    return Err(DbError::SessionClosed);
                }
                debug!(connection = self.id, %kind, "no nested transaction open, acknowledged");
                Ok(QueryResult::empty())
            }
            _ => self.session.execute(query).await,
        }
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if let Some(txn) = &self.transaction {
            return Err(DbError::TransactionAlreadyActive(txn.savepoint()));
        }
        if self.session.is_terminated() {
            return Err(DbError::SessionClosed);
        }

        self.transaction = Some(NestedTransaction::begin(Arc::clone(&self.session)));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let txn = self
            .transaction
            .as_mut()
            .ok_or(DbError::NoActiveTransaction)?;
        let result = txn.commit().await;
        self.settle();
        result
    }

    async fn rollback(&mut self) -> Result<()> {
        let txn = self
            .transaction
            .as_mut()
            .ok_or(DbError::NoActiveTransaction)?;
        let result = txn.rollback().await;
        self.settle();
        result
    }

    async fn release(&mut self) -> Result<()> {
        trace!(connection = self.id, "virtual connection released");
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.session
            .execute(Query::new("SELECT 1"))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::SessionOptions;
    use crate::memory::MemoryDatabase;
    use crate::transaction::{NestedState, SavepointId, SessionManager};

    async fn connection() -> (MemoryDatabase, Arc<Session>, VirtualConnection) {
        let db = MemoryDatabase::new();
        let manager = SessionManager::new(Arc::new(db.clone()));
        let session = manager.start(SessionOptions::default()).await.unwrap();
        let conn = VirtualConnection::new(1, Arc::clone(&session));
        db.clear_journal().await;
        (db, session, conn)
    }

    #[tokio::test]
    async fn test_method_commit_without_transaction() {
        let (_db, _session, mut conn) = connection().await;
        assert!(matches!(conn.commit().await, Err(DbError::NoActiveTransaction)));
        assert!(matches!(conn.rollback().await, Err(DbError::NoActiveTransaction)));
    }

    #[tokio::test]
    async fn test_textual_commit_without_transaction_is_acknowledged() {
        let (db, _session, mut conn) = connection().await;
        conn.execute("COMMIT").await.unwrap();
        conn.execute("ROLLBACK").await.unwrap();
        assert!(db.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_textual_begin_opens_nested_transaction() {
        let (db, _session, mut conn) = connection().await;
        conn.execute("START TRANSACTION").await.unwrap();
        assert!(conn.in_transaction());
        assert!(matches!(
            conn.begin_transaction().await,
            Err(DbError::TransactionAlreadyActive(SavepointId(1)))
        ));

        conn.execute("SELECT 1").await.unwrap();
        conn.execute("COMMIT").await.unwrap();
        assert!(!conn.in_transaction());
        assert_eq!(
            db.journal().await,
            vec!["SAVEPOINT sp_1", "SELECT 1", "RELEASE SAVEPOINT sp_1"]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_transaction_open() {
        let (db, _session, mut conn) = connection().await;
        conn.begin_transaction().await.unwrap();
        conn.execute("SELECT 1").await.unwrap();

        db.fail_next("RELEASE").await;
        assert!(conn.commit().await.is_err());
        assert_eq!(
            conn.transaction().map(|t| t.state()),
            Some(NestedState::Active)
        );
        conn.rollback().await.unwrap();
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn test_use_after_teardown() {
        let (_db, session, mut conn) = connection().await;
        session.rollback().await.unwrap();

        assert!(matches!(conn.execute("SELECT 1").await, Err(DbError::SessionClosed)));
        assert!(matches!(conn.execute("COMMIT").await, Err(DbError::SessionClosed)));
        assert!(matches!(conn.begin_transaction().await, Err(DbError::SessionClosed)));
        conn.release().await.unwrap();
    }
}
