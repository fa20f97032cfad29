// ============================================================================
// Sandbox Session
// ============================================================================
//
// A session owns the one real connection of a test and the never-committed
// transaction open on it. Every statement from every virtual connection ends
// up in `Session::execute`, which serializes them on that connection.
//
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::isolation::IsolationLevel;
use super::savepoint::{SavepointAllocator, SavepointId};
use crate::connection::config::{QueryObserver, SessionOptions};
use crate::core::{DbError, Result};
use crate::interface::{ConnectionSource, DatabaseConnection};
use crate::result::QueryResult;
use crate::sql::{Query, StatementKind};

pub struct Session {
    id: Uuid,
    connection: Mutex<Option<Box<dyn DatabaseConnection>>>,
    savepoints: SavepointAllocator,
    isolation_level: Option<IsolationLevel>,
    observer: Option<QueryObserver>,
    debug: Arc<AtomicBool>,
    terminated: AtomicBool,
}

impl Session {
    /// Acquire a connection, apply the isolation level and BEGIN.
    ///
    /// On failure the connection is released and no session exists.
    pub(crate) async fn open(
        source: &dyn ConnectionSource,
        options: SessionOptions,
        debug: Arc<AtomicBool>,
    ) -> Result<Arc<Session>> {
        let mut connection = source.acquire().await.map_err(|e| match e {
            DbError::AcquisitionFailed(msg) => DbError::AcquisitionFailed(msg),
            other => DbError::AcquisitionFailed(other.to_string()),
        })?;

        let id = Uuid::new_v4();
        if let Err(e) = Self::begin(connection.as_mut(), options.isolation_level).await {
            warn!(session = %id, error = %e, "failed to begin sandbox transaction");
            if let Err(release_err) = connection.release().await {
                warn!(session = %id, error = %release_err, "failed to release connection");
            }
            return Err(e);
        }

        debug!(
            session = %id,
            isolation_level = ?options.isolation_level,
            "sandbox session started"
        );

        Ok(Arc::new(Session {
            id,
            connection: Mutex::new(Some(connection)),
            savepoints: SavepointAllocator::new(),
            isolation_level: options.isolation_level,
            observer: options.on_query,
            debug,
            terminated: AtomicBool::new(false),
        }))
    }

    async fn begin(
        connection: &mut dyn DatabaseConnection,
        isolation_level: Option<IsolationLevel>,
    ) -> Result<()> {
        if let Some(level) = isolation_level {
            connection.query(Query::new(level.set_statement())).await?;
        }
        connection.begin_transaction().await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation_level
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn savepoints(&self) -> &SavepointAllocator {
        &self.savepoints
    }

    pub(crate) fn allocate_savepoint(&self) -> SavepointId {
        self.savepoints.allocate()
    }

    /// Run one statement on the real connection.
    ///
    /// Isolation-level statements are acknowledged without execution: the
    /// level was fixed when the session began.
    pub async fn execute(&self, query: Query) -> Result<QueryResult> {
        if self.is_terminated() {
            return Err(DbError::SessionClosed);
        }

        if let Some(observer) = &self.observer {
            observer(&query);
        }

        if self.debug.load(Ordering::Relaxed) {
            info!(
                session = %self.id,
                virtualized = query.is_virtualized(),
                sql = %query,
                "sandbox query"
            );
        } else {
            trace!(
                session = %self.id,
                virtualized = query.is_virtualized(),
                sql = %query,
                "sandbox query"
            );
        }

        if query.kind() == StatementKind::IsolationLevel {
            debug!(session = %self.id, "isolation level statement acknowledged");
            return Ok(QueryResult::empty());
        }

        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(DbError::SessionClosed)?;
        connection.query(query).await
    }

    /// Roll back the real transaction and release the connection.
    ///
    /// Only the first call does anything. The connection is released even if
    /// the ROLLBACK fails; the first error is returned.
    pub async fn rollback(&self) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, "redundant teardown ignored");
            return Ok(());
        }

        let Some(mut connection) = self.connection.lock().await.take() else {
            return Ok(());
        };

        let rolled_back = connection.rollback().await;
        if let Err(e) = &rolled_back {
            warn!(session = %self.id, error = %e, "real rollback failed");
        }
        let released = connection.release().await;

        debug!(
            session = %self.id,
            savepoints = self.savepoints.allocated(),
            "sandbox session torn down"
        );

        rolled_back.and(released)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_terminated() {
            warn!(session = %self.id, "sandbox session dropped without rollback");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("savepoints", &self.savepoints.allocated())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Owns the single live session of a sandbox.
pub struct SessionManager {
    source: Arc<dyn ConnectionSource>,
    debug: Arc<AtomicBool>,
    current: Mutex<Option<Live>>,
}

/// The live session and the arming ticket it was opened under, if any.
struct Live {
    ticket: Option<u64>,
    session: Arc<Session>,
}

impl Live {
    fn active(&self) -> Option<&Arc<Session>> {
        (!self.session.is_terminated()).then_some(&self.session)
    }
}

impl SessionManager {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            source,
            debug: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    /// Open a session now. Fails with `SessionActive` if one is live.
    pub async fn start(&self, options: SessionOptions) -> Result<Arc<Session>> {
        let mut current = self.current.lock().await;
        if current.as_ref().and_then(Live::active).is_some() {
            return Err(DbError::SessionActive);
        }

        let session = self.open(options).await?;
        *current = Some(Live {
            ticket: None,
            session: Arc::clone(&session),
        });
        Ok(session)
    }

    /// The live session, opening one with `options` if there is none.
    pub async fn get_or_start(&self, options: &SessionOptions) -> Result<Arc<Session>> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref().and_then(Live::active) {
            return Ok(Arc::clone(session));
        }

        let session = self.open(options.clone()).await?;
        *current = Some(Live {
            ticket: None,
            session: Arc::clone(&session),
        });
        Ok(session)
    }

    /// Like `get_or_start`, for the arming identified by `ticket`.
    ///
    /// A live session left over from an earlier arming is torn down first.
    pub(crate) async fn get_or_start_for(
        &self,
        ticket: u64,
        options: &SessionOptions,
    ) -> Result<Arc<Session>> {
        let mut current = self.current.lock().await;
        if let Some(live) = current.as_ref() {
            if let Some(session) = live.active() {
                if live.ticket == Some(ticket) {
                    return Ok(Arc::clone(session));
                }
                debug!(session = %session.id(), "tearing down session of a finished arming");
                if let Err(e) = session.rollback().await {
                    warn!(session = %session.id(), error = %e, "stale session teardown failed");
                }
            }
        }

        let session = self.open(options.clone()).await?;
        *current = Some(Live {
            ticket: Some(ticket),
            session: Arc::clone(&session),
        });
        Ok(session)
    }

    async fn open(&self, options: SessionOptions) -> Result<Arc<Session>> {
        Session::open(self.source.as_ref(), options, Arc::clone(&self.debug)).await
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.current
            .lock()
            .await
            .as_ref()
            .and_then(Live::active)
            .cloned()
    }

    /// Tear down the live session, if any.
    pub async fn rollback(&self) -> Result<()> {
        let live = self.current.lock().await.take();
        match live {
            Some(live) => live.session.rollback().await,
            None => Ok(()),
        }
    }

    /// Tear down the live session only if it was opened under `ticket`.
    pub(crate) async fn rollback_for(&self, ticket: u64) -> Result<()> {
        let live = {
            let mut current = self.current.lock().await;
            match current.as_ref() {
                Some(live) if live.ticket == Some(ticket) => current.take(),
                _ => None,
            }
        };
        match live {
            Some(live) => live.session.rollback().await,
            None => Ok(()),
        }
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    fn manager() -> (MemoryDatabase, SessionManager) {
        let db = MemoryDatabase::new();
        let manager = SessionManager::new(Arc::new(db.clone()));
        (db, manager)
    }

    #[tokio::test]
    async fn test_start_issues_isolation_then_begin() {
        let (db, manager) = manager();
        let session = manager
            .start(SessionOptions::new().isolation_level(IsolationLevel::Serializable))
            .await
            .unwrap();

        assert_eq!(
            db.journal().await,
            vec!["SET TRANSACTION ISOLATION LEVEL SERIALIZABLE", "BEGIN"]
        );
        assert_eq!(session.isolation_level(), Some(IsolationLevel::Serializable));
        assert_eq!(db.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (_db, manager) = manager();
        manager.start(SessionOptions::default()).await.unwrap();
        assert!(matches!(
            manager.start(SessionOptions::default()).await,
            Err(DbError::SessionActive)
        ));

        manager.rollback().await.unwrap();
        assert!(manager.start(SessionOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let (db, manager) = manager();
        let session = manager.start(SessionOptions::default()).await.unwrap();

        session.rollback().await.unwrap();
        session.rollback().await.unwrap();
        manager.rollback().await.unwrap();

        assert_eq!(db.journal().await, vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(db.open_connections(), 0);
        assert!(matches!(
            session.execute(Query::new("SELECT 1")).await,
            Err(DbError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_failed_begin_releases_connection() {
        let (db, manager) = manager();
        db.fail_next("BEGIN").await;

        assert!(manager.start(SessionOptions::default()).await.is_err());
        assert_eq!(db.open_connections(), 0);
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_releases_connection_when_rollback_fails() {
        let (db, manager) = manager();
        let session = manager.start(SessionOptions::default()).await.unwrap();
        db.fail_next("ROLLBACK").await;

        assert!(matches!(
            session.rollback().await,
            Err(DbError::ExecutionError(_))
        ));
        assert_eq!(db.open_connections(), 0);
        assert!(session.is_terminated());

        session.rollback().await.unwrap();
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_ticketed_sessions() {
        let (db, manager) = manager();
        let options = SessionOptions::default();

        let first = manager.get_or_start_for(1, &options).await.unwrap();
        let again = manager.get_or_start_for(1, &options).await.unwrap();
        assert_eq!(first.id(), again.id());

        // A newer arming replaces the session of the old one.
        let second = manager.get_or_start_for(2, &options).await.unwrap();
        assert!(first.is_terminated());
        assert_ne!(first.id(), second.id());
        assert_eq!(db.open_connections(), 1);

        manager.rollback_for(1).await.unwrap();
        assert!(!second.is_terminated());
        assert_eq!(manager.current().await.map(|s| s.id()), Some(second.id()));

        manager.rollback_for(2).await.unwrap();
        assert!(second.is_terminated());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_observer_sees_statements() {
        let (_db, manager) = manager();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let session = manager
            .start(SessionOptions::new().on_query(move |q| {
                sink.lock().unwrap().push(q.sql().to_string());
            }))
            .await
            .unwrap();

        session.execute(Query::new("SELECT 1")).await.unwrap();
        session
            .execute(Query::new("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["SELECT 1", "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"]
        );
    }
}
