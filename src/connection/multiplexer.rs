use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

use super::config::SessionOptions;
use super::virtual_connection::VirtualConnection;
use crate::core::{DbError, Result};
use crate::interface::{ConnectionSource, DatabaseConnection};
use crate::transaction::SessionManager;

/// Stands in for the application's connection source.
///
/// While a sandbox transaction is armed, every `acquire` returns a fresh
/// [`VirtualConnection`] on the one session connection, opening the session
/// on first use. Otherwise `acquire` passes straight through to the wrapped
/// source.
pub struct Multiplexer {
    source: Arc<dyn ConnectionSource>,
    manager: SessionManager,
    armed: Mutex<Option<Armed>>,
    patched: AtomicBool,
    next_id: AtomicU64,
    next_ticket: AtomicU64,
}

/// Options of the current arming, tagged with the ticket its session carries.
#[derive(Clone)]
struct Armed {
    ticket: u64,
    options: SessionOptions,
}

impl Multiplexer {
    pub fn new(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            manager: SessionManager::new(Arc::clone(&source)),
            source,
            armed: Mutex::new(None),
            patched: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// The wrapped upstream source
    pub fn source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    pub fn is_patched(&self) -> bool {
        self.patched.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> Result<bool> {
        Ok(self.armed.lock()?.is_some())
    }

    /// Arm virtualization and return the ticket identifying this arming.
    pub(crate) fn arm(&self, options: SessionOptions) -> Result<u64> {
        if !self.is_patched() {
            return Err(DbError::Unpatched);
        }

        let mut armed = self.armed.lock()?;
        if armed.is_some() {
            return Err(DbError::SessionActive);
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        *armed = Some(Armed { ticket, options });
        Ok(ticket)
    }

    pub(crate) fn disarm(&self) -> Result<()> {
        *self.armed.lock()? = None;
        Ok(())
    }

    /// Disarm only if `ticket` is still the current arming.
    pub(crate) fn disarm_ticket(&self, ticket: u64) -> Result<()> {
        let mut armed = self.armed.lock()?;
        if armed.as_ref().is_some_and(|a| a.ticket == ticket) {
            *armed = None;
        }
        Ok(())
    }

    /// Route all future acquisitions to the wrapped source.
    pub(crate) fn unpatch(&self) -> Result<()> {
        self.patched.store(false, Ordering::SeqCst);
        self.disarm()
    }

    fn armed(&self) -> Result<Option<Armed>> {
        if !self.is_patched() {
            return Ok(None);
        }
        Ok(self.armed.lock()?.clone())
    }

    /// A virtual connection on the live session, starting it if needed.
    pub async fn acquire_virtual(&self) -> Result<VirtualConnection> {
        let armed = self.armed()?.ok_or(DbError::NoActiveTransaction)?;
        let session = self
            .manager
            .get_or_start_for(armed.ticket, &armed.options)
            .await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, session = %session.id(), "virtual connection acquired");
        Ok(VirtualConnection::new(id, session))
    }
}

#[async_trait]
impl ConnectionSource for Multiplexer {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>> {
        if self.armed()?.is_none() {
            trace!("passthrough acquire");
            return self.source.acquire().await;
        }
        Ok(Box::new(self.acquire_virtual().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    fn multiplexer() -> (MemoryDatabase, Multiplexer) {
        let db = MemoryDatabase::new();
        let mux = Multiplexer::new(Arc::new(db.clone()));
        (db, mux)
    }

    #[tokio::test]
    async fn test_passthrough_when_not_armed() {
        let (db, mux) = multiplexer();
        let _conn = mux.acquire().await.unwrap();
        assert_eq!(db.open_connections(), 1);
        assert!(mux.manager().current().await.is_none());
    }

    #[tokio::test]
    async fn test_armed_acquire_shares_one_connection() {
        let (db, mux) = multiplexer();
        mux.arm(SessionOptions::default()).unwrap();

        let mut conns = Vec::new();
        for _ in 0..10 {
            conns.push(mux.acquire_virtual().await.unwrap());
        }

        assert_eq!(db.open_connections(), 1);
        let session = conns[0].session_id();
        assert!(conns.iter().all(|c| c.session_id() == session));
        assert_ne!(conns[0].id(), conns[1].id());
    }

    #[tokio::test]
    async fn test_arm_twice_and_after_unpatch() {
        let (_db, mux) = multiplexer();
        mux.arm(SessionOptions::default()).unwrap();
        assert!(matches!(
            mux.arm(SessionOptions::default()),
            Err(DbError::SessionActive)
        ));

        mux.unpatch().unwrap();
        assert!(!mux.is_armed().unwrap());
        assert!(matches!(
            mux.arm(SessionOptions::default()),
            Err(DbError::Unpatched)
        ));
    }

    #[tokio::test]
    async fn test_acquisition_failure_creates_no_session() {
        let (db, mux) = multiplexer();
        db.refuse_connections(true);
        mux.arm(SessionOptions::default()).unwrap();

        assert!(matches!(
            mux.acquire().await,
            Err(DbError::AcquisitionFailed(_))
        ));
        assert!(mux.manager().current().await.is_none());
    }
}
