use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::connection::config::{SandboxConfig, SessionOptions};
use crate::connection::multiplexer::Multiplexer;
use crate::connection::pool::ConnectionPool;
use crate::core::Result;
use crate::interface::ConnectionSource;
use crate::transaction::{Session, SessionManager};

/// Test harness wrapping an application's connection source.
///
/// Hand [`Sandbox::pool`] to the code under test in place of the real source.
/// Between `start_transaction` and the handle's `rollback`, every connection
/// it acquires shares one real transaction that is never committed.
///
/// ```
/// use txn_sandbox::{DatabaseConnection, ConnectionSource, MemoryDatabase, Sandbox, SessionOptions};
///
/// # #[tokio::main]
/// # async fn main() -> txn_sandbox::Result<()> {
/// let db = MemoryDatabase::new();
/// db.connect()?.execute("CREATE TABLE users (name TEXT)").await?;
///
/// let sandbox = Sandbox::new(db.clone());
/// let session = sandbox.start_transaction(SessionOptions::default())?;
///
/// let mut conn = sandbox.pool().acquire().await?;
/// conn.begin_transaction().await?;
/// conn.execute("INSERT INTO users VALUES ('Test')").await?;
/// conn.commit().await?;
///
/// session.rollback().await?;
/// assert_eq!(db.table_len("users").await?, 0);
/// # Ok(())
/// # }
/// ```
pub struct Sandbox {
    multiplexer: Arc<Multiplexer>,
}

impl Sandbox {
    pub fn new<S>(source: S) -> Self
    where
        S: ConnectionSource + 'static,
    {
        Self::from_source(Arc::new(source))
    }

    pub fn from_source(source: Arc<dyn ConnectionSource>) -> Self {
        Self {
            multiplexer: Arc::new(Multiplexer::new(source)),
        }
    }

    /// Build a sandbox with debug logging taken from `config`.
    pub fn from_config(source: Arc<dyn ConnectionSource>, config: &SandboxConfig) -> Self {
        let sandbox = Self::from_source(source);
        sandbox.set_debug(config.debug);
        sandbox
    }

    /// Put a [`ConnectionPool`] sized by `config` between the sandbox and
    /// `source`, then apply the rest of `config`.
    pub async fn pooled(source: Arc<dyn ConnectionSource>, config: &SandboxConfig) -> Result<Self> {
        let pool = ConnectionPool::new(source, config.pool_config()).await?;
        debug!(
            max_connections = config.max_connections,
            "sandbox source pooled"
        );
        Ok(Self::from_config(Arc::new(pool), config))
    }

    /// The connection source application code should use.
    pub fn pool(&self) -> Arc<Multiplexer> {
        Arc::clone(&self.multiplexer)
    }

    pub fn manager(&self) -> &SessionManager {
        self.multiplexer.manager()
    }

    /// Arm virtualization. The real session opens on the first acquire.
    pub fn start_transaction(&self, options: SessionOptions) -> Result<SessionHandle> {
        let ticket = self.multiplexer.arm(options)?;
        debug!(ticket, "sandbox transaction armed");
        Ok(SessionHandle {
            multiplexer: Arc::clone(&self.multiplexer),
            ticket,
            finished: AtomicBool::new(false),
        })
    }

    /// Tear down any live session and pass all future acquisitions through.
    pub async fn unpatch(&self) -> Result<()> {
        self.multiplexer.unpatch()?;
        debug!("sandbox unpatched");
        self.multiplexer.manager().rollback().await
    }

    pub fn set_debug(&self, enabled: bool) {
        self.multiplexer.manager().set_debug(enabled);
    }

    pub async fn current_session(&self) -> Option<Arc<Session>> {
        self.multiplexer.manager().current().await
    }
}

/// Returned by [`Sandbox::start_transaction`].
///
/// Dropping an unfinished handle disarms the sandbox at once and schedules the
/// rollback of its own session on the current tokio runtime.
pub struct SessionHandle {
    multiplexer: Arc<Multiplexer>,
    ticket: u64,
    finished: AtomicBool,
}

impl SessionHandle {
    /// Roll back everything done since `start_transaction`. Idempotent.
    pub async fn rollback(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.multiplexer.disarm_ticket(self.ticket)?;
        self.multiplexer.manager().rollback_for(self.ticket).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.multiplexer.disarm_ticket(self.ticket) {
            warn!(error = %e, "failed to disarm sandbox");
        }

        warn!("SessionHandle dropped without rollback().await; scheduling teardown");
        let multiplexer = Arc::clone(&self.multiplexer);
        let ticket = self.ticket;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = multiplexer.manager().rollback_for(ticket).await {
                        warn!(error = %e, "scheduled sandbox teardown failed");
                    }
                });
            }
            Err(_) => {
                warn!("no tokio runtime; sandbox session left open");
            }
        }
    }
}
