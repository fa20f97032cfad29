use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::config::PoolConfig;
use crate::core::{DbError, Result};
use crate::interface::{ConnectionSource, DatabaseConnection};
use crate::result::QueryResult;
use crate::sql::{Query, StatementKind};

/// Connection pool
///
/// Keeps physical connections from any [`ConnectionSource`] for reuse.
/// The pool is itself a `ConnectionSource`, so it can be handed to the
/// sandbox like any other upstream.
pub struct ConnectionPool {
    config: PoolConfig,
    source: Arc<dyn ConnectionSource>,
    /// Available connections
    available: Arc<Mutex<VecDeque<PooledConnection>>>,
    /// Connections created and not yet closed
    total_connections: Arc<AtomicUsize>,
}

/// A connection from the pool
struct PooledConnection {
    connection: Box<dyn DatabaseConnection>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    fn new(connection: Box<dyn DatabaseConnection>) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_used: now,
        }
    }

    fn returned(connection: Box<dyn DatabaseConnection>, created_at: Instant) -> Self {
        Self {
            connection,
            created_at,
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }
}

impl ConnectionPool {
    /// Create a pool and open `min_connections` connections up front
    pub async fn new(source: Arc<dyn ConnectionSource>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            config,
            source,
            available: Arc::new(Mutex::new(VecDeque::new())),
            total_connections: Arc::new(AtomicUsize::new(0)),
        };

        pool.ensure_min_connections().await?;

        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a connection from the pool
    pub async fn get_connection(&self) -> Result<PoolGuard> {
        let start = Instant::now();

        loop {
            if let Some(pooled) = self.try_get_available().await? {
                return Ok(self.guard(pooled.connection, pooled.created_at));
            }

            if let Some(connection) = self.try_create_connection().await? {
                return Ok(self.guard(connection, Instant::now()));
            }

            if start.elapsed() > self.config.connect_timeout {
                return Err(DbError::PoolTimeout);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn guard(&self, connection: Box<dyn DatabaseConnection>, created_at: Instant) -> PoolGuard {
        PoolGuard {
            connection: Some(connection),
            created_at,
            in_transaction: false,
            pool: Arc::clone(&self.available),
            total_connections: Arc::clone(&self.total_connections),
        }
    }

    /// Take an available connection, closing expired ones on the way
    async fn try_get_available(&self) -> Result<Option<PooledConnection>> {
        let mut available = self.available.lock().await;

        let mut kept = VecDeque::with_capacity(available.len());
        let mut stale = Vec::new();
        while let Some(pooled) = available.pop_front() {
            if pooled.is_expired(self.config.max_lifetime)
                || pooled.is_idle_too_long(self.config.idle_timeout)
            {
                stale.push(pooled);
            } else {
                kept.push_back(pooled);
            }
        }
        *available = kept;
        let next = available.pop_front();
        drop(available);

        if !stale.is_empty() {
            self.total_connections.fetch_sub(stale.len(), Ordering::SeqCst);
            debug!(closed = stale.len(), "closing stale pooled connections");
            for mut pooled in stale {
                if let Err(e) = pooled.connection.release().await {
                    warn!(error = %e, "failed to close stale connection");
                }
            }
        }

        Ok(next)
    }

    /// Open a new connection if under the limit
    async fn try_create_connection(&self) -> Result<Option<Box<dyn DatabaseConnection>>> {
        let reserved = self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < self.config.max_connections).then_some(total + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        match self.source.acquire().await {
            Ok(connection) => Ok(Some(connection)),
            Err(e) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn ensure_min_connections(&self) -> Result<()> {
        let mut available = self.available.lock().await;

        while self.total_connections.load(Ordering::SeqCst) < self.config.min_connections {
            let connection = self.source.acquire().await?;
            available.push_back(PooledConnection::new(connection));
            self.total_connections.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        let available = self.available.lock().await;
        let total = self.total_connections.load(Ordering::SeqCst);

        PoolStats {
            total_connections: total,
            available_connections: available.len(),
            active_connections: total.saturating_sub(available.len()),
            max_connections: self.config.max_connections,
        }
    }
}

#[async_trait]
impl ConnectionSource for ConnectionPool {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>> {
        Ok(Box::new(self.get_connection().await?))
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, max {}",
            self.active_connections,
            self.total_connections,
            self.available_connections,
            self.max_connections
        )
    }
}

/// A connection checked out of a [`ConnectionPool`]
///
/// `release()` returns the connection to the pool, rolling back an open
/// transaction first. Dropping the guard returns it too, unless a transaction
/// is open, in which case the connection is closed instead.
pub struct PoolGuard {
    connection: Option<Box<dyn DatabaseConnection>>,
    created_at: Instant,
    in_transaction: bool,
    pool: Arc<Mutex<VecDeque<PooledConnection>>>,
    total_connections: Arc<AtomicUsize>,
}

impl PoolGuard {
    fn connection(&mut self) -> Result<&mut Box<dyn DatabaseConnection>> {
        self.connection
            .as_mut()
            .ok_or_else(|| DbError::ExecutionError("Connection already returned to pool".into()))
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }
}

#[async_trait]
impl DatabaseConnection for PoolGuard {
    async fn query(&mut self, query: Query) -> Result<QueryResult> {
        let kind = query.kind();
        let result = self.connection()?.query(query).await?;
        match kind {
            StatementKind::Begin => self.in_transaction = true,
            StatementKind::Commit | StatementKind::Rollback => self.in_transaction = false,
            _ => {}
        }
        Ok(result)
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.connection()?.begin_transaction().await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.connection()?.commit().await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.connection()?.rollback().await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            if self.in_transaction {
                self.in_transaction = false;
                if let Err(e) = connection.rollback().await {
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    let _ = connection.release().await;
                    return Err(e);
                }
            }

            let mut pool = self.pool.lock().await;
            pool.push_back(PooledConnection::returned(connection, self.created_at));
        }
        Ok(())
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if self.in_transaction {
                warn!(
                    "PoolGuard dropped with active transaction; connection closed instead of returned. Call release().await."
                );
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            if let Ok(mut pool) = self.pool.try_lock() {
                pool.push_back(PooledConnection::returned(connection, self.created_at));
            } else {
                warn!("PoolGuard dropped and pool lock busy; connection closed. Call release().await.");
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;

    async fn pool_with(config: PoolConfig) -> (MemoryDatabase, ConnectionPool) {
        let db = MemoryDatabase::new();
        let pool = ConnectionPool::new(Arc::new(db.clone()), config).await.unwrap();
        (db, pool)
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let (db, pool) = pool_with(PoolConfig::new().min_connections(2).max_connections(5)).await;
        let stats = pool.stats().await;

        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.available_connections, 2);
        assert_eq!(db.open_connections(), 2);
    }

    #[tokio::test]
    async fn test_release_returns_connection() {
        let (db, pool) = pool_with(PoolConfig::new().max_connections(5)).await;

        let mut conn = pool.get_connection().await.unwrap();
        conn.execute("SELECT 1").await.unwrap();
        assert_eq!(pool.stats().await.active_connections, 1);

        conn.release().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.available_connections, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(db.open_connections(), 1);

        assert!(conn.execute("SELECT 1").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_returns_connection() {
        let (_db, pool) = pool_with(PoolConfig::new().max_connections(5)).await;
        {
            let _conn = pool.get_connection().await.unwrap();
        }
        assert_eq!(pool.stats().await.available_connections, 1);
    }

    #[tokio::test]
    async fn test_release_rolls_back_open_transaction() {
        let (db, pool) = pool_with(PoolConfig::new().max_connections(1)).await;
        let mut conn = pool.get_connection().await.unwrap();
        conn.execute("CREATE TABLE t (id INT)").await.unwrap();
        conn.begin_transaction().await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)").await.unwrap();
        assert!(conn.is_in_transaction());
        conn.release().await.unwrap();

        assert_eq!(db.table_len("t").await.unwrap(), 0);
        assert_eq!(db.journal().await.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let (_db, pool) = pool_with(
            PoolConfig::new()
                .max_connections(2)
                .connect_timeout(Duration::from_millis(100)),
        )
        .await;

        let _conn1 = pool.get_connection().await.unwrap();
        let _conn2 = pool.get_connection().await.unwrap();

        let result = pool.get_connection().await;
        assert!(matches!(result, Err(DbError::PoolTimeout)));
    }

    #[tokio::test]
    async fn test_acquire_failure_frees_slot() {
        let (db, pool) = pool_with(PoolConfig::new().max_connections(1)).await;
        db.refuse_connections(true);
        assert!(matches!(
            pool.get_connection().await,
            Err(DbError::AcquisitionFailed(_))
        ));

        db.refuse_connections(false);
        assert!(pool.get_connection().await.is_ok());
    }
}
