// ============================================================================
// txn-sandbox Library
// ============================================================================
//
// Run integration tests against a live database inside one real transaction
// that is never committed. Application code keeps opening connections and
// committing nested transactions as usual; all of it is multiplexed onto a
// single connection with savepoints, and one rollback at the end undoes it.
//
// ============================================================================

//! Transaction sandbox for database integration tests.
//!
//! # Example
//!
//! ```
//! use txn_sandbox::{ConnectionSource, DatabaseConnection, MemoryDatabase, Sandbox, SessionOptions};
//!
//! # #[tokio::main]
//! # async fn main() -> txn_sandbox::Result<()> {
//! let db = MemoryDatabase::new();
//! db.connect()?.execute("CREATE TABLE employee (first_name TEXT)").await?;
//!
//! let sandbox = Sandbox::new(db.clone());
//! let session = sandbox.start_transaction(SessionOptions::default())?;
//! let pool = sandbox.pool();
//!
//! let mut c1 = pool.acquire().await?;
//! let mut c2 = pool.acquire().await?;
//! c1.begin_transaction().await?;
//! c2.begin_transaction().await?;
//! c1.execute("INSERT INTO employee VALUES ('Kept')").await?;
//! c2.execute("INSERT INTO employee VALUES ('Dropped')").await?;
//! c2.rollback().await?;
//! c1.commit().await?;
//!
//! let rows = c1.execute("SELECT first_name FROM employee").await?;
//! assert_eq!(rows.row_count(), 1);
//!
//! session.rollback().await?;
//! assert_eq!(db.table_len("employee").await?, 0);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod core;
pub mod facade;
pub mod interface;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod result;
pub mod server;
pub mod sql;
pub mod transaction;

pub use core::{DbError, Result, Row, Value};
pub use result::QueryResult;

pub use interface::{ConnectionSource, DatabaseConnection};
pub use sql::{Query, StatementKind, classify};

pub use connection::{
    ConnectionPool, Multiplexer, PoolConfig, PoolGuard, PoolStats, ProxyConfig, QueryObserver,
    SandboxConfig, SessionOptions, VirtualConnection,
};
pub use transaction::{
    IsolationLevel, NestedState, NestedTransaction, SavepointAllocator, SavepointId, Session,
    SessionManager,
};

pub use facade::{Sandbox, SessionHandle};
pub use memory::{MemoryConnection, MemoryDatabase};
pub use server::{ProxyStats, SandboxProxy};

#[cfg(feature = "postgres")]
pub use postgres::{PgConnection, PgSource};
