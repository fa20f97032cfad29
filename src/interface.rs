use async_trait::async_trait;

use crate::core::Result;
use crate::result::QueryResult;
use crate::sql::Query;

/// A database connection as application code sees it.
///
/// Real driver connections and [`VirtualConnection`](crate::VirtualConnection)
/// both implement this trait, so code written against it cannot tell whether it
/// talks to the database directly or through a sandbox session.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    /// Execute one statement.
    async fn query(&mut self, query: Query) -> Result<QueryResult>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Give the connection back to wherever it came from.
    async fn release(&mut self) -> Result<()>;

    /// Check if the connection is alive.
    async fn ping(&mut self) -> Result<()> {
        self.query(Query::new("SELECT 1")).await.map(|_| ())
    }

    /// Convenience wrapper taking plain SQL text.
    async fn execute(&mut self, sql: &str) -> Result<QueryResult> {
        self.query(Query::new(sql)).await
    }
}

/// Where connections come from: a pool, a direct connector, or a sandbox
/// multiplexer standing in for either.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>>;
}
