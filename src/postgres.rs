// ============================================================================
// PostgreSQL bridge
// ============================================================================
//
// Direct-connect source over tokio-postgres. Every `acquire` opens a new
// physical connection; `release` closes it. Statements go over the simple
// query protocol with parameters interpolated client-side, so values come
// back as text.
//
// ============================================================================

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::core::{DbError, Result, Value};
use crate::interface::{ConnectionSource, DatabaseConnection};
use crate::result::QueryResult;
use crate::sql::{Query, interpolate};

pub const ENV_PG_URL: &str = "TXN_SANDBOX_PG_URL";

/// Opens connections from a libpq-style connection string or URL.
#[derive(Debug, Clone)]
pub struct PgSource {
    config: String,
}

impl PgSource {
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
        }
    }

    /// Source configured by `TXN_SANDBOX_PG_URL`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var(ENV_PG_URL)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(Self::new)
    }

    pub async fn connect(&self) -> Result<PgConnection> {
        let (client, connection) = tokio_postgres::connect(&self.config, NoTls)
            .await
            .map_err(|e| DbError::AcquisitionFailed(e.to_string()))?;

        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection error");
            }
        });
        debug!("postgres connection opened");

        Ok(PgConnection {
            client: Some(client),
            task: Some(task),
        })
    }
}

#[async_trait]
impl ConnectionSource for PgSource {
    async fn acquire(&self) -> Result<Box<dyn DatabaseConnection>> {
        Ok(Box::new(self.connect().await?))
    }
}

pub struct PgConnection {
    client: Option<Client>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl DatabaseConnection for PgConnection {
    async fn query(&mut self, query: Query) -> Result<QueryResult> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| DbError::ExecutionError("Connection has been released".into()))?;

        let sql = interpolate(query.sql(), query.params())?;
        let messages = client.simple_query(&sql).await?;
        Ok(collect(messages))
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
        drop(self.client.take());
        if let Some(task) = self.task.take() {
            let _ = task.await;
            debug!("postgres connection closed");
        }
        Ok(())
    }
}

fn collect(messages: Vec<SimpleQueryMessage>) -> QueryResult {
    let mut result = QueryResult::empty();
    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                if result.columns.is_empty() {
                    result.columns = row
                        .columns()
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect();
                }
                let values = (0..row.len())
                    .map(|i| match row.get(i) {
                        Some(text) => Value::Text(text.to_string()),
                        None => Value::Null,
                    })
                    .collect();
                result.rows.push(values);
            }
            SimpleQueryMessage::CommandComplete(count) => {
                result.affected_rows = Some(count);
            }
            _ => {}
        }
    }
    result
}
