// ============================================================================
// Sandbox wire proxy
// ============================================================================
//
// A local PostgreSQL-protocol endpoint. Applications that cannot take a
// `ConnectionSource` point their driver here instead of at the database;
// each client socket is served by one connection acquired from the source,
// normally the sandbox `Multiplexer`, and released when the socket closes.
//
// Only the simple query flow is served. Results are sent as text columns.
//
// ============================================================================

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::{
    DefaultServerParameterProvider, LoginInfo, StartupHandler, finish_authentication,
    save_startup_parameters_to_metadata,
};
use pgwire::api::copy::NoopCopyHandler;
use pgwire::api::portal::Portal;
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{NoopQueryParser, StoredStatement};
use pgwire::api::{ClientInfo, PgWireConnectionState, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::SslResponse;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use pgwire::tokio::process_socket;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::connection::config::ProxyConfig;
use crate::core::{DbError, Result, Value};
use crate::interface::{ConnectionSource, DatabaseConnection};
use crate::result::QueryResult;
use crate::sql::Query;

pub struct SandboxProxy {
    source: Arc<dyn ConnectionSource>,
    config: ProxyConfig,
    metrics: Arc<ProxyMetrics>,
}

impl SandboxProxy {
    pub fn new(source: Arc<dyn ConnectionSource>, config: ProxyConfig) -> Self {
        Self {
            source,
            config,
            metrics: Arc::new(ProxyMetrics::default()),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn stats(&self) -> ProxyStats {
        self.metrics.snapshot()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        self.config.validate()?;
        Ok(TcpListener::bind(self.config.address()).await?)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve clients on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!(addr = ?local, "sandbox proxy listening");

        loop {
            let (socket, addr) = listener.accept().await?;
            let accepted = self.metrics.on_connection();
            debug!(peer = %addr, accepted, "proxy connection accepted");

            let handler = Arc::new(ProxyQueryHandler {
                source: Arc::clone(&self.source),
                connection: Mutex::new(None),
                metrics: Arc::clone(&self.metrics),
            });
            let factory = Arc::new(ProxyHandlerFactory {
                query: Arc::clone(&handler),
            });

            tokio::spawn(async move {
                if let Err(e) = process_socket(socket, None, factory).await {
                    error!(peer = %addr, error = ?e, "proxy connection error");
                }
                handler.close().await;
                debug!(peer = %addr, "proxy connection closed");
            });
        }
    }
}

/// Counters of a running proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyStats {
    pub connections_accepted: u64,
    pub queries_total: u64,
    pub queries_failed: u64,
}

#[derive(Debug, Default)]
struct ProxyMetrics {
    connections_accepted: AtomicU64,
    queries_total: AtomicU64,
    queries_failed: AtomicU64,
}

impl ProxyMetrics {
    fn on_connection(&self) -> u64 {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn on_query(&self) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
    }

    fn on_query_error(&self) {
        self.queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
        }
    }
}

struct ProxyHandlerFactory {
    query: Arc<ProxyQueryHandler>,
}

impl pgwire::api::PgWireHandlerFactory for ProxyHandlerFactory {
    type StartupHandler = ProxyStartupHandler;
    type SimpleQueryHandler = ProxyQueryHandler;
    type ExtendedQueryHandler = UnsupportedExtendedQuery;
    type CopyHandler = NoopCopyHandler;

    fn simple_query_handler(&self) -> Arc<Self::SimpleQueryHandler> {
        Arc::clone(&self.query)
    }

    fn extended_query_handler(&self) -> Arc<Self::ExtendedQueryHandler> {
        Arc::new(UnsupportedExtendedQuery)
    }

    fn startup_handler(&self) -> Arc<Self::StartupHandler> {
        Arc::new(ProxyStartupHandler {
            params: DefaultServerParameterProvider::default(),
        })
    }

    fn copy_handler(&self) -> Arc<Self::CopyHandler> {
        Arc::new(NoopCopyHandler)
    }
}

/// Accepts every client without a password.
struct ProxyStartupHandler {
    params: DefaultServerParameterProvider,
}

#[async_trait]
impl StartupHandler for ProxyStartupHandler {
    async fn on_startup<C>(
        &self,
        client: &mut C,
        message: PgWireFrontendMessage,
    ) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::SslRequest(_) => {
                client
                    .send(PgWireBackendMessage::SslResponse(SslResponse::Refuse))
                    .await?;
            }
            PgWireFrontendMessage::Startup(ref startup) => {
                if !matches!(client.state(), PgWireConnectionState::AwaitingStartup) {
                    let error_info = ErrorInfo::new(
                        "ERROR".to_string(),
                        "08P01".to_string(),
                        "Unexpected startup message".to_string(),
                    );
                    let error = pgwire::messages::response::ErrorResponse::from(error_info);
                    client
                        .feed(PgWireBackendMessage::ErrorResponse(error))
                        .await?;
                    client.close().await?;
                    return Ok(());
                }
                save_startup_parameters_to_metadata(client, startup);
                let user = LoginInfo::from_client_info(client)
                    .user()
                    .unwrap_or("")
                    .to_string();
                debug!(user = %user, "proxy client startup");
                finish_authentication(client, &self.params).await;
            }
            _ => {}
        }
        Ok(())
    }
}

struct ProxyQueryHandler {
    source: Arc<dyn ConnectionSource>,
    connection: Mutex<Option<Box<dyn DatabaseConnection>>>,
    metrics: Arc<ProxyMetrics>,
}

impl ProxyQueryHandler {
    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.source.acquire().await?);
        }
        let connection = guard.as_mut().ok_or(DbError::SessionClosed)?;
        connection.query(Query::new(sql)).await
    }

    async fn close(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(mut connection) = connection {
            if let Err(e) = connection.release().await {
                warn!(error = %e, "failed to release proxy connection");
            }
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for ProxyQueryHandler {
    async fn do_query<'a, 'b: 'a, C>(
        &'b self,
        _client: &mut C,
        query: &'a str,
    ) -> PgWireResult<Vec<Response<'a>>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        debug!(sql = query, "proxy simple query");
        let statements = split_statements(query);
        if statements.is_empty() {
            return Ok(vec![Response::EmptyQuery]);
        }

        let mut responses = Vec::with_capacity(statements.len());
        for statement in statements {
            self.metrics.on_query();
            match self.execute(statement).await {
                Ok(result) => responses.push(build_response(statement, result)?),
                Err(e) => {
                    self.metrics.on_query_error();
                    debug!(error = %e, "proxy query failed");
                    return Err(to_pg_error(&e));
                }
            }
        }
        Ok(responses)
    }
}

/// Rejects the extended query protocol.
struct UnsupportedExtendedQuery;

#[async_trait]
impl ExtendedQueryHandler for UnsupportedExtendedQuery {
    type Statement = String;
    type QueryParser = NoopQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        Arc::new(NoopQueryParser::new())
    }

    async fn do_query<'a, 'b: 'a, C>(
        &'b self,
        _client: &mut C,
        _portal: &'a Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response<'a>>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Err(extended_unsupported())
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        _stmt: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Err(extended_unsupported())
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        _portal: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Err(extended_unsupported())
    }
}

fn extended_unsupported() -> PgWireError {
    to_pg_error(&DbError::UnsupportedOperation(
        "extended query protocol; use simple queries".into(),
    ))
}

fn to_pg_error(err: &DbError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".to_string(),
        err.sqlstate().to_string(),
        err.to_string(),
    )))
}

/// Split on `;` outside single-quoted literals, dropping empty statements.
fn split_statements(query: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut in_literal = false;
    let mut start = 0;

    for (i, c) in query.char_indices() {
        match c {
            '\'' => in_literal = !in_literal,
            ';' if !in_literal => {
                statements.push(&query[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&query[start..]);

    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn command_tag(statement: &str, result: &QueryResult) -> String {
    let mut words = statement.split_whitespace().map(str::to_uppercase);
    let first = words.next().unwrap_or_default();
    let count = result.affected_rows().unwrap_or(0);

    match first.as_str() {
        "INSERT" => format!("INSERT 0 {}", count),
        "DELETE" | "UPDATE" => format!("{} {}", first, count),
        "SELECT" => format!("SELECT {}", result.row_count()),
        "CREATE" | "DROP" => match words.next() {
            Some(object) => format!("{} {}", first, object),
            None => first,
        },
        _ => first,
    }
}

fn build_response<'a>(statement: &str, result: QueryResult) -> PgWireResult<Response<'a>> {
    if result.columns().is_empty() {
        return Ok(Response::Execution(Tag::new(&command_tag(statement, &result))));
    }

    let fields = Arc::new(
        result
            .columns()
            .iter()
            .map(|name| FieldInfo::new(name.clone(), None, None, Type::TEXT, FieldFormat::Text))
            .collect::<Vec<_>>(),
    );

    let mut rows = Vec::with_capacity(result.row_count());
    for row in result.rows() {
        let mut encoder = DataRowEncoder::new(Arc::clone(&fields));
        for value in row {
            match value {
                Value::Null => encoder.encode_field(&None::<String>)?,
                other => encoder.encode_field(&other.to_string())?,
            }
        }
        rows.push(encoder.finish()?);
    }

    let row_stream = stream::iter(rows.into_iter().map(Ok::<DataRow, PgWireError>));
    Ok(Response::Query(QueryResponse::new(fields, row_stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements() {
        assert_eq!(
            split_statements("BEGIN; INSERT INTO t VALUES ('a;b');; COMMIT;"),
            vec!["BEGIN", "INSERT INTO t VALUES ('a;b')", "COMMIT"]
        );
        assert!(split_statements("  ;  ").is_empty());
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(
            command_tag("insert into t values (1)", &QueryResult::affected(1)),
            "INSERT 0 1"
        );
        assert_eq!(command_tag("DELETE FROM t", &QueryResult::affected(3)), "DELETE 3");
        assert_eq!(command_tag("create table t (id int)", &QueryResult::empty()), "CREATE TABLE");
        assert_eq!(command_tag("savepoint sp_1", &QueryResult::empty()), "SAVEPOINT");
    }
}
