use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{DbError, Result};
use crate::sql::Query;
use crate::transaction::IsolationLevel;

/// Observer invoked with every statement a session sends to the real
/// connection, application SQL and synthesized savepoint statements alike.
pub type QueryObserver = Arc<dyn Fn(&Query) + Send + Sync>;

/// Options for one sandbox session
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Applied once, before the session's BEGIN
    pub isolation_level: Option<IsolationLevel>,

    pub on_query: Option<QueryObserver>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level of the real transaction
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Install a statement observer
    pub fn on_query<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Query) + Send + Sync + 'static,
    {
        self.on_query = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("isolation_level", &self.isolation_level)
            .field("on_query", &self.on_query.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened eagerly when the pool is created
    pub min_connections: usize,

    pub max_connections: usize,

    /// How long `acquire` waits for a free connection
    pub connect_timeout: Duration,

    /// Idle connections older than this are closed
    pub idle_timeout: Option<Duration>,

    /// Connections older than this are closed on return
    pub max_lifetime: Option<Duration>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
        }
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(DbError::Config("max_connections must be > 0".into()));
        }

        if self.min_connections > self.max_connections {
            return Err(DbError::Config(
                "min_connections cannot exceed max_connections".into(),
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Listen address of the wire proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,

    /// 0 picks an ephemeral port
    pub port: u16,
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5433,
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DbError::Config("host cannot be empty".into()));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub const ENV_ISOLATION_LEVEL: &str = "TXN_SANDBOX_ISOLATION_LEVEL";
pub const ENV_DEBUG: &str = "TXN_SANDBOX_DEBUG";
pub const ENV_MAX_CONNECTIONS: &str = "TXN_SANDBOX_MAX_CONNECTIONS";

/// Harness settings loadable from JSON or the environment.
///
/// ```
/// use txn_sandbox::SandboxConfig;
///
/// let config = SandboxConfig::from_json_str(
///     r#"{ "isolation_level": "serializable", "debug": true }"#,
/// ).unwrap();
/// assert!(config.debug);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolation_level: Option<IsolationLevel>,
    pub debug: bool,
    pub max_connections: usize,
    pub connect_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation_level: None,
            debug: false,
            max_connections: 10,
            connect_timeout_ms: 30_000,
        }
    }
}

impl SandboxConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DbError::Config(e.to_string()))
    }

    /// Read `TXN_SANDBOX_*` variables; unset ones keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_ISOLATION_LEVEL if !value.is_empty() => {
                    config.isolation_level = Some(value.parse()?);
                }
                ENV_DEBUG => {
                    config.debug = matches!(
                        value.to_ascii_lowercase().as_str(),
                        "1" | "true" | "yes" | "on"
                    );
                }
                ENV_MAX_CONNECTIONS => {
                    config.max_connections = value.parse().map_err(|_| {
                        DbError::Config(format!("{} must be a number", ENV_MAX_CONNECTIONS))
                    })?;
                }
                _ => {}
            }
        }
        config.pool_config().validate()?;
        Ok(config)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            isolation_level: self.isolation_level,
            on_query: None,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_connections(self.max_connections)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_builder_and_validate() {
        let config = PoolConfig::new().min_connections(2).max_connections(5);
        assert!(config.validate().is_ok());

        assert!(PoolConfig::new().max_connections(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .min_connections(10)
                .max_connections(5)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_session_options_debug_hides_observer() {
        let options = SessionOptions::new()
            .isolation_level(IsolationLevel::Serializable)
            .on_query(|_| {});
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("Serializable"));
        assert!(rendered.contains("<observer>"));
    }

    #[test]
    fn test_sandbox_config_from_json() {
        let config =
            SandboxConfig::from_json_str(r#"{ "isolation_level": "REPEATABLE READ" }"#).unwrap();
        assert_eq!(config.isolation_level, Some(IsolationLevel::RepeatableRead));
        assert!(!config.debug);
        assert_eq!(config.max_connections, 10);

        assert!(SandboxConfig::from_json_str(r#"{ "isolation_level": "sometimes" }"#).is_err());
    }

    #[test]
    fn test_sandbox_config_from_vars() {
        let config = SandboxConfig::from_vars([
            (ENV_ISOLATION_LEVEL, "read_committed"),
            (ENV_DEBUG, "TRUE"),
            (ENV_MAX_CONNECTIONS, "3"),
            ("UNRELATED", "x"),
        ])
        .unwrap();

        assert_eq!(config.isolation_level, Some(IsolationLevel::ReadCommitted));
        assert!(config.debug);
        assert_eq!(config.pool_config().max_connections, 3);
        assert_eq!(
            config.session_options().isolation_level,
            Some(IsolationLevel::ReadCommitted)
        );
    }

    #[test]
    fn test_sandbox_config_rejects_bad_vars() {
        assert!(SandboxConfig::from_vars([(ENV_MAX_CONNECTIONS, "many")]).is_err());
        assert!(SandboxConfig::from_vars([(ENV_MAX_CONNECTIONS, "0")]).is_err());
    }

    #[test]
    fn test_proxy_address() {
        let config = ProxyConfig::new().port(0);
        assert_eq!(config.address(), "127.0.0.1:0");
    }
}
