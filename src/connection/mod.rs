// ============================================================================
// Connections: configuration, pooling and virtualization
// ============================================================================

pub mod config;
pub mod multiplexer;
pub mod pool;
pub mod virtual_connection;

pub use config::{PoolConfig, ProxyConfig, QueryObserver, SandboxConfig, SessionOptions};
pub use multiplexer::Multiplexer;
pub use pool::{ConnectionPool, PoolGuard, PoolStats};
pub use virtual_connection::VirtualConnection;
