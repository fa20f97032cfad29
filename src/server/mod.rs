pub mod proxy;

pub use proxy::{ProxyStats, SandboxProxy};
