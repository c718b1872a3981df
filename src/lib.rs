//! MCPCache - caching network proxy for Model Context Protocol tool servers
//!
//! Exposes a subprocess-hosted MCP tool server over a resumable WebSocket
//! transport, memoizing tool invocations so repeated identical calls never
//! reach the backing process twice.

pub mod cache;
pub mod config;
pub mod mcp;
pub mod proxy;
pub mod server;
pub mod session;
pub mod types;
pub mod upstream;

pub use cache::{cache_key, CallCache, CachingInvoker};
pub use config::ProxyConfig;
pub use proxy::ProxyRelay;
pub use server::ProxyServer;
pub use session::{ReplayEvent, ReplayLog, Session, SessionStore};
pub use types::ProxyError;
pub use upstream::{Invoker, UpstreamClient, UpstreamConfig};
