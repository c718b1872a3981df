//! Upstream connector: the single long-lived session to the backing process

pub mod client;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::Result;

pub use client::{UpstreamClient, UpstreamConfig};

/// A tool invoker.
///
/// The seam between the protocol proxy and the backing process: the caching
/// layer wraps one of these, and tests substitute their own.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invoke a named tool with the given arguments and return its raw
    /// result payload.
    async fn invoke(&self, tool: &str, arguments: Option<Value>) -> Result<Value>;
}
