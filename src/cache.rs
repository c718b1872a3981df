//! Tool invocation cache
//!
//! Pure memoization of `tools/call` results keyed by a deterministic
//! fingerprint of (tool name, arguments). No TTL, no size bound, no
//! invalidation: an entry lives until the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{ProxyError, Result};
use crate::upstream::Invoker;

/// Compute the cache key for a tool invocation.
///
/// The fingerprint is `"<tool>:<canonical-arguments>"` where the canonical
/// form serializes object keys in sorted order at every nesting level, so
/// structurally equal argument maps produce identical keys regardless of
/// incidental key ordering. Absent arguments are treated as an empty map.
pub fn cache_key(tool: &str, arguments: Option<&Value>) -> Result<String> {
    let canonical = match arguments {
        None => "{}".to_string(),
        Some(value @ Value::Object(_)) => canonical_json(value)?,
        Some(other) => {
            return Err(ProxyError::CacheKey(format!(
                "tool arguments must be an object, got {}",
                json_type_name(other)
            )))
        }
    };
    Ok(format!("{}:{}", tool, canonical))
}

fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Process-wide memoization table for tool invocation results.
#[derive(Default)]
pub struct CallCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl CallCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: String, value: Value) {
        self.entries.lock().await.insert(key, value);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Caching decorator over an [`Invoker`].
///
/// On a hit the inner invoker is never consulted. On a miss the result is
/// stored only on success; failed calls leave the key unpopulated. There is
/// no single-flight coordination: concurrent identical misses may each reach
/// the inner invoker, and the last write wins.
pub struct CachingInvoker<I> {
    inner: Arc<I>,
    cache: Arc<CallCache>,
}

impl<I: Invoker> CachingInvoker<I> {
    pub fn new(inner: Arc<I>, cache: Arc<CallCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<I: Invoker> Invoker for CachingInvoker<I> {
    async fn invoke(&self, tool: &str, arguments: Option<Value>) -> Result<Value> {
        let key = cache_key(tool, arguments.as_ref())?;

        if let Some(hit) = self.cache.get(&key).await {
            debug!("Cache hit: {}", key);
            return Ok(hit);
        }
        debug!("Cache miss: {}", key);

        let result = self.inner.invoke(tool, arguments).await?;
        self.cache.put(key, result.clone()).await;

        Ok(result)
    }
}
