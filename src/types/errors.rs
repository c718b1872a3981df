use thiserror::Error;

use crate::mcp::protocol::{INTERNAL_ERROR, INVALID_PARAMS};

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream connection failed: {0}")]
    Connection(String),

    #[error("Upstream error {code}: {message}")]
    Upstream { code: i32, message: String },

    #[error("Cache key error: {0}")]
    CacheKey(String),

    #[error("Request timeout after {0}s")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// JSON-RPC error code used when this error is surfaced to a downstream
    /// peer. Upstream errors keep their original code.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            ProxyError::Upstream { code, .. } => *code,
            ProxyError::CacheKey(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
