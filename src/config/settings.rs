//! Listener settings and credential validation
//!
//! The network binding follows the usual precedence: an explicit `--port`
//! flag wins over the `PORT` environment variable, which wins over the
//! default.

use std::time::Duration;

use crate::types::{ProxyError, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SESSION_RETENTION_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen host, bind-all by default
    pub host: String,

    /// Listen port
    pub port: u16,

    /// How long a detached session is kept resumable before it is reaped
    pub session_retention: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            session_retention: Duration::from_secs(DEFAULT_SESSION_RETENTION_SECS),
        }
    }
}

impl ProxyConfig {
    /// Resolve the listen port from an explicit flag, the `PORT` environment
    /// variable, or the default, in that order.
    pub fn resolve_port(flag: Option<u16>) -> u16 {
        flag.or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_PORT)
    }
}

/// Read the upstream API credential from the environment.
///
/// A missing credential is a startup failure; nothing else is attempted
/// without it.
pub fn read_credential(var: &str) -> Result<String> {
    std::env::var(var)
        .map_err(|_| ProxyError::Config(format!("{} environment variable is not set", var)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_config_error() {
        let err = read_credential("MCPCACHE_TEST_UNSET_VAR").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        assert!(err.to_string().contains("MCPCACHE_TEST_UNSET_VAR"));
    }

    #[test]
    fn port_flag_wins() {
        assert_eq!(ProxyConfig::resolve_port(Some(9001)), 9001);
    }

    #[test]
    fn default_binding() {
        let config = ProxyConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
    }
}
