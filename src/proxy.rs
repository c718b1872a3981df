//! Protocol proxy
//!
//! Mediates between one downstream session and the shared upstream session:
//! `initialize` is answered locally from the connect-time identity snapshot,
//! `tools/call` goes through the caching invoker, and everything else is
//! relayed verbatim. Upstream failures surface as structured JSON-RPC error
//! responses; they never crash the proxy and are never cached.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{CallCache, CachingInvoker};
use crate::mcp::protocol::{
    CallToolParams, InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, PARSE_ERROR,
};
use crate::session::Session;
use crate::types::{ProxyError, Result};
use crate::upstream::{Invoker, UpstreamClient};

/// Per-session mediator over the shared upstream session.
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ProxyRelay {
    upstream: Arc<UpstreamClient>,
    invoker: Arc<CachingInvoker<UpstreamClient>>,
}

impl ProxyRelay {
    pub fn new(upstream: Arc<UpstreamClient>, cache: Arc<CallCache>) -> Self {
        let invoker = Arc::new(CachingInvoker::new(Arc::clone(&upstream), cache));
        Self { upstream, invoker }
    }

    /// Handle one inbound downstream frame.
    ///
    /// Requests are dispatched in arrival order but handled on their own
    /// tasks, so responses may complete out of order; the session's replay
    /// log still records emission order.
    pub async fn handle_message(&self, session: &Arc<Session>, text: &str) {
        let message: JsonRpcMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable downstream message: {}", e);
                let response = JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError {
                        code: PARSE_ERROR,
                        message: format!("parse error: {}", e),
                        data: None,
                    },
                );
                session.emit(JsonRpcMessage::Response(response)).await;
                return;
            }
        };

        match message {
            JsonRpcMessage::Request(request) => {
                let relay = self.clone();
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    let response = relay.handle_request(request).await;
                    session.emit(JsonRpcMessage::Response(response)).await;
                });
            }
            JsonRpcMessage::Notification(notification) => {
                debug!("Relaying notification upstream: {}", notification.method);
                if let Err(e) = self
                    .upstream
                    .notify(&notification.method, notification.params)
                {
                    warn!("Failed to relay notification: {}", e);
                }
            }
            JsonRpcMessage::Response(response) => {
                // The proxy never issues server-to-client requests, so there
                // is nothing to match this against.
                warn!("Dropping unexpected downstream response: {:?}", response.id);
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        debug!("Downstream request: {}", request.method);

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "tools/call" => self.handle_call_tool(request.params).await,
            _ => self.upstream.request(&request.method, request.params).await,
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                warn!("Request failed: {}", e);
                JsonRpcResponse::error(
                    id,
                    JsonRpcError {
                        code: e.jsonrpc_code(),
                        message: e.to_string(),
                        data: None,
                    },
                )
            }
        }
    }

    /// Answer `initialize` locally with the identity captured from the
    /// backing process at startup; all sessions observe the same snapshot.
    fn handle_initialize(&self) -> Result<Value> {
        let result = InitializeResult {
            protocol_version: self.upstream.protocol_version().to_string(),
            capabilities: self.upstream.capabilities().clone(),
            server_info: self.upstream.server_info().clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value> {
        let params: CallToolParams = serde_json::from_value(params.unwrap_or_else(|| json!({})))
            .map_err(|e| ProxyError::CacheKey(format!("invalid tool call params: {}", e)))?;

        self.invoker.invoke(&params.name, params.arguments).await
    }
}

/// Forward upstream-initiated notifications into a session for the rest of
/// its lifetime.
pub async fn notification_pump(
    mut notifications: broadcast::Receiver<JsonRpcNotification>,
    session: Arc<Session>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => {
                session
                    .emit(JsonRpcMessage::Notification(notification))
                    .await;
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(
                    "Session {} dropped {} upstream notifications",
                    session.id(),
                    missed
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
