//! Upstream MCP client
//!
//! Spawns the backing tool-server process and speaks newline-delimited
//! JSON-RPC with it over stdin/stdout. Exactly one subprocess is spawned per
//! client lifetime; its stderr is inherited so diagnostic output passes
//! through unmodified.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::mcp::protocol::{
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ServerInfo, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::types::{ProxyError, Result};
use crate::upstream::Invoker;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// How the backing process is launched.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Program to execute
    pub program: String,

    /// Arguments preceding the credential
    pub args: Vec<String>,

    /// Flag under which the credential is passed (e.g. `--api-key`)
    pub credential_flag: String,

    /// The credential value itself
    pub credential: String,

    /// Per-request timeout, also applied to the initialize handshake
    pub request_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(program: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            credential_flag: "--api-key".to_string(),
            credential: credential.into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client for the single shared upstream session.
///
/// Server identity and capabilities are captured once during `connect` and
/// exposed as read-only snapshots; every downstream session observes the
/// same values.
pub struct UpstreamClient {
    config: UpstreamConfig,
    next_id: AtomicU64,
    pending: PendingMap,
    request_tx: mpsc::UnboundedSender<String>,
    notify_tx: broadcast::Sender<JsonRpcNotification>,
    server_info: ServerInfo,
    capabilities: Value,
    protocol_version: String,
    // Held so the subprocess lives exactly as long as the client
    _child: Child,
}

impl UpstreamClient {
    /// Spawn the backing process and complete the initialize handshake.
    pub async fn connect(config: UpstreamConfig) -> Result<Self> {
        info!("Spawning upstream tool server: {}", config.program);

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .arg(&config.credential_flag)
            .arg(&config.credential)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProxyError::Connection(format!("failed to spawn {}: {}", config.program, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Connection("failed to open subprocess stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Connection("failed to open subprocess stdout".to_string()))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, _) = broadcast::channel(256);

        tokio::spawn(Self::write_loop(stdin, request_rx));
        tokio::spawn(Self::read_loop(
            stdout,
            Arc::clone(&pending),
            notify_tx.clone(),
            request_tx.clone(),
        ));

        let mut client = Self {
            config,
            next_id: AtomicU64::new(1),
            pending,
            request_tx,
            notify_tx,
            server_info: ServerInfo {
                name: String::new(),
                version: String::new(),
            },
            capabilities: Value::Null,
            protocol_version: PROTOCOL_VERSION.to_string(),
            _child: child,
        };

        let init = client.initialize().await?;
        client.server_info = init.server_info;
        client.capabilities = init.capabilities;
        client.protocol_version = init.protocol_version;

        info!(
            "Upstream session established: {} v{}",
            client.server_info.name, client.server_info.version
        );

        Ok(client)
    }

    /// Identity of the backing process, captured at connect time.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Capability set of the backing process, captured at connect time.
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Protocol revision negotiated with the backing process.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Subscribe to notifications initiated by the backing process.
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notify_tx.subscribe()
    }

    /// Background task writing newline-delimited messages to the subprocess
    async fn write_loop(mut stdin: ChildStdin, mut request_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(message) = request_rx.recv().await {
            if let Err(e) = stdin.write_all(message.as_bytes()).await {
                error!("Failed to write to upstream: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!("Failed to write to upstream: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush upstream stdin: {}", e);
                break;
            }
        }
    }

    /// Background task reading newline-delimited messages from the subprocess
    async fn read_loop(
        stdout: ChildStdout,
        pending: PendingMap,
        notify_tx: broadcast::Sender<JsonRpcNotification>,
        request_tx: mpsc::UnboundedSender<String>,
    ) {
        let mut lines = FramedRead::new(stdout, LinesCodec::new());

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read from upstream: {}", e);
                    return;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(JsonRpcMessage::Response(response)) => {
                    Self::dispatch_response(response, &pending).await;
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    debug!("Upstream notification: {}", notification.method);
                    let _ = notify_tx.send(notification);
                }
                Ok(JsonRpcMessage::Request(request)) => {
                    // The proxy advertises no client capabilities, so the
                    // backing process has nothing to ask of us.
                    warn!(
                        "Rejecting client-directed request from upstream: {}",
                        request.method
                    );
                    let response = JsonRpcResponse::error(
                        request.id,
                        JsonRpcError {
                            code: METHOD_NOT_FOUND,
                            message: format!(
                                "client-directed method not supported: {}",
                                request.method
                            ),
                            data: None,
                        },
                    );
                    if let Ok(text) = serde_json::to_string(&response) {
                        let _ = request_tx.send(text);
                    }
                }
                Err(e) => {
                    warn!("Unparseable message from upstream: {}", e);
                }
            }
        }

        warn!("Upstream closed stdout");
    }

    async fn dispatch_response(response: JsonRpcResponse, pending: &PendingMap) {
        let Some(id) = response.id.as_u64() else {
            warn!("Upstream response with non-numeric id: {:?}", response.id);
            return;
        };

        let mut pending_guard = pending.lock().await;
        let Some(sender) = pending_guard.remove(&id) else {
            warn!("Upstream response for unknown request id {}", id);
            return;
        };

        let result = if let Some(error) = response.error {
            Err(ProxyError::Upstream {
                code: error.code,
                message: error.message,
            })
        } else if let Some(result) = response.result {
            Ok(result)
        } else {
            Err(ProxyError::Protocol(
                "upstream response carried neither result nor error".to_string(),
            ))
        };

        let _ = sender.send(result);
    }

    /// Send a request to the backing process and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(json!(id), method, params);
        let message = serde_json::to_string(&request)?;

        debug!("Sending upstream request {}: {}", id, method);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.request_tx
            .send(message)
            .map_err(|_| ProxyError::Protocol("upstream writer task is gone".to_string()))?;

        let secs = self.config.request_timeout.as_secs();
        timeout(self.config.request_timeout, rx)
            .await
            .map_err(|_| ProxyError::Timeout(secs))?
            .map_err(|_| ProxyError::Protocol("upstream response channel closed".to_string()))?
    }

    /// Send a notification to the backing process (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let message = serde_json::to_string(&notification)?;

        debug!("Sending upstream notification: {}", method);

        self.request_tx
            .send(message)
            .map_err(|_| ProxyError::Protocol("upstream writer task is gone".to_string()))
    }

    /// Initialize handshake, capturing the identity snapshot.
    async fn initialize(&self) -> Result<InitializeResult> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .request("initialize", Some(params))
            .await
            .map_err(|e| ProxyError::Connection(format!("initialize handshake failed: {}", e)))?;

        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ProxyError::Connection(format!("invalid initialize result: {}", e)))?;

        self.notify("notifications/initialized", None)?;

        Ok(init)
    }
}

#[async_trait]
impl Invoker for UpstreamClient {
    async fn invoke(&self, tool: &str, arguments: Option<Value>) -> Result<Value> {
        let params = json!({
            "name": tool,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        self.request("tools/call", Some(params)).await
    }
}
