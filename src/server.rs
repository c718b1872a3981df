//! Downstream listener
//!
//! Accepts WebSocket connections and binds each one to a session and a
//! protocol proxy sharing the single upstream client. Server frames are
//! `{seq, message}` envelopes so a reconnecting client can present the last
//! sequence id it saw (`?session=<id>&last_seq=<k>`) and receive only what
//! it missed; client frames are plain JSON-RPC text.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::CallCache;
use crate::config::ProxyConfig;
use crate::proxy::{notification_pump, ProxyRelay};
use crate::session::{OutboundFrame, ReplayEvent, Session, SessionStore};
use crate::types::{ProxyError, Result};
use crate::upstream::UpstreamClient;

/// First server frame after a connection is accepted, naming the session so
/// the client can resume it later.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionHandshake {
    pub session: String,
}

#[derive(Debug, Deserialize)]
struct ResumeQuery {
    session: Option<String>,
    last_seq: Option<u64>,
}

#[derive(Clone)]
struct AppState {
    relay: ProxyRelay,
    sessions: Arc<SessionStore>,
    upstream: Arc<UpstreamClient>,
}

/// The downstream listener.
pub struct ProxyServer {
    local_addr: SocketAddr,
    sessions: Arc<SessionStore>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl ProxyServer {
    /// Bind the listener and start serving.
    pub async fn bind(
        config: &ProxyConfig,
        upstream: Arc<UpstreamClient>,
        cache: Arc<CallCache>,
    ) -> Result<Self> {
        let sessions = SessionStore::new(config.session_retention);
        let reaper = sessions.spawn_reaper();

        let state = AppState {
            relay: ProxyRelay::new(Arc::clone(&upstream), cache),
            sessions: Arc::clone(&sessions),
            upstream,
        };

        let router = Router::new()
            .route("/mcp/ws", get(ws_handler))
            .with_state(state);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Config(format!("failed to bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Config(format!("failed to resolve listen address: {}", e)))?;

        info!("Listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("Listener error: {}", e);
            }
        });

        Ok(Self {
            local_addr,
            sessions,
            shutdown: Some(shutdown_tx),
            handle,
            reaper,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and release in-flight sessions.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.reaper.abort();
        self.sessions.clear().await;
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                error!("Listener task failed: {}", e);
            }
        }
        info!("Listener closed");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ResumeQuery>,
    State(state): State<AppState>,
) -> std::result::Result<Response, StatusCode> {
    let (session, last_seen) = match &query.session {
        Some(id) => {
            // Resume: unknown or already-reaped sessions are rejected before
            // the upgrade completes.
            let session = state
                .sessions
                .get(id)
                .await
                .ok_or(StatusCode::NOT_FOUND)?;
            if session.is_attached().await {
                return Err(StatusCode::CONFLICT);
            }
            (session, query.last_seq.unwrap_or(0))
        }
        None => (allocate_session(&state).await, 0),
    };

    info!(
        "Downstream connection for session {} (last_seq {})",
        session.id(),
        last_seen
    );

    let relay = state.relay.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        run_connection(sink, stream, session, relay, last_seen).await;
    }))
}

/// Allocate a fresh session and start its upstream-notification pump.
async fn allocate_session(state: &AppState) -> Arc<Session> {
    let session = state.sessions.create().await;
    let pump = tokio::spawn(notification_pump(
        state.upstream.subscribe(),
        Arc::clone(&session),
    ));
    session.set_pump(pump).await;
    session
}

/// Drive one connection against a session.
///
/// Generic over the transport halves so tests can drive it with in-memory
/// channels instead of a live WebSocket.
pub async fn run_connection<W, R>(
    mut sink: W,
    mut stream: R,
    session: Arc<Session>,
    relay: ProxyRelay,
    last_seen: u64,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let backlog = session.attach(last_seen, tx).await;

    let handshake = SessionHandshake {
        session: session.id().to_string(),
    };

    // Writer: handshake, then replay backlog, then live frames until the
    // session detaches or the peer goes away.
    let writer = tokio::spawn(async move {
        match serde_json::to_string(&handshake) {
            Ok(hello) => {
                if sink.send(Message::Text(hello.into())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Failed to serialize handshake: {}", e);
                return;
            }
        }

        for event in backlog {
            if send_event(&mut sink, &event).await.is_err() {
                return;
            }
        }

        while let Some(frame) = rx.recv().await {
            let sent = match frame {
                OutboundFrame::Event(event) => send_event(&mut sink, &event).await,
                OutboundFrame::Pong => sink.send(Message::Text("pong".into())).await.map_err(|_| ()),
            };
            if sent.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if text.trim() == "ping" {
                    session.pong().await;
                } else {
                    relay.handle_message(&session, &text).await;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Downstream closed session {}", session.id());
                break;
            }
            Ok(other) => {
                debug!("Ignoring non-text frame: {:?}", other);
            }
            Err(e) => {
                debug!("Downstream transport error: {}", e);
                break;
            }
        }
    }

    // Detaching drops the writer's channel sender; the session itself stays
    // resumable until the store reaps it.
    session.detach().await;
    let _ = writer.await;

    debug!("Connection for session {} ended", session.id());
}

async fn send_event<W>(sink: &mut W, event: &ReplayEvent) -> std::result::Result<(), ()>
where
    W: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize outbound event: {}", e);
            return Ok(());
        }
    };
    match sink.send(Message::Text(text.into())).await {
        Ok(()) => Ok(()),
        Err(_) => {
            warn!("Downstream send failed");
            Err(())
        }
    }
}
