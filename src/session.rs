//! Downstream sessions and replay state
//!
//! A session outlives any single network connection: every outbound protocol
//! event is appended to a per-session replay log, and a reconnecting client
//! presenting the last sequence id it saw receives exactly the events it
//! missed, in order, before live delivery resumes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::mcp::protocol::JsonRpcMessage;

/// One outbound protocol event, keyed by its per-session sequence id.
///
/// This is also the wire envelope for server frames: the sequence id plays
/// the role an event id plays in a resumable event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub seq: u64,
    pub message: JsonRpcMessage,
}

/// Append-only, in-order log of a session's outbound events.
///
/// Sequence ids are contiguous and 1-based; events are never mutated after
/// append.
#[derive(Default)]
pub struct ReplayLog {
    events: Mutex<Vec<ReplayEvent>>,
}

impl ReplayLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, assigning the next sequence id.
    pub async fn append(&self, message: JsonRpcMessage) -> ReplayEvent {
        let mut events = self.events.lock().await;
        let event = ReplayEvent {
            seq: events.len() as u64 + 1,
            message,
        };
        events.push(event.clone());
        event
    }

    /// All events with a sequence id strictly greater than `last_seen`,
    /// in order.
    pub async fn events_after(&self, last_seen: u64) -> Vec<ReplayEvent> {
        let events = self.events.lock().await;
        events
            .iter()
            .filter(|event| event.seq > last_seen)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

/// Frames deliverable to the currently attached connection.
#[derive(Debug)]
pub enum OutboundFrame {
    Event(ReplayEvent),
    Pong,
}

/// One logical downstream session: a replay log plus, while a client is
/// connected, a channel to the live connection.
pub struct Session {
    id: String,
    log: ReplayLog,
    conn: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    detached_at: Mutex<Option<Instant>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            log: ReplayLog::new(),
            conn: Mutex::new(None),
            detached_at: Mutex::new(Some(Instant::now())),
            pump: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log(&self) -> &ReplayLog {
        &self.log
    }

    /// Record an outbound event and deliver it to the attached connection,
    /// if any. Append order is the delivery order: both happen under the
    /// connection lock, so a concurrent attach can neither miss nor double
    /// up an event.
    pub async fn emit(&self, message: JsonRpcMessage) -> ReplayEvent {
        let conn = self.conn.lock().await;
        let event = self.log.append(message).await;
        if let Some(tx) = conn.as_ref() {
            let _ = tx.send(OutboundFrame::Event(event.clone()));
        }
        event
    }

    /// Answer a transport-level keepalive; not logged, not replayed.
    pub async fn pong(&self) {
        if let Some(tx) = self.conn.lock().await.as_ref() {
            let _ = tx.send(OutboundFrame::Pong);
        }
    }

    /// Attach a connection, returning the backlog of events after
    /// `last_seen`. The backlog snapshot and the sender installation are
    /// atomic with respect to `emit`.
    pub async fn attach(
        &self,
        last_seen: u64,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Vec<ReplayEvent> {
        let mut conn = self.conn.lock().await;
        let backlog = self.log.events_after(last_seen).await;
        *conn = Some(tx);
        *self.detached_at.lock().await = None;
        backlog
    }

    /// Detach the current connection; the session stays resumable until the
    /// store reaps it.
    pub async fn detach(&self) {
        *self.conn.lock().await = None;
        *self.detached_at.lock().await = Some(Instant::now());
    }

    pub async fn is_attached(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Register the task forwarding upstream notifications into this session.
    pub async fn set_pump(&self, handle: JoinHandle<()>) {
        *self.pump.lock().await = Some(handle);
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
        *self.conn.lock().await = None;
    }

    async fn idle_longer_than(&self, retention: Duration) -> bool {
        match *self.detached_at.lock().await {
            Some(since) => since.elapsed() > retention,
            None => false,
        }
    }
}

/// Registry of live sessions.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    retention: Duration,
}

impl SessionStore {
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            retention,
        })
    }

    /// Allocate a fresh session with a new id.
    pub async fn create(&self) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.sessions
            .lock()
            .await
            .insert(id.clone(), Arc::clone(&session));
        debug!("Session created: {}", id);
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) {
        if let Some(session) = self.sessions.lock().await.remove(id) {
            session.shutdown().await;
            debug!("Session removed: {}", id);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drop every session; used when the listener closes.
    pub async fn clear(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown().await;
        }
    }

    /// Discard sessions that have been detached longer than the retention
    /// window. Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let candidates: Vec<String> = {
            let sessions = self.sessions.lock().await;
            let mut ids = Vec::new();
            for (id, session) in sessions.iter() {
                if session.idle_longer_than(self.retention).await {
                    ids.push(id.clone());
                }
            }
            ids
        };

        for id in &candidates {
            info!("Reaping idle session: {}", id);
            self.remove(id).await;
        }
        candidates.len()
    }

    /// Periodically reap idle sessions until aborted.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = store.retention.max(Duration::from_secs(1)) / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                store.reap_idle().await;
            }
        })
    }
}
