//! End-to-end tests against a real mock tool-server subprocess.
//!
//! The connection handler is generic over its transport halves, so these
//! tests drive it with in-memory channels in place of a live WebSocket and
//! assert on the exact frames a client would see.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::time::timeout;

use mcpcache::proxy::notification_pump;
use mcpcache::server::{run_connection, SessionHandshake};
use mcpcache::session::{Session, SessionStore};
use mcpcache::{CallCache, ProxyConfig, ProxyRelay, ProxyServer, UpstreamClient, UpstreamConfig};

async fn connect_upstream() -> Arc<UpstreamClient> {
    let mut config = UpstreamConfig::new(env!("CARGO_BIN_EXE_mock_tool_server"), "test-key");
    config.request_timeout = Duration::from_secs(10);
    Arc::new(
        UpstreamClient::connect(config)
            .await
            .expect("mock upstream should start"),
    )
}

struct Harness {
    upstream: Arc<UpstreamClient>,
    relay: ProxyRelay,
    store: Arc<SessionStore>,
}

impl Harness {
    async fn new() -> Self {
        let upstream = connect_upstream().await;
        let relay = ProxyRelay::new(Arc::clone(&upstream), Arc::new(CallCache::new()));
        let store = SessionStore::new(Duration::from_secs(60));
        Self {
            upstream,
            relay,
            store,
        }
    }

    async fn session(&self) -> Arc<Session> {
        let session = self.store.create().await;
        let pump = tokio::spawn(notification_pump(
            self.upstream.subscribe(),
            Arc::clone(&session),
        ));
        session.set_pump(pump).await;
        session
    }
}

struct TestClient {
    to_server: futures_mpsc::UnboundedSender<Result<Message, axum::Error>>,
    from_server: futures_mpsc::UnboundedReceiver<Message>,
    task: tokio::task::JoinHandle<()>,
}

impl TestClient {
    async fn connect(session: Arc<Session>, relay: ProxyRelay, last_seq: u64) -> Self {
        let (to_server, inbound) = futures_mpsc::unbounded();
        let (outbound, from_server) = futures_mpsc::unbounded::<Message>();
        let task = tokio::spawn(run_connection(outbound, inbound, session, relay, last_seq));
        Self {
            to_server,
            from_server,
            task,
        }
    }

    fn send_text(&self, text: &str) {
        self.to_server
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .expect("connection should accept frames");
    }

    fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    async fn next_text(&mut self) -> String {
        let message = timeout(Duration::from_secs(5), self.from_server.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended unexpectedly");
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    async fn handshake(&mut self) -> String {
        let text = self.next_text().await;
        let handshake: SessionHandshake =
            serde_json::from_str(&text).expect("first frame should be the session handshake");
        handshake.session
    }

    async fn next_event(&mut self) -> Value {
        let text = self.next_text().await;
        serde_json::from_str(&text).expect("event frames should be JSON")
    }

    async fn expect_silence(&mut self) {
        let outcome = timeout(Duration::from_millis(200), self.from_server.next()).await;
        assert!(outcome.is_err(), "expected no further frames");
    }

    /// Simulate the peer going away and wait for the connection to wind down.
    async fn disconnect(self) {
        drop(self.to_server);
        let _ = self.task.await;
    }
}

fn initialize_request(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "0.0.0" },
        },
    })
}

fn echo_request(id: u64, n: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": "echo", "arguments": { "n": n } },
    })
}

#[tokio::test]
async fn initialize_advertises_upstream_identity() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_json(initialize_request(1));
    let event = client.next_event().await;

    assert_eq!(event["seq"], 1);
    let result = &event["message"]["result"];
    assert_eq!(result["serverInfo"]["name"], "mock-tool-server");
    assert_eq!(result["serverInfo"]["version"], "1.2.3");
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert!(result["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn repeated_tool_call_hits_cache_not_upstream() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_json(echo_request(1, 3));
    let first = client.next_event().await;
    assert_eq!(first["message"]["result"]["content"][0]["text"], "6");
    assert_eq!(first["message"]["result"]["invocation"], 1);

    client.send_json(echo_request(2, 3));
    let second = client.next_event().await;

    // Identical payload, including the upstream invocation counter: the
    // backing process was only called once.
    assert_eq!(second["message"]["result"], first["message"]["result"]);
    assert_eq!(second["message"]["id"], 2);
}

#[tokio::test]
async fn argument_order_does_not_defeat_the_cache() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_text(
        r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"n":5,"tag":"x"}}}"#,
    );
    let first = client.next_event().await;

    client.send_text(
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"tag":"x","n":5}}}"#,
    );
    let second = client.next_event().await;

    assert_eq!(first["message"]["result"]["invocation"], 1);
    assert_eq!(second["message"]["result"], first["message"]["result"]);
}

#[tokio::test]
async fn upstream_failures_surface_and_are_not_cached() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    let fail_request = |id: u64| {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": "fail", "arguments": {} },
        })
    };

    client.send_json(fail_request(1));
    let first = client.next_event().await;
    let first_error = &first["message"]["error"];
    assert_eq!(first_error["code"], -32000);
    assert!(first_error["message"]
        .as_str()
        .unwrap()
        .contains("intentional failure (call 1)"));

    // The failed key was never populated: the second call reaches upstream
    // again and sees a fresh invocation counter.
    client.send_json(fail_request(2));
    let second = client.next_event().await;
    assert!(second["message"]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("intentional failure (call 2)"));
}

#[tokio::test]
async fn non_tool_requests_are_relayed_verbatim() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_json(json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }));
    let event = client.next_event().await;
    assert_eq!(event["message"]["result"]["tools"][0]["name"], "echo");

    // A method the backing process does not implement comes back as its
    // error, routed to the originating request id.
    client.send_json(json!({ "jsonrpc": "2.0", "id": 2, "method": "resources/list" }));
    let event = client.next_event().await;
    assert_eq!(event["message"]["id"], 2);
    assert_eq!(event["message"]["error"]["code"], -32601);
}

#[tokio::test]
async fn upstream_notifications_reach_the_session() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": { "name": "notify", "arguments": {} },
    }));

    // The notification and the response race; collect both.
    let first = client.next_event().await;
    let second = client.next_event().await;

    let mut methods = Vec::new();
    for event in [&first, &second] {
        if let Some(method) = event["message"]["method"].as_str() {
            methods.push(method.to_string());
        }
    }
    assert_eq!(methods, vec!["notifications/message".to_string()]);

    let response = if first["message"]["method"].is_string() {
        &second
    } else {
        &first
    };
    assert_eq!(response["message"]["id"], 1);

    // Both events were logged with distinct, contiguous sequence ids
    let mut seqs = vec![
        first["seq"].as_u64().unwrap(),
        second["seq"].as_u64().unwrap(),
    ];
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);
}

#[tokio::test]
async fn reconnect_replays_only_missed_events() {
    let harness = Harness::new().await;
    let session = harness.session().await;

    let mut client = TestClient::connect(Arc::clone(&session), harness.relay.clone(), 0).await;
    let session_id = client.handshake().await;
    assert_eq!(session_id, session.id());

    client.send_json(initialize_request(1));
    client.next_event().await; // seq 1
    client.send_json(echo_request(2, 3));
    client.next_event().await; // seq 2
    client.send_json(echo_request(3, 4));
    client.next_event().await; // seq 3
    client.disconnect().await;

    // Resume having acknowledged seq 1: exactly seq 2 and 3 come back, in
    // order, with no duplicates and nothing else.
    let mut resumed = TestClient::connect(Arc::clone(&session), harness.relay.clone(), 1).await;
    assert_eq!(resumed.handshake().await, session.id());

    let replayed = resumed.next_event().await;
    assert_eq!(replayed["seq"], 2);
    assert_eq!(replayed["message"]["result"]["content"][0]["text"], "6");

    let replayed = resumed.next_event().await;
    assert_eq!(replayed["seq"], 3);
    assert_eq!(replayed["message"]["result"]["content"][0]["text"], "8");

    resumed.expect_silence().await;
    resumed.disconnect().await;

    // Resume fully caught up: nothing to replay.
    let mut caught_up = TestClient::connect(session, harness.relay.clone(), 3).await;
    caught_up.handshake().await;
    caught_up.expect_silence().await;
}

#[tokio::test]
async fn live_delivery_resumes_after_replay() {
    let harness = Harness::new().await;
    let session = harness.session().await;

    let mut client = TestClient::connect(Arc::clone(&session), harness.relay.clone(), 0).await;
    client.handshake().await;
    client.send_json(echo_request(1, 1));
    client.next_event().await; // seq 1
    client.disconnect().await;

    let mut resumed = TestClient::connect(session, harness.relay.clone(), 0).await;
    resumed.handshake().await;
    let replayed = resumed.next_event().await;
    assert_eq!(replayed["seq"], 1);

    // New traffic on the resumed connection continues the sequence.
    resumed.send_json(echo_request(2, 10));
    let live = resumed.next_event().await;
    assert_eq!(live["seq"], 2);
    assert_eq!(live["message"]["result"]["content"][0]["text"], "20");
}

#[tokio::test]
async fn ping_is_answered_without_touching_the_log() {
    let harness = Harness::new().await;
    let session = harness.session().await;
    let mut client = TestClient::connect(Arc::clone(&session), harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_text("ping");
    assert_eq!(client.next_text().await, "pong");
    assert_eq!(session.log().len().await, 0);
}

#[tokio::test]
async fn malformed_frames_get_a_parse_error() {
    let harness = Harness::new().await;
    let mut client =
        TestClient::connect(harness.session().await, harness.relay.clone(), 0).await;
    client.handshake().await;

    client.send_text("{not json");
    let event = client.next_event().await;
    assert_eq!(event["message"]["error"]["code"], -32700);
}

#[tokio::test]
async fn listener_binds_and_closes() {
    let upstream = connect_upstream().await;
    let config = ProxyConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        session_retention: Duration::from_secs(60),
    };

    let server = ProxyServer::bind(&config, upstream, Arc::new(CallCache::new()))
        .await
        .expect("listener should bind");
    assert_ne!(server.local_addr().port(), 0);

    server.close().await;
}
