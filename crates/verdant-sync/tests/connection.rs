//! Connection lifecycle tests over an in-memory transport.
//!
//! The test plays the server: every connect attempt hands a [`ServerSession`]
//! to the test, which reads the client's frames and pushes its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use verdant_sync::{
    ConnectionManager, ConnectionState, Credentials, EventDispatcher, Inbound,
    SubscriptionRegistry, SyncClient, SyncConfig, SyncError, Topic, Transport,
    TransportConnection,
};

const WAIT: Duration = Duration::from_secs(3);

// =============================================================================
// In-memory transport
// =============================================================================

/// Server side of one connection.
struct ServerSession {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Inbound>,
}

impl ServerSession {
    /// Next frame the client sent, as JSON.
    async fn expect(&mut self) -> Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client closed the connection");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    async fn expect_type(&mut self) -> String {
        self.expect().await["type"]
            .as_str()
            .expect("frame without type")
            .to_string()
    }

    /// Read the auth frame and accept it.
    async fn accept(&mut self) -> Value {
        let auth = self.expect().await;
        assert_eq!(auth["type"], "auth");
        self.send(json!({"type": "auth:ok"}));
        auth
    }

    fn send(&self, frame: Value) {
        let _ = self.to_client.send(Inbound::Text(frame.to_string()));
    }

    /// A WebSocket ping with no sync payload.
    fn heartbeat(&self) {
        let _ = self.to_client.send(Inbound::Heartbeat);
    }

    fn push(&self, kind: &str, payload: Value, ts: u64) {
        self.send(json!({"type": kind, "payload": payload, "serverTimestamp": ts}));
    }
}

struct MemoryConnection {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<Inbound>,
    pings: Arc<AtomicU32>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.outgoing
            .send(text)
            .map_err(|_| SyncError::WebSocket("server went away".to_string()))
    }

    async fn recv(&mut self) -> Result<Inbound, SyncError> {
        Ok(self.incoming.recv().await.unwrap_or(Inbound::Closed))
    }

    async fn ping(&mut self) -> Result<(), SyncError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryTransport {
    sessions: mpsc::UnboundedSender<ServerSession>,
    refuse_next: AtomicU32,
    attempts: AtomicU32,
    pings: Arc<AtomicU32>,
}

impl MemoryTransport {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSession>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sessions,
            refuse_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            pings: Arc::new(AtomicU32::new(0)),
        });
        (transport, rx)
    }

    fn refuse(&self, attempts: u32) {
        self.refuse_next.store(attempts, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _url: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn TransportConnection>, SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SyncError::WebSocket("connection refused".to_string()));
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        self.sessions
            .send(ServerSession {
                from_client: client_rx,
                to_client: server_tx,
            })
            .map_err(|_| SyncError::WebSocket("test server gone".to_string()))?;

        Ok(Box::new(MemoryConnection {
            outgoing: client_tx,
            incoming: server_rx,
            pings: Arc::clone(&self.pings),
        }))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> SyncConfig {
    SyncConfig::builder()
        .connect_timeout(Duration::from_millis(200))
        .handshake_timeout(Duration::from_millis(200))
        .idle_timeout(Duration::from_millis(400))
        .backoff(Duration::from_millis(10), Duration::from_millis(40))
        .backoff_jitter(0.0)
        .alert_after(3)
        .build()
}

fn credentials() -> Credentials {
    Credentials::new("u1", "secret-token")
}

fn manager(
    config: SyncConfig,
    transport: Arc<MemoryTransport>,
) -> (ConnectionManager, Arc<SubscriptionRegistry>) {
    let registry = Arc::new(SubscriptionRegistry::new());
    let manager = ConnectionManager::with_transport(
        config,
        transport,
        EventDispatcher::new(),
        Arc::clone(&registry),
    );
    (manager, registry)
}

async fn next_session(sessions: &mut mpsc::UnboundedReceiver<ServerSession>) -> ServerSession {
    timeout(WAIT, sessions.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("transport dropped")
}

async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
    let mut state = manager.state();
    timeout(WAIT, state.wait_for(|s| *s == wanted))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_auth_precedes_subscription_replay() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, registry) = manager(fast_config(), transport);
    registry.subscribe(Topic::Plant("p1".to_string()), Some(json!({"history": true})));
    registry.subscribe(Topic::CareTasks, None);

    assert!(manager.connect(credentials()));
    let mut server = next_session(&mut sessions).await;

    let auth = server.accept().await;
    assert_eq!(auth["userId"], "u1");
    assert_eq!(auth["token"], "secret-token");
    manager.wait_ready(WAIT).await.unwrap();

    assert_eq!(server.expect_type().await, "subscribe:care-tasks");
    let plant = server.expect().await;
    assert_eq!(plant["type"], "subscribe:plant:p1");
    assert_eq!(plant["params"]["history"], true);

    // Live subscriptions go out immediately.
    registry.subscribe(Topic::Weather("nyc".to_string()), None);
    assert_eq!(server.expect_type().await, "subscribe:weather:nyc");
    registry.unsubscribe(&Topic::CareTasks);
    assert_eq!(server.expect_type().await, "unsubscribe:care-tasks");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_replays_exact_topic_set() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, registry) = manager(fast_config(), transport);
    registry.subscribe(Topic::CareTasks, None);
    registry.subscribe(Topic::Community, None);

    manager.connect(credentials());
    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    assert_eq!(server.expect_type().await, "subscribe:care-tasks");
    assert_eq!(server.expect_type().await, "subscribe:community");

    registry.unsubscribe(&Topic::Community);
    assert_eq!(server.expect_type().await, "unsubscribe:community");
    registry.subscribe(Topic::User("u1".to_string()), None);
    assert_eq!(server.expect_type().await, "subscribe:user:u1");

    // Server drops the connection.
    drop(server);

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    let mut replayed = vec![server.expect_type().await, server.expect_type().await];
    replayed.sort();
    assert_eq!(replayed, vec!["subscribe:care-tasks", "subscribe:user:u1"]);

    manager.wait_ready(WAIT).await.unwrap();
    let status = manager.status();
    assert_eq!(status.epoch, 2);
    assert_eq!(status.retry_count, 0);

    // Nothing beyond the wanted set was replayed.
    assert!(
        timeout(Duration::from_millis(100), server.from_client.recv())
            .await
            .is_err()
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_auth_error_is_retried() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, _registry) = manager(fast_config(), transport);
    manager.connect(credentials());

    let mut rejected = next_session(&mut sessions).await;
    assert_eq!(rejected.expect_type().await, "auth");
    rejected.send(json!({"type": "auth:error", "payload": {"message": "token expired"}}));

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();

    let status = manager.status();
    assert_eq!(status.epoch, 1);
    assert_eq!(status.last_error, None);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_alert_raised_after_threshold_and_cleared_on_success() {
    let (transport, mut sessions) = MemoryTransport::new();
    transport.refuse(4);
    let (manager, _registry) = manager(fast_config(), Arc::clone(&transport));
    let mut alert = manager.alert();

    manager.connect(credentials());
    timeout(WAIT, alert.wait_for(|raised| *raised))
        .await
        .expect("alert was never raised")
        .unwrap();
    assert!(manager.status().retry_count >= 3);
    assert!(!manager.is_connected());

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    timeout(WAIT, alert.wait_for(|raised| !*raised))
        .await
        .expect("alert was never cleared")
        .unwrap();
    manager.wait_ready(WAIT).await.unwrap();
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 5);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_second_connect_is_noop() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, _registry) = manager(fast_config(), Arc::clone(&transport));

    assert!(manager.connect(credentials()));
    assert!(!manager.connect(credentials()));

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();
    assert!(!manager.connect(credentials()));

    assert!(
        timeout(Duration::from_millis(100), sessions.recv())
            .await
            .is_err()
    );
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_reconnecting() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, registry) = manager(fast_config(), Arc::clone(&transport));
    manager.connect(credentials());

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();

    manager.shutdown().await;
    assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    assert!(!manager.is_connected());
    assert!(!registry.is_attached());

    // The client side of the connection is gone and nobody reconnects.
    assert!(
        timeout(WAIT, server.from_client.recv())
            .await
            .unwrap()
            .is_none()
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);

    // A fresh connect starts a new loop.
    assert!(manager.connect(credentials()));
    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_is_replaced() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, _registry) = manager(fast_config(), transport);
    manager.connect(credentials());

    let mut silent = next_session(&mut sessions).await;
    silent.accept().await;
    manager.wait_ready(WAIT).await.unwrap();

    // No frames for longer than the idle timeout.
    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();
    assert_eq!(manager.status().epoch, 2);
    drop(silent);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_heartbeats_keep_quiet_connection_alive() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, _registry) = manager(fast_config(), Arc::clone(&transport));
    manager.connect(credentials());

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();

    // Only pings for well over twice the idle timeout.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.heartbeat();
    }

    assert_eq!(manager.current_state(), ConnectionState::Ready);
    assert_eq!(manager.status().epoch, 1);
    assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_quiet_connection_sends_keepalive_pings() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, _registry) = manager(fast_config(), Arc::clone(&transport));
    manager.connect(credentials());

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();
    assert_eq!(transport.pings.load(Ordering::SeqCst), 0);

    // Keepalive runs at half the 400ms idle timeout.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(transport.pings.load(Ordering::SeqCst) >= 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout_is_retried() {
    let (transport, mut sessions) = MemoryTransport::new();
    let (manager, _registry) = manager(fast_config(), transport);
    manager.connect(credentials());

    let mut mute = next_session(&mut sessions).await;
    assert_eq!(mute.expect_type().await, "auth");
    wait_for_state(&manager, ConnectionState::Reconnecting).await;
    assert!(
        manager
            .status()
            .last_error
            .is_some_and(|e| e.contains("auth reply"))
    );

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    manager.wait_ready(WAIT).await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_events_flow_into_client_caches() {
    let (transport, mut sessions) = MemoryTransport::new();
    let client = SyncClient::with_transport(fast_config(), credentials(), transport).unwrap();
    let mut changes = client.tasks().subscribe();

    let mut scope = client.scope();
    scope.subscribe(Topic::CareTasks, None);
    client.connect();

    let mut server = next_session(&mut sessions).await;
    server.accept().await;
    assert_eq!(server.expect_type().await, "subscribe:care-tasks");
    client.wait_ready(WAIT).await.unwrap();

    let task = json!({
        "id": "t1",
        "plantId": "p1",
        "kind": "water",
        "title": "Water the fern",
        "dueDate": "2026-05-14T08:00:00Z"
    });
    server.push("task:created", task.clone(), 3);
    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.id, "t1");

    // An older update is discarded.
    let mut older = task.clone();
    older["title"] = json!("stale title");
    server.push("task:updated", older, 2);
    let mut completed = task;
    completed["completed"] = json!(true);
    server.push("task:completed", completed, 4);
    timeout(WAIT, changes.recv()).await.unwrap().unwrap();

    let cached = client.tasks().get("t1").unwrap();
    assert_eq!(cached.title, "Water the fern");
    assert!(cached.completed);
    assert_eq!(client.stats().tasks.completed, 1);

    scope.close();
    assert_eq!(server.expect_type().await, "unsubscribe:care-tasks");
    client.shutdown().await;
}

#[tokio::test]
async fn test_wait_ready_reports_timeout() {
    let (transport, _sessions) = MemoryTransport::new();
    transport.refuse(u32::MAX);
    let (manager, _registry) = manager(fast_config(), transport);
    manager.connect(credentials());

    let result = manager.wait_ready(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(SyncError::Timeout(_))));
    manager.shutdown().await;
}
