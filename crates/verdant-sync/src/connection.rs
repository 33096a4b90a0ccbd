//! Push channel connection manager.
//!
//! Owns the single transport connection of a client session. A spawned loop
//! connects, authenticates, pumps frames into the [`EventDispatcher`] and
//! control messages out of the [`SubscriptionRegistry`], and reconnects with
//! exponential backoff whenever any phase fails. Each successful handshake
//! starts a new epoch; the registry is attached to the epoch's outbox and
//! replays every wanted topic.
//!
//! Transport failures are never returned to callers. They surface through
//! the `state`, `connected` and `alert` observables.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::dispatch::EventDispatcher;
use crate::error::SyncError;
use crate::protocol::{ClientMessage, ServerFrame};
use crate::registry::SubscriptionRegistry;
use crate::types::Credentials;

// =============================================================================
// Transport
// =============================================================================

/// Opens connections to the push server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`, presenting `credentials` to the server.
    async fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn TransportConnection>, SyncError>;
}

/// What a connection produced on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A JSON text frame.
    Text(String),
    /// Transport-level liveness traffic (ping, pong) with no payload for the
    /// sync layer. Resets the idle timer.
    Heartbeat,
    /// The peer closed the connection.
    Closed,
}

/// One open connection carrying JSON text frames.
#[async_trait]
pub trait TransportConnection: Send {
    /// Send one text frame.
    async fn send(&mut self, text: String) -> Result<(), SyncError>;

    /// Receive the next frame or heartbeat.
    ///
    /// Must be cancel-safe: the connection loop races it against outgoing
    /// control messages and shutdown.
    async fn recv(&mut self) -> Result<Inbound, SyncError>;

    /// Send a transport-level ping. Sent periodically while the connection
    /// is quiet so that a healthy peer answers before the idle timeout.
    async fn ping(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    /// Close the connection. Errors are ignored by the caller.
    async fn close(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

/// WebSocket transport. The bearer token is sent as an `Authorization`
/// header on the upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn TransportConnection>, SyncError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SyncError::WebSocket(format!("invalid url: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credentials.token))
            .map_err(|_| SyncError::Auth("token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| SyncError::WebSocket(format!("connection failed: {}", e)))?;

        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SyncError::WebSocket(format!("write error: {}", e)))
    }

    async fn recv(&mut self) -> Result<Inbound, SyncError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Inbound::Text(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "server closed connection");
                    return Ok(Inbound::Closed);
                }
                // tungstenite queues the pong reply itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    return Ok(Inbound::Heartbeat);
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(len = data.len(), "ignoring binary frame");
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => return Err(SyncError::WebSocket(format!("read error: {}", e))),
                None => return Ok(Inbound::Closed),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), SyncError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| SyncError::WebSocket(format!("ping error: {}", e)))
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::WebSocket(format!("close error: {}", e)))
    }
}

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection loop is running.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Transport open, waiting for `auth:ok`.
    Authenticating,
    /// Authenticated; events flow and subscriptions are live.
    Ready,
    /// The last attempt failed or the connection was lost; retrying.
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connection for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Number of epochs that reached `Ready`.
    pub epoch: u64,
    /// Consecutive failed attempts since the last `Ready`.
    pub retry_count: u32,
    /// Wall-clock time the current or last epoch became ready.
    pub last_connected: Option<DateTime<Utc>>,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Whether the persistent disconnected alert is raised.
    pub alert: bool,
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    connected_tx: watch::Sender<bool>,
    alert_tx: watch::Sender<bool>,
    status: Mutex<ConnectionStatus>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            connected_tx: watch::Sender::new(false),
            alert_tx: watch::Sender::new(false),
            status: Mutex::new(ConnectionStatus::default()),
        }
    }

    fn status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.status().state = state;
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
        self.connected_tx.send_if_modified(|connected| {
            let now = state == ConnectionState::Ready;
            let changed = *connected != now;
            *connected = now;
            changed
        });
    }

    fn set_alert(&self, raised: bool) {
        self.status().alert = raised;
        self.alert_tx.send_if_modified(|alert| {
            let changed = *alert != raised;
            *alert = raised;
            changed
        });
    }
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

// =============================================================================
// Manager
// =============================================================================

/// Owner of the push channel connection.
pub struct ConnectionManager {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    registry: Arc<SubscriptionRegistry>,
    shared: Arc<Shared>,
    running: Mutex<Option<RunningLoop>>,
}

impl ConnectionManager {
    /// Create a manager using the WebSocket transport.
    pub fn new(
        config: SyncConfig,
        dispatcher: EventDispatcher,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport), dispatcher, registry)
    }

    /// Create a manager with a custom transport.
    pub fn with_transport(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        dispatcher: EventDispatcher,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            config,
            transport,
            dispatcher,
            registry,
            shared: Arc::new(Shared::new()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningLoop>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the connection loop.
    ///
    /// No-op, returning false, while a loop is already running. Must be
    /// called from within a tokio runtime.
    pub fn connect(&self, credentials: Credentials) -> bool {
        let mut running = self.running();
        if let Some(current) = running.as_ref()
            && !current.handle.is_finished()
        {
            debug!(state = %self.current_state(), "connect ignored, connection loop already running");
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let conn_loop = ConnectionLoop {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            dispatcher: self.dispatcher.clone(),
            registry: Arc::clone(&self.registry),
            shared: Arc::clone(&self.shared),
            credentials,
        };

        self.shared.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(conn_loop.run(shutdown_rx));
        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Tear down the connection and stop reconnecting.
    pub async fn shutdown(&self) {
        let running = self.running().take();
        if let Some(running) = running {
            running.shutdown_tx.send_replace(true);
            if let Err(e) = running.handle.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
        self.registry.detach();
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.set_alert(false);
    }

    /// Wait until the connection is ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SyncError> {
        let mut connected = self.shared.connected_tx.subscribe();
        match tokio::time::timeout(timeout, connected.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => Err(SyncError::Timeout(format!(
                "connection not ready after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Observe whether the connection is ready.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.connected_tx.subscribe()
    }

    /// Observe lifecycle state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Observe the persistent disconnected alert.
    pub fn alert(&self) -> watch::Receiver<bool> {
        self.shared.alert_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status().clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.shutdown_tx.send_replace(true);
        }
    }
}

// =============================================================================
// Loop
// =============================================================================

struct ConnectionLoop {
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    registry: Arc<SubscriptionRegistry>,
    shared: Arc<Shared>,
    credentials: Credentials,
}

/// Resolves once shutdown is requested or the manager is gone.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

impl ConnectionLoop {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = self.config.backoff();
        let mut failures: u32 = 0;

        info!(url = %self.config.ws_url, user = %self.credentials.user_id, "starting connection loop");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.run_epoch(&mut shutdown_rx, &mut backoff, &mut failures).await {
                Ok(()) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let alerted = self.record_failure(&e, failures);
                    if alerted {
                        backoff.current_interval = backoff.max_interval;
                    }

                    let wait = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        error = %e,
                        transient = e.is_transient(),
                        attempt = failures,
                        retry_in_ms = wait.as_millis() as u64,
                        "connection attempt failed, retrying"
                    );
                    self.shared.set_state(ConnectionState::Reconnecting);

                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown_rx) => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        self.registry.detach();
        self.shared.set_state(ConnectionState::Disconnected);
        info!("connection loop stopped");
    }

    /// Record a failed attempt. Returns whether the alert is raised.
    fn record_failure(&self, e: &SyncError, failures: u32) -> bool {
        {
            let mut status = self.shared.status();
            status.retry_count = failures;
            status.last_error = Some(e.to_string());
        }

        let threshold = self.config.alert_after_attempts;
        if failures >= threshold {
            if failures == threshold {
                error!(
                    attempts = failures,
                    error = %e,
                    "push channel unavailable, still retrying at max interval"
                );
            }
            self.shared.set_alert(true);
            return true;
        }
        false
    }

    /// Run one epoch: connect, authenticate, pump until failure.
    ///
    /// `Ok(())` means shutdown was requested.
    async fn run_epoch(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
        failures: &mut u32,
    ) -> Result<(), SyncError> {
        let connect = tokio::time::timeout(
            self.config.connect_timeout(),
            self.transport.connect(&self.config.ws_url, &self.credentials),
        );
        let mut conn = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown_rx) => return Ok(()),
            result = connect => result.map_err(|_| {
                SyncError::Timeout(format!(
                    "connect did not complete within {}ms",
                    self.config.connect_timeout_ms
                ))
            })??,
        };

        self.shared.set_state(ConnectionState::Authenticating);
        if !self.authenticate(&mut *conn, shutdown_rx).await? {
            let _ = conn.close().await;
            return Ok(());
        }

        // Ready: attach before announcing so subscriptions are queued first.
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        let replayed = self.registry.attach(outbox_tx);
        let epoch = {
            let mut status = self.shared.status();
            status.epoch += 1;
            status.retry_count = 0;
            status.last_error = None;
            status.last_connected = Some(Utc::now());
            status.epoch
        };
        backoff.reset();
        *failures = 0;
        self.shared.set_alert(false);
        self.shared.set_state(ConnectionState::Ready);
        info!(epoch, replayed, "push channel ready");

        let result = self.pump(&mut *conn, &mut outbox_rx, shutdown_rx).await;
        self.registry.detach();

        match &result {
            Ok(()) => {
                let _ = conn.close().await;
            }
            Err(e) => info!(epoch, error = %e, "push channel lost"),
        }
        result
    }

    /// Send the identity handshake and wait for the verdict.
    ///
    /// Returns `Ok(false)` if shutdown was requested meanwhile.
    async fn authenticate(
        &self,
        conn: &mut dyn TransportConnection,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<bool, SyncError> {
        let auth = ClientMessage::Auth {
            user_id: self.credentials.user_id.clone(),
            token: self.credentials.token.clone(),
        };
        conn.send(auth.to_frame()?).await?;

        let timeout = self.config.handshake_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown_rx) => return Ok(false),
                _ = &mut deadline => {
                    return Err(SyncError::Handshake(format!(
                        "no auth reply within {}ms",
                        timeout.as_millis()
                    )));
                }
                inbound = conn.recv() => {
                    let text = match inbound? {
                        Inbound::Text(text) => text,
                        Inbound::Heartbeat => continue,
                        Inbound::Closed => {
                            return Err(SyncError::Handshake(
                                "connection closed during handshake".to_string(),
                            ));
                        }
                    };
                    match ServerFrame::parse(&text) {
                        Ok(ServerFrame::AuthOk) => return Ok(true),
                        Ok(ServerFrame::AuthError { message }) => {
                            return Err(SyncError::Auth(message));
                        }
                        Ok(ServerFrame::Event(event)) => {
                            debug!(tag = %event.tag(), "ignoring event received before auth:ok");
                        }
                        Err(e) => warn!(error = %e, "unreadable frame during handshake"),
                    }
                }
            }
        }
    }

    /// Move frames in both directions until the connection fails or
    /// shutdown is requested.
    ///
    /// Anything read from the peer, heartbeats included, resets the idle
    /// deadline. A keepalive ping goes out every half idle period.
    async fn pump(
        &self,
        conn: &mut dyn TransportConnection,
        outbox_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let idle = self.config.idle_timeout();
        let deadline = tokio::time::sleep(idle);
        tokio::pin!(deadline);

        let period = (idle / 2).max(Duration::from_millis(1));
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(shutdown_rx) => {
                    info!("push channel received shutdown signal");
                    return Ok(());
                }

                Some(msg) = outbox_rx.recv() => {
                    trace!(topic = ?msg.topic(), "sending control message");
                    conn.send(msg.to_frame()?).await?;
                }

                inbound = conn.recv() => {
                    match inbound? {
                        Inbound::Text(text) => {
                            self.dispatcher.dispatch_text(&text);
                        }
                        Inbound::Heartbeat => trace!("heartbeat"),
                        Inbound::Closed => {
                            return Err(SyncError::WebSocket(
                                "connection closed by server".to_string(),
                            ));
                        }
                    }
                    deadline.as_mut().reset(Instant::now() + idle);
                }

                _ = &mut deadline => {
                    warn!(idle_ms = idle.as_millis() as u64, "push channel idle, treating as lost");
                    return Err(SyncError::Timeout(format!(
                        "no frames for {}ms",
                        idle.as_millis()
                    )));
                }

                _ = keepalive.tick() => {
                    trace!("sending keepalive ping");
                    conn.ping().await?;
                }
            }
        }
    }
}
