//! Connection Manager
//!
//! Owns one WebSocket session at a time. `connect` races the handshake
//! against a deadline and the caller's cancellation; once open, a dedicated
//! I/O task writes queued outbound frames, answers pings, drives the
//! heartbeat and forwards inbound text frames, in arrival order, to the
//! event channel. When the session ends the task records why, cancels the
//! session's closed signal and emits a single terminal event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use crate::application::ports::{FrameSink, SinkError};
use crate::domain::streaming::ErrorKind;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `disconnect` waits for the I/O task to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Errors and Events
// =============================================================================

/// Failure to open a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The handshake did not complete before the deadline.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Socket, TLS or handshake failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller cancelled.
    #[error("connect cancelled")]
    Cancelled,

    /// A session is already open or opening.
    #[error("already connected")]
    AlreadyConnected,
}

impl ConnectError {
    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::AlreadyConnected => ErrorKind::State,
        }
    }
}

/// Output of the I/O task, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Inbound text frame.
    Frame(String),
    /// The session closed cleanly.
    Closed {
        /// Close reason.
        reason: String,
    },
    /// The session failed.
    Faulted {
        /// Failure description.
        error: String,
    },
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Session open.
    Open,
    /// Disconnect requested.
    Closing,
    /// Session closed.
    Closed,
    /// Session failed.
    Faulted,
}

impl ConnectionState {
    /// Label used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        }
    }
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Id of the current or most recent session.
    pub session_id: Option<Uuid>,
    /// Endpoint URL.
    pub url: String,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Most recent failure.
    pub last_error: Option<String>,
}

impl Connection {
    fn idle(url: String) -> Self {
        Self {
            session_id: None,
            url,
            state: ConnectionState::Idle,
            last_error: None,
        }
    }

    /// Apply a terminal transition if `session_id` is still current.
    fn finish(&mut self, session_id: Uuid, state: ConnectionState, error: Option<String>) {
        if self.session_id != Some(session_id) {
            return;
        }
        self.state = state;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Outbound frame queue depth.
    pub outbound_capacity: usize,
}

impl ConnectionConfig {
    /// Create a configuration with default heartbeat settings.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: HeartbeatConfig::default(),
            outbound_capacity: 256,
        }
    }
}

struct Session {
    id: Uuid,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// One WebSocket session at a time, with ordered inbound delivery.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connection: Arc<RwLock<Connection>>,
    session: Mutex<Option<Session>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a manager that forwards session output to `event_tx`.
    #[must_use]
    pub fn new(config: ConnectionConfig, event_tx: mpsc::Sender<ConnectionEvent>) -> Self {
        let connection = Arc::new(RwLock::new(Connection::idle(config.url.clone())));
        Self {
            config,
            connection,
            session: Mutex::new(None),
            event_tx,
        }
    }

    /// Open a session.
    ///
    /// Waits for the handshake, `timeout` or `cancel`, whichever comes
    /// first. A cancelled or timed-out attempt leaves the manager `Faulted`
    /// with no half-open socket.
    ///
    /// # Errors
    ///
    /// Returns an error if a session is already open, or the handshake fails,
    /// times out or is cancelled.
    pub async fn connect(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Uuid, ConnectError> {
        let session_id = Uuid::new_v4();
        {
            let mut connection = self.connection.write();
            if matches!(
                connection.state,
                ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing
            ) {
                return Err(ConnectError::AlreadyConnected);
            }
            connection.session_id = Some(session_id);
            connection.state = ConnectionState::Connecting;
            connection.last_error = None;
        }

        tracing::info!(url = %self.config.url, %session_id, "Connecting");

        let result = tokio::select! {
            () = cancel.cancelled() => Err(ConnectError::Cancelled),
            attempt = tokio::time::timeout(
                timeout,
                tokio_tungstenite::connect_async(self.config.url.as_str()),
            ) => match attempt {
                Err(_) => Err(ConnectError::Timeout(timeout)),
                Ok(Err(e)) => Err(ConnectError::Transport(e.to_string())),
                Ok(Ok((stream, _response))) => Ok(stream),
            },
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(url = %self.config.url, %session_id, error = %e, "Connect failed");
                self.connection.write().finish(
                    session_id,
                    ConnectionState::Faulted,
                    Some(e.to_string()),
                );
                return Err(e);
            }
        };

        self.start_session(session_id, stream);
        tracing::info!(url = %self.config.url, %session_id, "Connected");
        Ok(session_id)
    }

    fn start_session(&self, session_id: Uuid, stream: WsStream) {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let closed = CancellationToken::new();
        let shutdown = CancellationToken::new();

        let io = SessionIo {
            session_id,
            heartbeat: self.config.heartbeat,
            connection: Arc::clone(&self.connection),
            events: self.event_tx.clone(),
            closed: closed.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(io.run(stream, outbound_rx));

        *self.session.lock() = Some(Session {
            id: session_id,
            outbound: outbound_tx,
            closed,
            shutdown,
            task: Some(task),
        });
        // The task may already have ended the session.
        let mut connection = self.connection.write();
        if connection.session_id == Some(session_id) && connection.state == ConnectionState::Connecting
        {
            connection.state = ConnectionState::Open;
        }
    }

    /// Close the session. A no-op when nothing is open.
    pub async fn disconnect(&self) {
        let Some(mut session) = self.session.lock().take() else {
            return;
        };

        {
            let mut connection = self.connection.write();
            if connection.session_id == Some(session.id) && connection.state == ConnectionState::Open {
                connection.state = ConnectionState::Closing;
            }
        }

        tracing::info!(session_id = %session.id, "Disconnecting");
        session.shutdown.cancel();

        if let Some(task) = session.task.take()
            && tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err()
        {
            tracing::warn!(session_id = %session.id, "Session task did not stop in time");
        }

        // The task normally records the transition; cover the aborted case.
        let mut connection = self.connection.write();
        if connection.session_id == Some(session.id)
            && matches!(connection.state, ConnectionState::Open | ConnectionState::Closing)
        {
            connection.state = ConnectionState::Closed;
        }
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.connection.read().state == ConnectionState::Open
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.read().state
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn info(&self) -> Connection {
        self.connection.read().clone()
    }

    fn open_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Option<T> {
        if !self.is_open() {
            return None;
        }
        self.session.lock().as_ref().map(f)
    }
}

#[async_trait]
impl FrameSink for ConnectionManager {
    async fn send_text(&self, text: String) -> Result<(), SinkError> {
        let outbound = self
            .open_session(|session| session.outbound.clone())
            .ok_or(SinkError::NotConnected)?;
        outbound.send(text).await.map_err(|_| SinkError::Closed)
    }

    fn closed_signal(&self) -> Option<CancellationToken> {
        self.open_session(|session| session.closed.clone())
    }

    fn is_open(&self) -> bool {
        Self::is_open(self)
    }
}

// =============================================================================
// Session I/O Task
// =============================================================================

enum SessionEnd {
    Closed(String),
    Faulted(String),
}

struct SessionIo {
    session_id: Uuid,
    heartbeat: HeartbeatConfig,
    connection: Arc<RwLock<Connection>>,
    events: mpsc::Sender<ConnectionEvent>,
    closed: CancellationToken,
    shutdown: CancellationToken,
}

impl SessionIo {
    async fn run(self, stream: WsStream, outbound_rx: mpsc::Receiver<String>) {
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        let heartbeat_cancel = self.shutdown.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                self.heartbeat,
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let end = self
            .pump(stream, outbound_rx, heartbeat_rx, &heartbeat_state)
            .await;
        heartbeat_cancel.cancel();
        self.closed.cancel();

        let (state, event) = match end {
            SessionEnd::Closed(reason) => {
                tracing::info!(session_id = %self.session_id, %reason, "Session closed");
                crate::infrastructure::metrics::record_disconnect("closed");
                (ConnectionState::Closed, ConnectionEvent::Closed { reason })
            }
            SessionEnd::Faulted(error) => {
                tracing::warn!(session_id = %self.session_id, %error, "Session faulted");
                crate::infrastructure::metrics::record_disconnect("faulted");
                (ConnectionState::Faulted, ConnectionEvent::Faulted { error })
            }
        };

        let error = match &event {
            ConnectionEvent::Faulted { error } => Some(error.clone()),
            _ => None,
        };
        self.connection.write().finish(self.session_id, state, error);
        let _ = self.events.send(event).await;
    }

    async fn pump(
        &self,
        stream: WsStream,
        mut outbound_rx: mpsc::Receiver<String>,
        mut heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
        heartbeat_state: &HeartbeatState,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Closed("client disconnect".to_string());
                }
                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return SessionEnd::Faulted(format!("write failed: {e}"));
                    }
                }
                heartbeat = heartbeat_rx.recv() => match heartbeat {
                    Some(HeartbeatEvent::SendPing) => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            return SessionEnd::Faulted(format!("ping failed: {e}"));
                        }
                    }
                    Some(HeartbeatEvent::Timeout { idle }) => {
                        return SessionEnd::Faulted(format!("no inbound traffic for {idle:?}"));
                    }
                    None => {
                        tracing::debug!(session_id = %self.session_id, "Heartbeat channel closed");
                    }
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        heartbeat_state.record_activity();
                        let frame = ConnectionEvent::Frame(text.as_str().to_owned());
                        if self.events.send(frame).await.is_err() {
                            return SessionEnd::Closed("event receiver dropped".to_string());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        heartbeat_state.record_activity();
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return SessionEnd::Faulted(format!("pong failed: {e}"));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => heartbeat_state.record_activity(),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map_or_else(
                            || "server closed".to_string(),
                            |f| format!("server closed ({}): {}", u16::from(f.code), f.reason.as_str()),
                        );
                        return SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Faulted(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) if text.as_str() == "close" => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Message::Text(text) => {
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });
        (url, handle)
    }

    fn manager(url: &str) -> (ConnectionManager, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionManager::new(ConnectionConfig::new(url), tx), rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn connect_send_and_receive() {
        let (url, _server) = echo_server().await;
        let (manager, mut events) = manager(&url);

        let session_id = manager
            .connect(Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert!(manager.is_open());
        assert_eq!(manager.info().session_id, Some(session_id));
        assert!(manager.closed_signal().is_some());

        manager.send_text("hello".to_string()).await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Frame("hello".to_string()));

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let (url, _server) = echo_server().await;
        let (manager, _events) = manager(&url);
        let cancel = CancellationToken::new();

        manager.connect(Duration::from_secs(2), &cancel).await.unwrap();
        assert_eq!(
            manager.connect(Duration::from_secs(2), &cancel).await,
            Err(ConnectError::AlreadyConnected)
        );
    }

    #[tokio::test]
    async fn server_close_emits_closed_and_fires_signal() {
        let (url, _server) = echo_server().await;
        let (manager, mut events) = manager(&url);
        manager
            .connect(Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        let closed = manager.closed_signal().unwrap();

        manager.send_text("close".to_string()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Closed { .. }));
        assert!(closed.is_cancelled());
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            manager.send_text("late".to_string()).await,
            Err(SinkError::NotConnected)
        );
    }

    #[tokio::test]
    async fn handshake_timeout() {
        // Accepts TCP but never completes the WebSocket handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (manager, _events) = manager(&url);
        let result = manager
            .connect(Duration::from_millis(100), &CancellationToken::new())
            .await;
        assert_eq!(result, Err(ConnectError::Timeout(Duration::from_millis(100))));
        assert_eq!(manager.state(), ConnectionState::Faulted);
        assert!(manager.info().last_error.is_some());
    }

    #[tokio::test]
    async fn cancelled_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (_tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (manager, _events) = manager(&url);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = manager.connect(Duration::from_secs(5), &cancel).await;
        assert_eq!(result, Err(ConnectError::Cancelled));
        assert!(!manager.is_open());
    }

    #[tokio::test]
    async fn refused_connect_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (manager, _events) = manager(&url);
        let result = manager
            .connect(Duration::from_secs(2), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ConnectError::Transport(_))));
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn disconnect_without_session_is_noop() {
        let (manager, _events) = manager("ws://127.0.0.1:1");
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(manager.closed_signal().is_none());
    }

    #[tokio::test]
    async fn idle_session_faults_on_heartbeat_timeout() {
        // Server that completes the handshake and then stays silent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let _server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (tx, mut events) = mpsc::channel(16);
        let config = ConnectionConfig {
            heartbeat: HeartbeatConfig::new(Duration::from_millis(20), Duration::from_millis(60)),
            ..ConnectionConfig::new(url)
        };
        let manager = ConnectionManager::new(config, tx);
        manager
            .connect(Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Faulted { .. }));
        assert_eq!(manager.state(), ConnectionState::Faulted);
    }
}
