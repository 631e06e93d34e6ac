//! Stream Client
//!
//! Facade over one exchange session: connection manager, correlator,
//! subscription registry (or batch subscriber) and dispatcher.
//!
//! ```text
//!  caller ── subscribe ──► Registry ── send_and_await ──► Correlator ──► ConnectionManager ──► WS
//!                              ▲                               ▲                   │
//!                              │ bind / resolve                │ deliver           │ ConnectionEvent
//!                              │                               │                   ▼
//!  take_events ◄── StreamEvent ┴────────────── Dispatcher ◄────┴──────────── reader task
//! ```
//!
//! The client never reconnects on its own. When a session ends the reader
//! task fails the outstanding request, clears every channel binding and
//! emits [`StreamEvent::Disconnected`] listing the keys that were lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{AuthError, AuthState, Authenticator, Credentials, interpret_auth_reply};
use super::connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectError,
};
use super::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use super::dispatcher::{AckRouting, Dispatcher};
use super::heartbeat::HeartbeatConfig;
use crate::application::ports::{CorrelationError, FrameSink, RequestChannel};
use crate::application::services::{
    BatchConfig, BatchSubscriber, SubscribeError, SubscriptionRegistry, UnsubscribeError,
};
use crate::domain::protocol::{ChannelId, ControlEvent, OutboundRequest};
use crate::domain::streaming::{ErrorKind, StreamEvent};
use crate::domain::subscription::{EnqueueOutcome, SubscriptionKey};
use crate::infrastructure::config::ClientSettings;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Stream client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Reply deadline for correlated requests.
    pub request_timeout: Duration,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Batch mode settings (`None` = one correlated request per change).
    pub batch: Option<BatchConfig>,
    /// Event queue depth.
    pub event_capacity: usize,
    /// Added to the millisecond clock when generating nonces.
    pub nonce_offset: u64,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat: HeartbeatConfig::default(),
            batch: None,
            event_capacity: 4096,
            nonce_offset: 0,
        }
    }

    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: settings.connect_timeout,
            request_timeout: settings.request_timeout,
            heartbeat: HeartbeatConfig::new(
                settings.heartbeat_interval,
                settings.heartbeat_timeout,
            ),
            batch: settings.batch_mode.then_some(BatchConfig {
                interval: settings.batch_interval,
                batch_size: settings.batch_size,
            }),
            event_capacity: settings.event_capacity,
            nonce_offset: settings.nonce_offset,
        }
    }

    const fn routing(&self) -> AckRouting {
        if self.batch.is_some() {
            AckRouting::Batched
        } else {
            AckRouting::Correlated
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Result of a subscribe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Acknowledged with this channel id.
    Bound(ChannelId),
    /// Queued for the next batch.
    Queued(EnqueueOutcome),
}

/// Failure of a protocol ping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PingError {
    /// The request/reply exchange failed.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The reply was not a `pong`.
    #[error("unexpected reply to ping: {0}")]
    UnexpectedReply(String),
}

impl PingError {
    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Correlation(e) => e.kind(),
            Self::UnexpectedReply(_) => ErrorKind::Protocol,
        }
    }
}

// =============================================================================
// Stream Client
// =============================================================================

/// Authenticated, subscription-multiplexing stream client.
pub struct StreamClient {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    correlator: Arc<Correlator>,
    registry: Arc<SubscriptionRegistry>,
    batcher: Option<Arc<BatchSubscriber>>,
    authenticator: Option<Authenticator>,
    auth_state: Arc<RwLock<AuthState>>,
    background: Mutex<Option<Background>>,
    events_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    sessions_started: AtomicU64,
    sessions_ended: watch::Receiver<u64>,
    ping_cid: AtomicU64,
    cancel: CancellationToken,
}

/// Pieces the reader task takes ownership of on first connect.
struct Background {
    connection_rx: mpsc::Receiver<ConnectionEvent>,
    dispatcher: Dispatcher,
    events_tx: mpsc::Sender<StreamEvent>,
    sessions_ended: watch::Sender<u64>,
}

impl StreamClient {
    /// Create a client. No I/O happens until [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: ClientConfig, credentials: Option<Credentials>) -> Self {
        let (connection_tx, connection_rx) = mpsc::channel(config.event_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (ended_tx, ended_rx) = watch::channel(0);

        let connection = Arc::new(ConnectionManager::new(
            ConnectionConfig {
                heartbeat: config.heartbeat,
                ..ConnectionConfig::new(config.url.clone())
            },
            connection_tx,
        ));
        let sink: Arc<dyn FrameSink> = Arc::clone(&connection) as Arc<dyn FrameSink>;
        let correlator = Arc::new(Correlator::with_timeout(sink, config.request_timeout));
        let requests: Arc<dyn RequestChannel> = Arc::clone(&correlator) as Arc<dyn RequestChannel>;
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&requests)));
        let batcher = config.batch.map(|batch| {
            Arc::new(BatchSubscriber::new(
                requests,
                Arc::clone(registry.bindings()),
                batch,
            ))
        });

        let dispatcher = Dispatcher::new(
            Arc::clone(&correlator),
            Arc::clone(&registry),
            events_tx.clone(),
            config.routing(),
        );
        let authenticator = credentials.map(|c| Authenticator::new(c, config.nonce_offset));

        Self {
            config,
            connection,
            correlator,
            registry,
            batcher,
            authenticator,
            auth_state: Arc::new(RwLock::new(AuthState::default())),
            background: Mutex::new(Some(Background {
                connection_rx,
                dispatcher,
                events_tx,
                sessions_ended: ended_tx,
            })),
            events_rx: Mutex::new(Some(events_rx)),
            sessions_started: AtomicU64::new(0),
            sessions_ended: ended_rx,
            ping_cid: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Take the event receiver. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events_rx.lock().take()
    }

    /// Open a session.
    ///
    /// # Errors
    ///
    /// Returns an error if a session is already open, or the handshake fails,
    /// times out or is cancelled.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<Uuid, ConnectError> {
        if self.connection.is_open() {
            return Err(ConnectError::AlreadyConnected);
        }
        self.start_background();
        self.await_previous_session().await;

        let session_id = self
            .connection
            .connect(self.config.connect_timeout, cancel)
            .await?;
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
        *self.auth_state.write() = AuthState::Unauthenticated;
        Ok(session_id)
    }

    /// Close the session. A no-op when nothing is open.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Snapshot of the current session.
    #[must_use]
    pub fn connection_info(&self) -> Connection {
        self.connection.info()
    }

    /// Authenticate the session for the private account feed.
    ///
    /// Returns the exchange user id.
    ///
    /// # Errors
    ///
    /// Returns an error if no credentials were configured, the exchange
    /// rejects them, or the exchange fails.
    pub async fn authenticate(&self, cancel: &CancellationToken) -> Result<u64, AuthError> {
        let authenticator = self
            .authenticator
            .as_ref()
            .ok_or(AuthError::MissingCredentials)?;

        if let AuthState::Authenticated { user_id } = *self.auth_state.read() {
            return Ok(user_id);
        }

        *self.auth_state.write() = AuthState::Authenticating;
        let result = async {
            let payload = authenticator.payload()?;
            let reply = self
                .correlator
                .send_and_await(OutboundRequest::Auth(payload), cancel)
                .await?;
            interpret_auth_reply(&reply)
        }
        .await;

        match &result {
            Ok(user_id) => {
                *self.auth_state.write() = AuthState::Authenticated { user_id: *user_id };
                tracing::info!(user_id, "Authenticated");
            }
            Err(e) => {
                *self.auth_state.write() = AuthState::Failed;
                tracing::warn!(error = %e, "Authentication failed");
            }
        }
        result
    }

    /// Authentication state of the current session.
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        *self.auth_state.read()
    }

    /// Subscribe to `key`.
    ///
    /// In batch mode the key is queued and acknowledged asynchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the request, the ack lacks a
    /// channel id, or the exchange fails.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        cancel: &CancellationToken,
    ) -> Result<Subscription, SubscribeError> {
        if let Some(batcher) = &self.batcher {
            let outcome = batcher.subscribe(key);
            return Ok(Subscription::Queued(outcome));
        }

        let id = self.registry.subscribe(key, cancel).await?;
        metrics::set_subscriptions(self.registry.bindings().len());
        Ok(Subscription::Bound(id))
    }

    /// Unsubscribe from `key`.
    ///
    /// # Errors
    ///
    /// Returns `NotSubscribed` for an unknown key, or an error if the
    /// exchange rejects the request or the exchange fails.
    pub async fn unsubscribe(
        &self,
        key: &SubscriptionKey,
        cancel: &CancellationToken,
    ) -> Result<(), UnsubscribeError> {
        if let Some(batcher) = &self.batcher {
            if !batcher.is_tracked(key) {
                return Err(UnsubscribeError::NotSubscribed(key.clone()));
            }
            batcher.unsubscribe(key.clone());
            return Ok(());
        }

        self.registry.unsubscribe(key, cancel).await?;
        metrics::set_subscriptions(self.registry.bindings().len());
        Ok(())
    }

    /// Subscription key bound to a channel id.
    #[must_use]
    pub fn resolve(&self, id: &ChannelId) -> Option<SubscriptionKey> {
        self.registry.resolve(id)
    }

    /// Active subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.registry.bindings().keys()
    }

    /// Pending `(subscribe, unsubscribe)` keys in batch mode.
    #[must_use]
    pub fn pending_batches(&self) -> (usize, usize) {
        self.batcher.as_ref().map_or((0, 0), |b| b.pending())
    }

    /// Protocol-level ping. Returns the round-trip time.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the reply is not a `pong`.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<Duration, PingError> {
        let cid = self.ping_cid.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let reply = self
            .correlator
            .send_and_await(OutboundRequest::Ping { cid }, cancel)
            .await?;

        if reply.event != ControlEvent::Pong {
            return Err(PingError::UnexpectedReply(reply.event.as_str().to_string()));
        }
        if reply.cid.is_some_and(|echoed| echoed != cid) {
            tracing::debug!(cid, echoed = reply.cid, "Pong echoed a different cid");
        }
        Ok(started.elapsed())
    }

    /// Stop background tasks and close the session.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.cancel.cancel();
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    fn start_background(&self) {
        let Some(background) = self.background.lock().take() else {
            return;
        };

        let reader = Reader {
            correlator: Arc::clone(&self.correlator),
            registry: Arc::clone(&self.registry),
            batcher: self.batcher.clone(),
            auth_state: Arc::clone(&self.auth_state),
            events_tx: background.events_tx,
            sessions_ended: background.sessions_ended,
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(reader.run(background.connection_rx, background.dispatcher));

        if let Some(batcher) = &self.batcher {
            tokio::spawn(Arc::clone(batcher).run(self.cancel.child_token()));
        }
    }

    /// Wait until the reader has processed the end of the previous session,
    /// so its bindings are cleared before new ones are made.
    async fn await_previous_session(&self) {
        let started = self.sessions_started.load(Ordering::SeqCst);
        if started == 0 {
            return;
        }

        let mut ended = self.sessions_ended.clone();
        let wait = ended.wait_for(|&count| count >= started);
        if tokio::time::timeout(self.config.connect_timeout, wait)
            .await
            .is_err()
        {
            tracing::warn!("Previous session teardown still pending");
        }
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Reader Task
// =============================================================================

struct Reader {
    correlator: Arc<Correlator>,
    registry: Arc<SubscriptionRegistry>,
    batcher: Option<Arc<BatchSubscriber>>,
    auth_state: Arc<RwLock<AuthState>>,
    events_tx: mpsc::Sender<StreamEvent>,
    sessions_ended: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(self, mut connection_rx: mpsc::Receiver<ConnectionEvent>, dispatcher: Dispatcher) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = connection_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ConnectionEvent::Frame(text) => {
                    dispatcher.dispatch(&text);
                }
                ConnectionEvent::Closed { reason } => self.session_ended(reason).await,
                ConnectionEvent::Faulted { error } => self.session_ended(error).await,
            }
        }
        tracing::debug!("Reader task stopped");
    }

    async fn session_ended(&self, reason: String) {
        if self.correlator.fail_pending() {
            tracing::debug!("Failed outstanding request on disconnect");
        }
        let lost = self.registry.reset();
        metrics::set_subscriptions(0);
        *self.auth_state.write() = AuthState::Unauthenticated;

        if let Some(batcher) = &self.batcher {
            // Keys lost with the session are reported; queued work survives.
            tracing::debug!(pending = ?batcher.pending(), "Batch queue kept across disconnect");
        }

        tracing::info!(%reason, lost = lost.len(), "Session ended");
        self.sessions_ended.send_modify(|count| *count += 1);

        tokio::select! {
            () = self.cancel.cancelled() => {}
            result = self.events_tx.send(StreamEvent::Disconnected { reason, lost }) => {
                if result.is_err() {
                    tracing::debug!("Event receiver dropped");
                }
            }
        }
    }
}
