//! Request/Response Correlator
//!
//! The feed carries no request ids, so a reply is matched to a request by
//! position: whatever non-info control frame arrives while a request is
//! outstanding is its reply. That only holds with one request in flight,
//! which the send lock enforces.
//!
//! Each wait races four signals: the reply, caller cancellation, the request
//! deadline and the end of the session. The pending slot is cleared on every
//! exit path, so a reply that arrives after a timeout is dropped instead of
//! being handed to the next request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{CorrelationError, FrameSink, RequestChannel};
use crate::domain::protocol::{ControlFrame, OutboundRequest};
use crate::infrastructure::metrics::{self, RequestOutcome};

/// Default reply deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    seq: u64,
    name: &'static str,
    reply_tx: oneshot::Sender<ControlFrame>,
}

/// Clears the pending slot if it still belongs to `seq`.
struct SlotGuard<'a> {
    pending: &'a Mutex<Option<PendingRequest>>,
    seq: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.seq == self.seq) {
            *pending = None;
        }
    }
}

/// Serializes control requests and pairs each with the next reply.
pub struct Correlator {
    sink: Arc<dyn FrameSink>,
    send_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<PendingRequest>>,
    next_seq: AtomicU64,
    timeout: Duration,
}

impl Correlator {
    /// Create a correlator over `sink` with the default deadline.
    #[must_use]
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self::with_timeout(sink, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a correlator with a custom reply deadline.
    #[must_use]
    pub fn with_timeout(sink: Arc<dyn FrameSink>, timeout: Duration) -> Self {
        Self {
            sink,
            send_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            next_seq: AtomicU64::new(1),
            timeout,
        }
    }

    /// Reply deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hand a control frame to the outstanding request.
    ///
    /// Returns `false` when no request is waiting.
    pub fn deliver(&self, frame: ControlFrame) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };

        tracing::debug!(
            seq = pending.seq,
            request = pending.name,
            event = frame.event.as_str(),
            "Reply delivered"
        );
        pending.reply_tx.send(frame).is_ok()
    }

    /// Fail the outstanding request with `ConnectionLost`.
    ///
    /// Returns `true` if a request was waiting.
    pub fn fail_pending(&self) -> bool {
        // Dropping the sender resolves the waiter's receiver with an error.
        let failed = self.pending.lock().take();
        if let Some(pending) = &failed {
            tracing::debug!(seq = pending.seq, request = pending.name, "Failing pending request");
        }
        failed.is_some()
    }

    /// Whether a request is awaiting its reply.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    async fn exchange(
        &self,
        request: &OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<ControlFrame, CorrelationError> {
        let closed = self
            .sink
            .closed_signal()
            .ok_or(CorrelationError::NotConnected)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingRequest {
            seq,
            name: request.name(),
            reply_tx,
        });
        let _slot = SlotGuard {
            pending: &self.pending,
            seq,
        };

        self.sink.send_text(request.to_json()).await?;

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| CorrelationError::ConnectionLost),
            () = cancel.cancelled() => Err(CorrelationError::Cancelled),
            () = closed.cancelled() => Err(CorrelationError::ConnectionLost),
            () = tokio::time::sleep(self.timeout) => Err(CorrelationError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl RequestChannel for Correlator {
    async fn send_and_await(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<ControlFrame, CorrelationError> {
        let _lock = tokio::select! {
            guard = self.send_lock.lock() => guard,
            () = cancel.cancelled() => return Err(CorrelationError::Cancelled),
        };

        let name = request.name();
        let started = Instant::now();
        let result = self.exchange(&request, cancel).await;

        let outcome = match &result {
            Ok(_) => RequestOutcome::Replied,
            Err(CorrelationError::Timeout(_)) => RequestOutcome::Timeout,
            Err(CorrelationError::Cancelled) => RequestOutcome::Cancelled,
            Err(CorrelationError::ConnectionLost | CorrelationError::NotConnected) => {
                RequestOutcome::ConnectionLost
            }
        };
        metrics::record_request(name, outcome, started.elapsed());

        if let Err(e) = &result {
            tracing::warn!(request = name, error = %e, "Correlated request failed");
        }
        result
    }

    async fn send(&self, request: OutboundRequest) -> Result<(), CorrelationError> {
        let _lock = self.send_lock.lock().await;
        tracing::debug!(request = request.name(), "Sending uncorrelated request");
        self.sink.send_text(request.to_json()).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.sink.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::SinkError;
    use crate::domain::protocol::ControlEvent;
    use crate::domain::subscription::SubscriptionKey;
    use tokio::sync::mpsc;

    /// Sink that forwards sent text to a channel.
    struct ChannelSink {
        sent: mpsc::UnboundedSender<String>,
        closed: CancellationToken,
        open: bool,
    }

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send_text(&self, text: String) -> Result<(), SinkError> {
            if !self.open {
                return Err(SinkError::NotConnected);
            }
            self.sent.send(text).map_err(|_| SinkError::Closed)
        }

        fn closed_signal(&self) -> Option<CancellationToken> {
            self.open.then(|| self.closed.clone())
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn setup(timeout: Duration) -> (Arc<Correlator>, mpsc::UnboundedReceiver<String>, CancellationToken) {
        let (sent, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let sink = Arc::new(ChannelSink {
            sent,
            closed: closed.clone(),
            open: true,
        });
        (Arc::new(Correlator::with_timeout(sink, timeout)), rx, closed)
    }

    fn subscribed(chan_id: u64) -> ControlFrame {
        ControlFrame {
            channel: Some("ticker".to_string()),
            chan_id: Some(crate::domain::protocol::ChannelId::numeric(chan_id)),
            ..ControlFrame::new(ControlEvent::Subscribed)
        }
    }

    fn subscribe_request() -> OutboundRequest {
        OutboundRequest::Subscribe(SubscriptionKey::ticker("BTCUSD"))
    }

    async fn wait_pending(correlator: &Correlator) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !correlator.has_pending() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("request should become pending");
    }

    #[tokio::test]
    async fn reply_is_delivered() {
        let (correlator, mut sent, _closed) = setup(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            let cancel = cancel.clone();
            tokio::spawn(async move { correlator.send_and_await(subscribe_request(), &cancel).await })
        };

        let text = sent.recv().await.unwrap();
        assert!(text.contains(r#""event":"subscribe""#));
        wait_pending(&correlator).await;

        assert!(correlator.deliver(subscribed(5)));
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.event, ControlEvent::Subscribed);
        assert!(!correlator.has_pending());
    }

    #[tokio::test]
    async fn deliver_without_pending_is_dropped() {
        let (correlator, _sent, _closed) = setup(Duration::from_secs(5));
        assert!(!correlator.deliver(subscribed(1)));
    }

    #[tokio::test]
    async fn timeout_clears_slot_and_late_reply_is_dropped() {
        let (correlator, _sent, _closed) = setup(Duration::from_millis(30));
        let cancel = CancellationToken::new();

        let result = correlator.send_and_await(subscribe_request(), &cancel).await;
        assert_eq!(result, Err(CorrelationError::Timeout(Duration::from_millis(30))));
        assert!(!correlator.has_pending());
        assert!(!correlator.deliver(subscribed(5)));
    }

    #[tokio::test]
    async fn cancellation_releases_lock() {
        let (correlator, _sent, _closed) = setup(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let waiter = {
            let correlator = Arc::clone(&correlator);
            let cancel = cancel.clone();
            tokio::spawn(async move { correlator.send_and_await(subscribe_request(), &cancel).await })
        };
        wait_pending(&correlator).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(CorrelationError::Cancelled));

        // The next request can proceed.
        let next = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_await(subscribe_request(), &CancellationToken::new())
                    .await
            })
        };
        wait_pending(&correlator).await;
        assert!(correlator.deliver(subscribed(6)));
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn session_close_fails_waiter() {
        let (correlator, _sent, closed) = setup(Duration::from_secs(5));

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_await(subscribe_request(), &CancellationToken::new())
                    .await
            })
        };
        wait_pending(&correlator).await;
        closed.cancel();
        assert_eq!(waiter.await.unwrap(), Err(CorrelationError::ConnectionLost));
    }

    #[tokio::test]
    async fn fail_pending_reports_connection_lost() {
        let (correlator, _sent, _closed) = setup(Duration::from_secs(5));

        let waiter = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_await(subscribe_request(), &CancellationToken::new())
                    .await
            })
        };
        wait_pending(&correlator).await;
        assert!(correlator.fail_pending());
        assert_eq!(waiter.await.unwrap(), Err(CorrelationError::ConnectionLost));
        assert!(!correlator.fail_pending());
    }

    #[tokio::test]
    async fn concurrent_requests_are_serialized() {
        let (correlator, mut sent, _closed) = setup(Duration::from_secs(5));

        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_await(subscribe_request(), &CancellationToken::new())
                    .await
            })
        };
        sent.recv().await.unwrap();
        wait_pending(&correlator).await;

        let second = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_await(OutboundRequest::Ping { cid: 1 }, &CancellationToken::new())
                    .await
            })
        };

        // The second request is not written while the first is outstanding.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent.try_recv().is_err());

        assert!(correlator.deliver(subscribed(5)));
        assert_eq!(first.await.unwrap().unwrap().event, ControlEvent::Subscribed);

        let text = sent.recv().await.unwrap();
        assert!(text.contains(r#""event":"ping""#));
        wait_pending(&correlator).await;
        assert!(correlator.deliver(ControlFrame::new(ControlEvent::Pong)));
        assert_eq!(second.await.unwrap().unwrap().event, ControlEvent::Pong);
    }

    #[tokio::test]
    async fn not_connected_without_session() {
        let (sent, _rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ChannelSink {
            sent,
            closed: CancellationToken::new(),
            open: false,
        });
        let correlator = Correlator::new(sink);

        assert!(!correlator.is_connected());
        assert_eq!(
            correlator
                .send_and_await(subscribe_request(), &CancellationToken::new())
                .await,
            Err(CorrelationError::NotConnected)
        );
        assert_eq!(
            correlator.send(subscribe_request()).await,
            Err(CorrelationError::NotConnected)
        );
    }
}
