//! Batch Subscriber
//!
//! Batch-mode variant of the registry: subscribe and unsubscribe calls only
//! queue work, and a periodic task drains the queues into at most one
//! subscribe and one unsubscribe frame per tick. Acks are applied to the
//! bindings by the dispatcher as they arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::RequestChannel;
use crate::domain::protocol::OutboundRequest;
use crate::domain::subscription::{
    BatchDrain, BatchQueue, ChannelBindings, EnqueueOutcome, SubscriptionKey,
};

/// Batch drain settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Time between drains.
    pub interval: Duration,
    /// Maximum keys per frame.
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 60,
        }
    }
}

/// Keys sent by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Keys sent in a subscribe frame.
    pub subscribed: usize,
    /// Keys sent in an unsubscribe frame.
    pub unsubscribed: usize,
    /// Keys put back because the session was not open or the send failed.
    pub requeued: usize,
}

/// Queues subscription changes and flushes them periodically.
pub struct BatchSubscriber {
    queue: BatchQueue,
    requests: Arc<dyn RequestChannel>,
    bindings: Arc<ChannelBindings>,
    config: BatchConfig,
}

impl BatchSubscriber {
    /// Create a batch subscriber.
    #[must_use]
    pub fn new(
        requests: Arc<dyn RequestChannel>,
        bindings: Arc<ChannelBindings>,
        config: BatchConfig,
    ) -> Self {
        Self {
            queue: BatchQueue::new(),
            requests,
            bindings,
            config,
        }
    }

    /// Get the batch configuration.
    #[must_use]
    pub const fn config(&self) -> BatchConfig {
        self.config
    }

    /// Queue a subscribe. Keys still bound when the batch is flushed are
    /// skipped.
    pub fn subscribe(&self, key: SubscriptionKey) -> EnqueueOutcome {
        self.queue.enqueue_subscribe(key)
    }

    /// Queue an unsubscribe.
    pub fn unsubscribe(&self, key: SubscriptionKey) -> EnqueueOutcome {
        self.queue.enqueue_unsubscribe(key)
    }

    /// Whether `key` is bound or waiting to be subscribed.
    #[must_use]
    pub fn is_tracked(&self, key: &SubscriptionKey) -> bool {
        self.bindings.contains(key) || self.queue.is_subscribe_queued(key)
    }

    /// Number of pending `(subscribe, unsubscribe)` keys.
    #[must_use]
    pub fn pending(&self) -> (usize, usize) {
        self.queue.pending()
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Drain one batch and send it.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();

        if !self.requests.is_connected() {
            return report;
        }

        let BatchDrain {
            mut subscribe,
            unsubscribe,
        } = self.queue.drain(self.config.batch_size);

        // Keys bound since they were queued need no request.
        subscribe.retain(|key| !self.bindings.contains(key));

        let mut failed = BatchDrain::default();

        if !subscribe.is_empty() {
            let count = subscribe.len();
            match self
                .requests
                .send(OutboundRequest::BatchSubscribe(subscribe.clone()))
                .await
            {
                Ok(()) => report.subscribed = count,
                Err(e) => {
                    tracing::warn!(count, error = %e, "Batch subscribe failed, requeueing");
                    failed.subscribe = subscribe;
                }
            }
        }

        if !unsubscribe.is_empty() {
            let count = unsubscribe.len();
            match self
                .requests
                .send(OutboundRequest::BatchUnsubscribe(unsubscribe.clone()))
                .await
            {
                Ok(()) => report.unsubscribed = count,
                Err(e) => {
                    tracing::warn!(count, error = %e, "Batch unsubscribe failed, requeueing");
                    failed.unsubscribe = unsubscribe;
                }
            }
        }

        if !failed.is_empty() {
            report.requeued = failed.subscribe.len() + failed.unsubscribe.len();
            self.queue.requeue(failed);
        }

        if report.subscribed + report.unsubscribed > 0 {
            tracing::debug!(
                subscribed = report.subscribed,
                unsubscribed = report.unsubscribed,
                "Flushed subscription batch"
            );
        }

        report
    }

    /// Flush every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Batch subscriber stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }
}
