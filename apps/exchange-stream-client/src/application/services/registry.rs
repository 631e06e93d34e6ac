//! Subscription Registry
//!
//! Correlated subscribe/unsubscribe against the exchange. A binding is only
//! recorded once the exchange acknowledges it with a channel id, and only
//! removed once the exchange acknowledges the unsubscribe.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::application::ports::{CorrelationError, RequestChannel};
use crate::domain::protocol::{ChannelId, ControlEvent, ControlFrame, OutboundRequest};
use crate::domain::streaming::ErrorKind;
use crate::domain::subscription::{ChannelBindings, SubscriptionKey};

// =============================================================================
// Errors
// =============================================================================

/// Subscribe failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The request/reply exchange failed.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The exchange refused the subscription.
    #[error("subscribe rejected ({code:?}): {message}")]
    Rejected {
        /// Exchange error code.
        code: Option<i64>,
        /// Exchange error text.
        message: String,
    },

    /// The ack carried no channel id.
    #[error("subscribe ack carried no channel id")]
    MissingChannelId,

    /// The reply was some other control event.
    #[error("unexpected reply to subscribe: {0}")]
    UnexpectedReply(String),
}

impl SubscribeError {
    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Correlation(e) => e.kind(),
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::MissingChannelId | Self::UnexpectedReply(_) => ErrorKind::Protocol,
        }
    }
}

/// Unsubscribe failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsubscribeError {
    /// No binding exists for the key.
    #[error("not subscribed: {0}")]
    NotSubscribed(SubscriptionKey),

    /// The request/reply exchange failed.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The exchange refused the unsubscribe.
    #[error("unsubscribe rejected ({code:?}): {message}")]
    Rejected {
        /// Exchange error code.
        code: Option<i64>,
        /// Exchange error text.
        message: String,
    },

    /// The reply was some other control event.
    #[error("unexpected reply to unsubscribe: {0}")]
    UnexpectedReply(String),
}

impl UnsubscribeError {
    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotSubscribed(_) => ErrorKind::State,
            Self::Correlation(e) => e.kind(),
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::UnexpectedReply(_) => ErrorKind::Protocol,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Outcome of applying an uncorrelated ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// A binding was recorded.
    Bound(SubscriptionKey, ChannelId),
    /// A binding was removed.
    Unbound(SubscriptionKey),
    /// The ack did not change the bindings.
    Ignored,
}

/// Channel-id bookkeeping driven by acknowledged requests.
pub struct SubscriptionRegistry {
    requests: Arc<dyn RequestChannel>,
    bindings: Arc<ChannelBindings>,
}

impl SubscriptionRegistry {
    /// Create a registry with an empty binding table.
    #[must_use]
    pub fn new(requests: Arc<dyn RequestChannel>) -> Self {
        Self::with_bindings(requests, Arc::new(ChannelBindings::new()))
    }

    /// Create a registry over an existing binding table.
    #[must_use]
    pub const fn with_bindings(
        requests: Arc<dyn RequestChannel>,
        bindings: Arc<ChannelBindings>,
    ) -> Self {
        Self { requests, bindings }
    }

    /// Shared binding table (read by the dispatcher).
    #[must_use]
    pub const fn bindings(&self) -> &Arc<ChannelBindings> {
        &self.bindings
    }

    /// Subscribe and record the acknowledged channel id.
    ///
    /// Subscribing a key that is already bound returns its id without a
    /// round trip.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange rejects the request, the ack lacks a
    /// channel id, or the correlated exchange fails.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        cancel: &CancellationToken,
    ) -> Result<ChannelId, SubscribeError> {
        if let Some(id) = self.bindings.channel_id(&key) {
            tracing::debug!(key = %key, channel_id = %id, "Already subscribed");
            return Ok(id);
        }

        let reply = self
            .requests
            .send_and_await(OutboundRequest::Subscribe(key.clone()), cancel)
            .await?;

        if let Some(rejection) = reply.rejection() {
            tracing::warn!(key = %key, error = %rejection, "Subscribe rejected");
            return Err(SubscribeError::Rejected {
                code: rejection.code,
                message: rejection.message,
            });
        }

        if reply.event != ControlEvent::Subscribed {
            return Err(SubscribeError::UnexpectedReply(reply.event.as_str().to_string()));
        }

        let id = reply
            .channel_id()
            .cloned()
            .ok_or(SubscribeError::MissingChannelId)?;

        if let Some(previous) = self.bindings.bind(key.clone(), id.clone())
            && previous != id
        {
            tracing::debug!(key = %key, previous = %previous, "Replaced stale binding");
        }

        tracing::info!(key = %key, channel_id = %id, "Subscribed");
        Ok(id)
    }

    /// Unsubscribe a bound key and remove its binding on ack.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not bound, the exchange rejects the
    /// request, or the correlated exchange fails.
    pub async fn unsubscribe(
        &self,
        key: &SubscriptionKey,
        cancel: &CancellationToken,
    ) -> Result<(), UnsubscribeError> {
        let id = self
            .bindings
            .channel_id(key)
            .ok_or_else(|| UnsubscribeError::NotSubscribed(key.clone()))?;

        let reply = self
            .requests
            .send_and_await(OutboundRequest::Unsubscribe(id.clone()), cancel)
            .await?;

        if let Some(rejection) = reply.rejection() {
            tracing::warn!(key = %key, error = %rejection, "Unsubscribe rejected");
            return Err(UnsubscribeError::Rejected {
                code: rejection.code,
                message: rejection.message,
            });
        }

        if reply.event != ControlEvent::Unsubscribed {
            return Err(UnsubscribeError::UnexpectedReply(
                reply.event.as_str().to_string(),
            ));
        }

        self.bindings.unbind(key);
        tracing::info!(key = %key, channel_id = %id, "Unsubscribed");
        Ok(())
    }

    /// Resolve a channel id from a data frame.
    #[must_use]
    pub fn resolve(&self, id: &ChannelId) -> Option<SubscriptionKey> {
        self.bindings.resolve(id)
    }

    /// Apply a subscribe/unsubscribe ack that was not awaited by a caller
    /// (batch mode).
    pub fn apply_ack(&self, frame: &ControlFrame) -> AckOutcome {
        match frame.event {
            ControlEvent::Subscribed => {
                let (Some(key), Some(id)) = (frame.subscription_key(), frame.channel_id()) else {
                    tracing::warn!(?frame, "Subscribe ack without channel or id");
                    return AckOutcome::Ignored;
                };
                self.bindings.bind(key.clone(), id.clone());
                tracing::info!(key = %key, channel_id = %id, "Subscribed (batch)");
                AckOutcome::Bound(key, id.clone())
            }
            ControlEvent::Unsubscribed => {
                let unbound = frame
                    .channel_id()
                    .and_then(|id| self.bindings.unbind_id(id))
                    .or_else(|| {
                        let key = frame.subscription_key()?;
                        self.bindings.unbind(&key).map(|_| key)
                    });

                match unbound {
                    Some(key) => {
                        tracing::info!(key = %key, "Unsubscribed (batch)");
                        AckOutcome::Unbound(key)
                    }
                    None => AckOutcome::Ignored,
                }
            }
            _ => AckOutcome::Ignored,
        }
    }

    /// Invalidate every binding after the session ended.
    ///
    /// Returns the keys that were bound.
    pub fn reset(&self) -> Vec<SubscriptionKey> {
        let lost = self.bindings.clear();
        if !lost.is_empty() {
            tracing::info!(count = lost.len(), "Cleared channel bindings");
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockRequestChannel;
    use proptest::prelude::*;
    use std::time::Duration;

    fn ack(json: &str) -> ControlFrame {
        serde_json::from_str(json).unwrap()
    }

    fn registry_with(mock: MockRequestChannel) -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(mock))
    }

    #[tokio::test]
    async fn subscribe_binds_acknowledged_id() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await()
            .withf(|req, _| *req == OutboundRequest::Subscribe(SubscriptionKey::ticker("BTCUSD")))
            .times(1)
            .returning(|_, _| {
                Ok(ack(
                    r#"{"event":"subscribed","channel":"ticker","pair":"BTCUSD","chanId":"5"}"#,
                ))
            });

        let registry = registry_with(mock);
        let key = SubscriptionKey::ticker("BTCUSD");

        let id = registry
            .subscribe(key.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(id, ChannelId::new("5"));
        assert_eq!(registry.resolve(&ChannelId::new("5")), Some(key));
    }

    #[tokio::test]
    async fn subscribe_already_bound_skips_round_trip() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await().times(0);

        let registry = registry_with(mock);
        let key = SubscriptionKey::ticker("BTCUSD");
        registry.bindings().bind(key.clone(), ChannelId::new("5"));

        let id = registry
            .subscribe(key, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(id, ChannelId::new("5"));
    }

    #[tokio::test]
    async fn subscribe_rejected_records_nothing() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await().returning(|_, _| {
            Ok(ack(
                r#"{"event":"error","code":10300,"msg":"subscribe: dup","chanId":"5"}"#,
            ))
        });

        let registry = registry_with(mock);
        let err = registry
            .subscribe(SubscriptionKey::ticker("BTCUSD"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SubscribeError::Rejected {
                code: Some(10300),
                message: "subscribe: dup".to_string()
            }
        );
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(registry.bindings().is_empty());
    }

    #[tokio::test]
    async fn subscribe_without_channel_id_fails() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await()
            .returning(|_, _| Ok(ack(r#"{"event":"subscribed","channel":"ticker"}"#)));

        let registry = registry_with(mock);
        let err = registry
            .subscribe(SubscriptionKey::ticker("BTCUSD"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, SubscribeError::MissingChannelId);
        assert!(registry.bindings().is_empty());
    }

    #[tokio::test]
    async fn subscribe_unexpected_reply_fails() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await()
            .returning(|_, _| Ok(ack(r#"{"event":"pong","cid":1}"#)));

        let registry = registry_with(mock);
        let err = registry
            .subscribe(SubscriptionKey::ticker("BTCUSD"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, SubscribeError::UnexpectedReply("pong".to_string()));
    }

    #[tokio::test]
    async fn subscribe_timeout_propagates() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await()
            .returning(|_, _| Err(CorrelationError::Timeout(Duration::from_secs(30))));

        let registry = registry_with(mock);
        let err = registry
            .subscribe(SubscriptionKey::ticker("BTCUSD"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_key_is_state_error() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await().times(0);

        let registry = registry_with(mock);
        let key = SubscriptionKey::trades("ETHUSD");
        let err = registry
            .unsubscribe(&key, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, UnsubscribeError::NotSubscribed(key));
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn unsubscribe_sends_id_and_unbinds() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await()
            .withf(|req, _| *req == OutboundRequest::Unsubscribe(ChannelId::new("5")))
            .times(1)
            .returning(|_, _| Ok(ack(r#"{"event":"unsubscribed","status":"OK","chanId":"5"}"#)));

        let registry = registry_with(mock);
        let key = SubscriptionKey::ticker("BTCUSD");
        registry.bindings().bind(key.clone(), ChannelId::new("5"));

        registry
            .unsubscribe(&key, &CancellationToken::new())
            .await
            .unwrap();

        assert!(registry.resolve(&ChannelId::new("5")).is_none());
        assert!(registry.bindings().channel_id(&key).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_failure_keeps_binding() {
        let mut mock = MockRequestChannel::new();
        mock.expect_send_and_await()
            .returning(|_, _| Err(CorrelationError::ConnectionLost));

        let registry = registry_with(mock);
        let key = SubscriptionKey::ticker("BTCUSD");
        registry.bindings().bind(key.clone(), ChannelId::new("5"));

        let err = registry
            .unsubscribe(&key, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            UnsubscribeError::Correlation(CorrelationError::ConnectionLost)
        );
        assert!(registry.bindings().contains(&key));
    }

    #[test]
    fn apply_ack_binds_and_unbinds() {
        let registry = registry_with(MockRequestChannel::new());

        let bound = registry.apply_ack(&ack(
            r#"{"event":"subscribed","channel":"trades","pair":"BTCUSD","chanId":9}"#,
        ));
        assert_eq!(
            bound,
            AckOutcome::Bound(SubscriptionKey::trades("BTCUSD"), ChannelId::numeric(9))
        );

        let unbound = registry.apply_ack(&ack(r#"{"event":"unsubscribed","chanId":9}"#));
        assert_eq!(unbound, AckOutcome::Unbound(SubscriptionKey::trades("BTCUSD")));
        assert!(registry.bindings().is_empty());
    }

    #[test]
    fn apply_ack_ignores_other_events() {
        let registry = registry_with(MockRequestChannel::new());
        assert_eq!(
            registry.apply_ack(&ack(r#"{"event":"pong"}"#)),
            AckOutcome::Ignored
        );
    }

    #[test]
    fn reset_returns_lost_keys() {
        let registry = registry_with(MockRequestChannel::new());
        registry
            .bindings()
            .bind(SubscriptionKey::ticker("BTCUSD"), ChannelId::new("1"));

        assert_eq!(registry.reset(), vec![SubscriptionKey::ticker("BTCUSD")]);
        assert!(registry.reset().is_empty());
    }

    fn key_strategy() -> impl Strategy<Value = SubscriptionKey> {
        (
            prop_oneof![Just("BTCUSD"), Just("ETHUSD"), Just("LTCUSD")],
            0..4usize,
        )
            .prop_map(|(instrument, c)| match c {
                0 => SubscriptionKey::ticker(instrument),
                1 => SubscriptionKey::trades(instrument),
                2 => SubscriptionKey::book(instrument, "P0"),
                _ => SubscriptionKey::candles(instrument, "1m"),
            })
    }

    proptest! {
        #[test]
        fn subscribe_then_unsubscribe_leaves_no_binding(key in key_strategy(), id in 1u64..10_000) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let mut mock = MockRequestChannel::new();
            mock.expect_send_and_await().returning(move |req, _| match req {
                OutboundRequest::Subscribe(_) => {
                    let mut frame = ControlFrame::new(ControlEvent::Subscribed);
                    frame.chan_id = Some(ChannelId::numeric(id));
                    Ok(frame)
                }
                _ => Ok(ControlFrame::new(ControlEvent::Unsubscribed)),
            });

            let registry = registry_with(mock);
            let cancel = CancellationToken::new();

            runtime.block_on(async {
                registry.subscribe(key.clone(), &cancel).await.unwrap();
                registry.unsubscribe(&key, &cancel).await.unwrap();
            });

            prop_assert!(registry.bindings().channel_id(&key).is_none());
            prop_assert!(registry.resolve(&ChannelId::numeric(id)).is_none());
            prop_assert!(registry.bindings().is_empty());
        }
    }
}
