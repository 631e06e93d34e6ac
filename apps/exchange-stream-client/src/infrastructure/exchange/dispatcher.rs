//! Message Dispatcher
//!
//! Turns each inbound text frame into at most one outcome: a reply handed to
//! the correlator, a typed event, a drop, or an error event. Frames are
//! handled one at a time in arrival order on the session's reader task; a
//! frame that fails to parse or decode is reported and the next frame is
//! processed normally.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::codec::{DataBody, DataFrame, InboundFrame, JsonCodec};
use super::correlator::Correlator;
use super::decode::{decode_account, decode_market};
use crate::application::services::{AckOutcome, SubscriptionRegistry};
use crate::domain::protocol::{ChannelId, ControlEvent, ControlFrame};
use crate::domain::streaming::{ErrorKind, MarketEvent, StreamError, StreamEvent};
use crate::domain::subscription::{Channel, SubscriptionKey};
use crate::infrastructure::metrics::{self, DropReason, FrameKind};

/// Info code announcing a server restart; clients should reconnect.
const INFO_RESTART: i64 = 20051;
/// Info code announcing the start of maintenance.
const INFO_MAINTENANCE_START: i64 = 20060;
/// Info code announcing the end of maintenance.
const INFO_MAINTENANCE_END: i64 = 20061;

/// Public trade execution tag.
const TRADE_EXECUTED: &str = "te";
/// Public trade update tag (repeats `te` with the trade id settled).
const TRADE_UPDATED: &str = "tu";

/// Where subscription acks go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRouting {
    /// Acks are replies to correlated subscribe/unsubscribe requests.
    Correlated,
    /// Acks are applied to the bindings directly (batch mode).
    Batched,
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to the outstanding request.
    Reply,
    /// A subscription ack was applied to the bindings.
    Applied,
    /// A typed event was emitted.
    Emitted,
    /// The frame produced nothing.
    Dropped(DropReason),
    /// An error event was emitted.
    Failed,
}

/// Per-frame state machine for one session.
pub struct Dispatcher {
    codec: JsonCodec,
    correlator: Arc<Correlator>,
    registry: Arc<SubscriptionRegistry>,
    events: mpsc::Sender<StreamEvent>,
    routing: AckRouting,
}

impl Dispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub const fn new(
        correlator: Arc<Correlator>,
        registry: Arc<SubscriptionRegistry>,
        events: mpsc::Sender<StreamEvent>,
        routing: AckRouting,
    ) -> Self {
        Self {
            codec: JsonCodec::new(),
            correlator,
            registry,
            events,
            routing,
        }
    }

    /// Ack routing mode.
    #[must_use]
    pub const fn routing(&self) -> AckRouting {
        self.routing
    }

    /// Process one raw frame.
    pub fn dispatch(&self, text: &str) -> Dispatch {
        match self.codec.decode(text) {
            Ok(InboundFrame::Control(frame)) => {
                metrics::record_frame(FrameKind::Control);
                self.on_control(frame)
            }
            Ok(InboundFrame::Data(frame)) => self.on_data(frame),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                self.fail(StreamError::protocol(format!("malformed frame: {e}")))
            }
        }
    }

    // =========================================================================
    // Control Frames
    // =========================================================================

    fn on_control(&self, frame: ControlFrame) -> Dispatch {
        if frame.is_info() {
            log_info(&frame);
            return dropped(DropReason::Info);
        }

        if self.routing == AckRouting::Batched {
            if frame.is_subscription_ack() {
                return match self.registry.apply_ack(&frame) {
                    AckOutcome::Ignored => dropped(DropReason::Unsolicited),
                    AckOutcome::Bound(..) | AckOutcome::Unbound(_) => {
                        metrics::set_subscriptions(self.registry.bindings().len());
                        Dispatch::Applied
                    }
                };
            }

            if frame.event == ControlEvent::Error && !self.correlator.has_pending() {
                let rejection = frame.rejection().map(|r| r.to_string()).unwrap_or_default();
                tracing::warn!(
                    channel = frame.channel.as_deref(),
                    pair = frame.pair.as_deref(),
                    error = %rejection,
                    "Batch request rejected"
                );
                return self.emit_error(StreamError {
                    kind: ErrorKind::Rejected,
                    message: rejection,
                });
            }
        }

        let event = frame.event.clone();
        if self.correlator.deliver(frame) {
            Dispatch::Reply
        } else {
            tracing::debug!(event = event.as_str(), "Dropping unsolicited control frame");
            dropped(DropReason::Unsolicited)
        }
    }

    // =========================================================================
    // Data Frames
    // =========================================================================

    fn on_data(&self, frame: DataFrame) -> Dispatch {
        let DataFrame { channel_id, body } = frame;

        if body == DataBody::Heartbeat {
            metrics::record_frame(FrameKind::Heartbeat);
            return dropped(DropReason::Heartbeat);
        }
        metrics::record_frame(FrameKind::Data);

        if channel_id.is_account_channel() {
            return self.on_account(body);
        }

        let Some(key) = self.registry.resolve(&channel_id) else {
            tracing::debug!(channel_id = %channel_id, "Dropping data for unknown channel");
            return dropped(DropReason::UnknownChannel);
        };

        let payload = match body {
            DataBody::Payload(payload) => payload,
            DataBody::Tagged { tag, payload } => match (key.channel, tag.as_str()) {
                (Channel::Trades, TRADE_EXECUTED) => payload,
                (Channel::Trades, TRADE_UPDATED) => return dropped(DropReason::Duplicate),
                _ => {
                    tracing::debug!(channel_id = %channel_id, %tag, "Dropping unsupported tagged frame");
                    return dropped(DropReason::Unsupported);
                }
            },
            DataBody::Heartbeat => return dropped(DropReason::Heartbeat),
        };

        self.on_market(key, channel_id, &payload)
    }

    fn on_market(&self, key: SubscriptionKey, channel_id: ChannelId, payload: &Value) -> Dispatch {
        match decode_market(key.channel, payload) {
            Ok((snapshot, payload)) => self.emit(StreamEvent::Market(MarketEvent {
                key,
                channel_id,
                snapshot,
                payload,
            })),
            Err(e) => {
                tracing::warn!(key = %key, channel_id = %channel_id, error = %e, "Failed to decode market data");
                self.fail(StreamError::protocol(format!("{key}: {e}")))
            }
        }
    }

    fn on_account(&self, body: DataBody) -> Dispatch {
        let DataBody::Tagged { tag, payload } = body else {
            tracing::warn!("Account frame without event tag");
            return self.fail(StreamError::protocol("account frame without event tag"));
        };

        match decode_account(&tag, &payload) {
            Ok(event) => self.emit(StreamEvent::Account(event)),
            Err(e) => {
                tracing::warn!(%tag, error = %e, "Failed to decode account data");
                self.fail(StreamError::protocol(format!("account {tag}: {e}")))
            }
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn fail(&self, error: StreamError) -> Dispatch {
        metrics::record_decode_error();
        self.emit_error(error)
    }

    fn emit_error(&self, error: StreamError) -> Dispatch {
        match self.emit(StreamEvent::Error(error)) {
            Dispatch::Emitted => Dispatch::Failed,
            other => other,
        }
    }

    fn emit(&self, event: StreamEvent) -> Dispatch {
        match self.events.try_send(event) {
            Ok(()) => Dispatch::Emitted,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Event queue full, dropping event");
                dropped(DropReason::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Event receiver dropped");
                dropped(DropReason::QueueFull)
            }
        }
    }
}

fn dropped(reason: DropReason) -> Dispatch {
    metrics::record_frame_dropped(reason);
    Dispatch::Dropped(reason)
}

fn log_info(frame: &ControlFrame) {
    let msg = frame.msg.as_deref().unwrap_or_default();
    match frame.code {
        Some(INFO_RESTART) => {
            tracing::warn!(code = INFO_RESTART, msg, "Server restarting, reconnect required");
        }
        Some(INFO_MAINTENANCE_START) => {
            tracing::warn!(code = INFO_MAINTENANCE_START, msg, "Server entering maintenance");
        }
        Some(INFO_MAINTENANCE_END) => {
            tracing::info!(code = INFO_MAINTENANCE_END, msg, "Server maintenance ended");
        }
        Some(code) => tracing::info!(code, msg, "Server info"),
        None => tracing::debug!(version = frame.version, "Server info"),
    }
}
