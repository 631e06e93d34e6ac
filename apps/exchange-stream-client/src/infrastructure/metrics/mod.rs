//! Prometheus Metrics Module
//!
//! Counters and gauges for the stream client. Recording is a no-op until a
//! recorder is installed, so library users who never call [`init_metrics`]
//! pay nothing.
//!
//! # Metrics
//!
//! - `stream_client_frames_total{kind}`: inbound frames by classification
//! - `stream_client_frames_dropped_total{reason}`: frames that produced no event
//! - `stream_client_decode_errors_total`: malformed or undecodable frames
//! - `stream_client_requests_total{request, outcome}`: correlated requests
//! - `stream_client_request_seconds{request}`: request round-trip latency
//! - `stream_client_subscriptions`: active channel bindings
//! - `stream_client_disconnects_total{reason}`: sessions that ended

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// =============================================================================
// Installation
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Calling this again after a successful install is a no-op.
///
/// # Errors
///
/// Returns an error if the recorder or the listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<SocketAddr, BuildError> {
    if let Some(addr) = INSTALLED.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    Ok(*INSTALLED.get_or_init(|| addr))
}

fn register_metrics() {
    describe_counter!(
        "stream_client_frames_total",
        "Inbound WebSocket frames by classification"
    );
    describe_counter!(
        "stream_client_frames_dropped_total",
        "Inbound frames dropped without producing an event"
    );
    describe_counter!(
        "stream_client_decode_errors_total",
        "Frames that failed to parse or decode"
    );
    describe_counter!(
        "stream_client_requests_total",
        "Correlated control requests by outcome"
    );
    describe_histogram!(
        "stream_client_request_seconds",
        "Time from request send to reply"
    );
    describe_gauge!(
        "stream_client_subscriptions",
        "Active channel bindings"
    );
    describe_counter!(
        "stream_client_disconnects_total",
        "WebSocket sessions that ended"
    );
}

// =============================================================================
// Labels
// =============================================================================

/// Inbound frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JSON object root.
    Control,
    /// JSON array root with a payload.
    Data,
    /// `[chanId, "hb"]`.
    Heartbeat,
}

impl FrameKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Data => "data",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Why a frame produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Data for a channel id with no binding.
    UnknownChannel,
    /// Control frame with no outstanding request.
    Unsolicited,
    /// Informational control frame.
    Info,
    /// Heartbeat data frame.
    Heartbeat,
    /// Public trade update repeating an earlier execution.
    Duplicate,
    /// Tagged frame this client does not decode (book checksums).
    Unsupported,
    /// The event queue was full.
    QueueFull,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownChannel => "unknown_channel",
            Self::Unsolicited => "unsolicited",
            Self::Info => "info",
            Self::Heartbeat => "heartbeat",
            Self::Duplicate => "duplicate",
            Self::Unsupported => "unsupported",
            Self::QueueFull => "queue_full",
        }
    }
}

/// Terminal outcome of a correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A reply was delivered.
    Replied,
    /// The deadline elapsed.
    Timeout,
    /// The caller cancelled.
    Cancelled,
    /// The session ended.
    ConnectionLost,
}

impl RequestOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Replied => "replied",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

// =============================================================================
// Recording
// =============================================================================

/// Record an inbound frame.
pub fn record_frame(kind: FrameKind) {
    counter!("stream_client_frames_total", "kind" => kind.as_str()).increment(1);
}

/// Record a frame that produced no event.
pub fn record_frame_dropped(reason: DropReason) {
    counter!("stream_client_frames_dropped_total", "reason" => reason.as_str()).increment(1);
}

/// Record a frame that failed to parse or decode.
pub fn record_decode_error() {
    counter!("stream_client_decode_errors_total").increment(1);
}

/// Record the outcome and latency of a correlated request.
pub fn record_request(request: &'static str, outcome: RequestOutcome, elapsed: Duration) {
    counter!(
        "stream_client_requests_total",
        "request" => request,
        "outcome" => outcome.as_str()
    )
    .increment(1);

    if outcome == RequestOutcome::Replied {
        histogram!("stream_client_request_seconds", "request" => request)
            .record(elapsed.as_secs_f64());
    }
}

/// Update the active binding count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscriptions(count: usize) {
    gauge!("stream_client_subscriptions").set(count as f64);
}

/// Record the end of a session.
pub fn record_disconnect(reason: &'static str) {
    counter!("stream_client_disconnects_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values() {
        assert_eq!(FrameKind::Heartbeat.as_str(), "heartbeat");
        assert_eq!(DropReason::UnknownChannel.as_str(), "unknown_channel");
        assert_eq!(DropReason::QueueFull.as_str(), "queue_full");
        assert_eq!(RequestOutcome::ConnectionLost.as_str(), "connection_lost");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_frame(FrameKind::Data);
        record_frame_dropped(DropReason::Info);
        record_decode_error();
        record_request("subscribe", RequestOutcome::Replied, Duration::from_millis(5));
        set_subscriptions(3);
        record_disconnect("closed");
    }
}
