//! Port Interfaces
//!
//! Defines the interfaces (ports) between the application services and the
//! WebSocket infrastructure, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FrameSink`: raw text send path of one WebSocket session
//! - `RequestChannel`: correlated request/reply exchange over that session

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::protocol::{ControlFrame, OutboundRequest};
use crate::domain::streaming::ErrorKind;

// =============================================================================
// Errors
// =============================================================================

/// Failure to hand a frame to the socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// No session is open.
    #[error("not connected")]
    NotConnected,

    /// The session closed before the frame could be written.
    #[error("connection closed")]
    Closed,
}

/// Failure of a correlated request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// No reply arrived before the deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The session ended while the request was outstanding.
    #[error("connection lost while awaiting reply")]
    ConnectionLost,

    /// The caller cancelled the wait.
    #[error("request cancelled")]
    Cancelled,

    /// No session is open.
    #[error("not connected")]
    NotConnected,
}

impl CorrelationError {
    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConnectionLost => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotConnected => ErrorKind::State,
        }
    }
}

impl From<SinkError> for CorrelationError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::NotConnected => Self::NotConnected,
            SinkError::Closed => Self::ConnectionLost,
        }
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Outbound text path of a WebSocket session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue a text frame for the socket writer.
    ///
    /// # Errors
    ///
    /// Returns an error if no session is open or the session has closed.
    async fn send_text(&self, text: String) -> Result<(), SinkError>;

    /// Token cancelled when the current session ends, `None` when no session
    /// is open.
    fn closed_signal(&self) -> Option<CancellationToken>;

    /// Whether a session is open.
    fn is_open(&self) -> bool;
}

/// Correlated request/reply exchange over a feed without request ids.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Send a request and wait for the next control frame.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, cancellation, or loss of the session.
    async fn send_and_await(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<ControlFrame, CorrelationError>;

    /// Send a request without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be written.
    async fn send(&self, request: OutboundRequest) -> Result<(), CorrelationError>;

    /// Whether a session is open.
    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_errors_map_to_correlation_errors() {
        assert_eq!(
            CorrelationError::from(SinkError::NotConnected),
            CorrelationError::NotConnected
        );
        assert_eq!(
            CorrelationError::from(SinkError::Closed),
            CorrelationError::ConnectionLost
        );
    }

    #[test]
    fn correlation_error_kinds() {
        assert_eq!(
            CorrelationError::Timeout(Duration::from_secs(30)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(CorrelationError::ConnectionLost.kind(), ErrorKind::Transport);
        assert_eq!(CorrelationError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(CorrelationError::NotConnected.kind(), ErrorKind::State);
    }
}
