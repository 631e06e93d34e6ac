#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Exchange Stream Client - Authenticated Multiplexed WebSocket Client
//!
//! A client for a channel-id multiplexed exchange feed. One WebSocket
//! session carries every public subscription (tickers, trades, order books,
//! candles) plus the authenticated account channel.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Wire-independent types
//!   - `protocol`: Control frames and outbound requests
//!   - `streaming`: Market and account events
//!   - `subscription`: Subscription keys, channel bindings, batch queue
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Frame sink and request channel interfaces
//!   - `services`: Subscription registry and batch subscriber
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `exchange`: Connection manager, correlator, codec, dispatcher, client
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus counters
//!   - `telemetry`: Tracing setup
//!
//! # Data Flow
//!
//! ```text
//!                 ┌────────────┐   frames   ┌────────────┐  StreamEvent
//! Exchange WS ───►│ Connection │───────────►│ Dispatcher │──────────────► consumer
//!             ◄───│  Manager   │            └─────┬──────┘
//!                 └─────▲──────┘          replies │ acks
//!                       │ send              ┌─────▼──────┐
//!                       └───────────────────│ Correlator │◄── subscribe / auth / ping
//!                                           └────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Protocol and streaming types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::protocol::{ChannelId, ControlEvent, ControlFrame, OutboundRequest, Rejection};
pub use domain::streaming::{
    AccountEvent, AccountPayload, ErrorKind, MarketEvent, MarketPayload, StreamError, StreamEvent,
};
pub use domain::subscription::{Channel, ChannelBindings, EnqueueOutcome, SubscriptionKey};

// Application
pub use application::ports::CorrelationError;
pub use application::services::{SubscribeError, UnsubscribeError};

// Client
pub use infrastructure::exchange::{
    AuthError, AuthState, ClientConfig, ConnectError, Credentials, PingError, StreamClient,
    Subscription,
};

// Infrastructure config
pub use infrastructure::config::{ClientSettings, ConfigError, ReconnectSettings};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
