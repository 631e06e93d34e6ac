//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with the WebSocket session.

/// Port interfaces for the WebSocket session (frame sink, request channel).
pub mod ports;

/// Application services for subscription bookkeeping.
pub mod services;
