//! Domain Layer - Core protocol and streaming types.
//!
//! This layer contains the core domain types for the streaming client with
//! no I/O. Everything here is pure Rust with serialization support.

/// Control frame and outbound request types.
pub mod protocol;

/// Market and account data types (tickers, trades, book, candles, orders).
pub mod streaming;

/// Subscription keys, channel bindings and the batch queue.
pub mod subscription;
