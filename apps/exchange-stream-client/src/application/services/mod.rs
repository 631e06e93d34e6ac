//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionRegistry`: correlated subscribe/unsubscribe and channel-id resolution
//! - `BatchSubscriber`: queued subscription changes flushed on an interval

pub mod batcher;
pub mod registry;

pub use batcher::{BatchConfig, BatchSubscriber, FlushReport};
pub use registry::{AckOutcome, SubscribeError, SubscriptionRegistry, UnsubscribeError};
