//! Subscription Binding Types
//!
//! Domain types for tracking which exchange channel id carries which
//! subscription. The exchange assigns an opaque channel id to every accepted
//! subscription and tags each data frame with it; these bindings let the
//! dispatcher turn a channel id back into the subscription it belongs to.
//!
//! # Design
//!
//! The binding table tracks:
//! - `instrument -> (channel, aux) -> channel id` for lookups by subscription
//! - `channel id -> subscription key` for lookups from data frames
//!
//! Both maps live under one lock so they are always mutated together and
//! every forward entry has exactly one matching reverse entry.

pub mod batch;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::protocol::ChannelId;

pub use batch::{BatchDrain, BatchQueue, EnqueueOutcome};

// =============================================================================
// Types
// =============================================================================

/// Public market-data channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Best bid/ask and daily statistics.
    Ticker,
    /// Executed trades.
    Trades,
    /// Order book price levels.
    Book,
    /// OHLCV candles.
    Candles,
}

impl Channel {
    /// Get all channel kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ticker, Self::Trades, Self::Book, Self::Candles]
    }

    /// Wire name of the channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trades => "trades",
            Self::Book => "book",
            Self::Candles => "candles",
        }
    }

    /// Parse a wire channel name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "ticker" => Some(Self::Ticker),
            "trades" => Some(Self::Trades),
            "book" => Some(Self::Book),
            "candles" => Some(Self::Candles),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one public subscription: channel kind, instrument and an
/// optional auxiliary parameter (book precision, candle timeframe).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Channel kind.
    pub channel: Channel,
    /// Instrument identifier (`BTCUSD`).
    pub instrument: String,
    /// Auxiliary parameter.
    pub aux: Option<String>,
}

impl SubscriptionKey {
    /// Create a key.
    #[must_use]
    pub fn new(channel: Channel, instrument: impl Into<String>, aux: Option<String>) -> Self {
        Self {
            channel,
            instrument: instrument.into(),
            aux,
        }
    }

    /// Ticker subscription.
    #[must_use]
    pub fn ticker(instrument: impl Into<String>) -> Self {
        Self::new(Channel::Ticker, instrument, None)
    }

    /// Trades subscription.
    #[must_use]
    pub fn trades(instrument: impl Into<String>) -> Self {
        Self::new(Channel::Trades, instrument, None)
    }

    /// Book subscription at the given precision (`P0`..`P4`, `R0`).
    #[must_use]
    pub fn book(instrument: impl Into<String>, precision: impl Into<String>) -> Self {
        Self::new(Channel::Book, instrument, Some(precision.into()))
    }

    /// Candle subscription at the given timeframe (`1m`, `1h`, ...).
    #[must_use]
    pub fn candles(instrument: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self::new(Channel::Candles, instrument, Some(timeframe.into()))
    }

    fn topic(&self) -> Topic {
        Topic {
            channel: self.channel,
            aux: self.aux.clone(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.instrument)?;
        if let Some(aux) = &self.aux {
            write!(f, ":{aux}")?;
        }
        Ok(())
    }
}

/// Error parsing a `channel:instrument[:aux]` subscription string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseKeyError {
    /// The channel name is not known.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The instrument part is missing or empty.
    #[error("missing instrument in subscription: {0}")]
    MissingInstrument(String),
}

impl FromStr for SubscriptionKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let channel_name = parts.next().unwrap_or_default();
        let channel = Channel::from_wire(channel_name)
            .ok_or_else(|| ParseKeyError::UnknownChannel(channel_name.to_string()))?;

        let instrument = parts
            .next()
            .filter(|i| !i.is_empty())
            .ok_or_else(|| ParseKeyError::MissingInstrument(s.to_string()))?;

        let aux = parts.next().filter(|a| !a.is_empty()).map(str::to_string);
        let aux = match (channel, aux) {
            (Channel::Book, None) => Some("P0".to_string()),
            (Channel::Candles, None) => Some("1m".to_string()),
            (_, aux) => aux,
        };

        Ok(Self::new(channel, instrument, aux))
    }
}

/// Per-instrument part of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Topic {
    channel: Channel,
    aux: Option<String>,
}

// =============================================================================
// Binding State
// =============================================================================

#[derive(Debug, Default)]
struct BindingState {
    /// instrument -> topic -> channel id.
    by_instrument: HashMap<String, HashMap<Topic, ChannelId>>,
    /// channel id -> key.
    by_id: HashMap<ChannelId, SubscriptionKey>,
}

impl BindingState {
    fn remove_forward(&mut self, key: &SubscriptionKey) -> Option<ChannelId> {
        let topics = self.by_instrument.get_mut(&key.instrument)?;
        let removed = topics.remove(&key.topic());

        // Clean up empty instrument entry
        if topics.is_empty() {
            self.by_instrument.remove(&key.instrument);
        }

        removed
    }

    #[cfg(test)]
    fn forward_len(&self) -> usize {
        self.by_instrument.values().map(HashMap::len).sum()
    }
}

// =============================================================================
// Channel Bindings
// =============================================================================

/// Thread-safe two-way map between subscriptions and channel ids.
///
/// # Example
///
/// ```rust
/// use exchange_stream_client::domain::protocol::ChannelId;
/// use exchange_stream_client::domain::subscription::{ChannelBindings, SubscriptionKey};
///
/// let bindings = ChannelBindings::new();
/// let key = SubscriptionKey::ticker("BTCUSD");
///
/// bindings.bind(key.clone(), ChannelId::new("5"));
/// assert_eq!(bindings.resolve(&ChannelId::new("5")), Some(key.clone()));
///
/// bindings.unbind(&key);
/// assert!(bindings.resolve(&ChannelId::new("5")).is_none());
/// ```
#[derive(Debug, Default)]
pub struct ChannelBindings {
    state: RwLock<BindingState>,
}

impl ChannelBindings {
    /// Create an empty binding table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a key to a channel id.
    ///
    /// Rebinding a key replaces its previous id, and binding an id that was
    /// held by another key evicts that key. Returns the key's previous id.
    pub fn bind(&self, key: SubscriptionKey, id: ChannelId) -> Option<ChannelId> {
        let mut state = self.state.write();

        if let Some(stale) = state.by_id.remove(&id)
            && stale != key
        {
            state.remove_forward(&stale);
        }

        let previous = state
            .by_instrument
            .entry(key.instrument.clone())
            .or_default()
            .insert(key.topic(), id.clone());

        if let Some(prev) = &previous
            && prev != &id
        {
            state.by_id.remove(prev);
        }

        state.by_id.insert(id, key);
        previous
    }

    /// Remove a key's binding. Returns the id it was bound to.
    pub fn unbind(&self, key: &SubscriptionKey) -> Option<ChannelId> {
        let mut state = self.state.write();
        let id = state.remove_forward(key)?;
        state.by_id.remove(&id);
        Some(id)
    }

    /// Remove the binding for a channel id. Returns the key it carried.
    pub fn unbind_id(&self, id: &ChannelId) -> Option<SubscriptionKey> {
        let mut state = self.state.write();
        let key = state.by_id.remove(id)?;
        state.remove_forward(&key);
        Some(key)
    }

    /// Resolve a channel id to its subscription.
    #[must_use]
    pub fn resolve(&self, id: &ChannelId) -> Option<SubscriptionKey> {
        self.state.read().by_id.get(id).cloned()
    }

    /// Channel id currently bound to a key.
    #[must_use]
    pub fn channel_id(&self, key: &SubscriptionKey) -> Option<ChannelId> {
        self.state
            .read()
            .by_instrument
            .get(&key.instrument)
            .and_then(|topics| topics.get(&key.topic()))
            .cloned()
    }

    /// Whether a key is bound.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.channel_id(key).is_some()
    }

    /// All bound keys for one instrument.
    #[must_use]
    pub fn instrument_keys(&self, instrument: &str) -> Vec<SubscriptionKey> {
        self.state
            .read()
            .by_instrument
            .get(instrument)
            .map(|topics| {
                topics
                    .keys()
                    .map(|topic| SubscriptionKey::new(topic.channel, instrument, topic.aux.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All bound keys.
    #[must_use]
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.state.read().by_id.values().cloned().collect()
    }

    /// Drop every binding. Returns the keys that were bound.
    pub fn clear(&self) -> Vec<SubscriptionKey> {
        let mut state = self.state.write();
        state.by_instrument.clear();
        let mut lost: Vec<_> = state.by_id.drain().map(|(_, key)| key).collect();
        lost.sort();
        lost
    }

    /// Number of bound channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    /// Whether nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().by_id.is_empty()
    }

    /// Get binding statistics.
    #[must_use]
    pub fn stats(&self) -> BindingStats {
        let state = self.state.read();
        BindingStats {
            channel_count: state.by_id.len(),
            instrument_count: state.by_instrument.len(),
        }
    }

    /// Whether the forward and reverse maps agree.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let state = self.state.read();
        state.forward_len() == state.by_id.len()
            && state.by_id.iter().all(|(id, key)| {
                state
                    .by_instrument
                    .get(&key.instrument)
                    .and_then(|topics| topics.get(&key.topic()))
                    == Some(id)
            })
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Binding table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingStats {
    /// Number of bound channel ids.
    pub channel_count: usize,
    /// Number of distinct instruments with at least one binding.
    pub instrument_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
