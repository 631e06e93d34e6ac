//! Market and Account Streaming Types
//!
//! Core domain types for data decoded from array-shaped frames: tickers,
//! trades, book levels, candles and the private account feed. These types are
//! codec-agnostic and represent the canonical internal representation of the
//! data the client emits.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::protocol::ChannelId;
use crate::domain::subscription::SubscriptionKey;

// =============================================================================
// Public Market Data
// =============================================================================

/// Best bid/ask and daily statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    /// Best bid price.
    pub bid: Decimal,
    /// Size at the best bid.
    pub bid_size: Decimal,
    /// Best ask price.
    pub ask: Decimal,
    /// Size at the best ask.
    pub ask_size: Decimal,
    /// Absolute change over 24h.
    pub daily_change: Decimal,
    /// Relative change over 24h.
    pub daily_change_relative: Decimal,
    /// Last traded price.
    pub last_price: Decimal,
    /// Volume over 24h.
    pub volume: Decimal,
    /// High over 24h.
    pub high: Decimal,
    /// Low over 24h.
    pub low: Decimal,
}

impl Ticker {
    /// Mid price between bid and ask.
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Ask minus bid.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buyer-initiated.
    Buy,
    /// Seller-initiated.
    Sell,
}

impl Side {
    /// Side implied by a signed amount (negative means sell).
    #[must_use]
    pub fn from_amount(amount: Decimal) -> Self {
        if amount.is_sign_negative() {
            Self::Sell
        } else {
            Self::Buy
        }
    }
}

/// Executed public trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade id.
    pub id: i64,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Signed amount (negative for sells).
    pub amount: Decimal,
    /// Execution price.
    pub price: Decimal,
}

impl Trade {
    /// Aggressor side.
    #[must_use]
    pub fn side(&self) -> Side {
        Side::from_amount(self.amount)
    }
}

/// One order book price level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Price of the level.
    pub price: Decimal,
    /// Number of orders at the level.
    pub count: u32,
    /// Signed total amount (positive bids, negative asks).
    pub amount: Decimal,
}

impl BookLevel {
    /// A zero count removes the level from the book.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.count == 0
    }

    /// Whether the level is on the bid side.
    #[must_use]
    pub fn is_bid(&self) -> bool {
        self.amount.is_sign_positive()
    }
}

/// OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time.
    pub timestamp: DateTime<Utc>,
    /// Open price.
    pub open: Decimal,
    /// Close price.
    pub close: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Traded volume.
    pub volume: Decimal,
}

/// Decoded public channel payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPayload {
    /// Ticker update.
    Ticker(Ticker),
    /// One or more trades.
    Trades(Vec<Trade>),
    /// One or more book levels.
    Book(Vec<BookLevel>),
    /// One or more candles.
    Candles(Vec<Candle>),
}

/// A decoded public data frame tied to its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Subscription the channel id resolved to.
    pub key: SubscriptionKey,
    /// Channel id that carried the frame.
    pub channel_id: ChannelId,
    /// Full-state replace (array-of-arrays) rather than a delta.
    pub snapshot: bool,
    /// Decoded payload.
    pub payload: MarketPayload,
}

// =============================================================================
// Private Account Data
// =============================================================================

/// Event-type tag on the account channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountTag {
    /// `ws`
    WalletSnapshot,
    /// `wu`
    WalletUpdate,
    /// `os`
    OrderSnapshot,
    /// `on`
    OrderNew,
    /// `ou`
    OrderUpdate,
    /// `oc`
    OrderCancel,
    /// `ps`
    PositionSnapshot,
    /// `pn`
    PositionNew,
    /// `pu`
    PositionUpdate,
    /// `pc`
    PositionClose,
    /// `te`
    TradeExecuted,
    /// `tu`
    TradeUpdate,
    /// `n`
    Notification,
}

impl AccountTag {
    /// Parse a wire tag.
    #[must_use]
    pub fn from_wire(tag: &str) -> Option<Self> {
        Some(match tag {
            "ws" => Self::WalletSnapshot,
            "wu" => Self::WalletUpdate,
            "os" => Self::OrderSnapshot,
            "on" => Self::OrderNew,
            "ou" => Self::OrderUpdate,
            "oc" => Self::OrderCancel,
            "ps" => Self::PositionSnapshot,
            "pn" => Self::PositionNew,
            "pu" => Self::PositionUpdate,
            "pc" => Self::PositionClose,
            "te" => Self::TradeExecuted,
            "tu" => Self::TradeUpdate,
            "n" => Self::Notification,
            _ => return None,
        })
    }

    /// Wire tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WalletSnapshot => "ws",
            Self::WalletUpdate => "wu",
            Self::OrderSnapshot => "os",
            Self::OrderNew => "on",
            Self::OrderUpdate => "ou",
            Self::OrderCancel => "oc",
            Self::PositionSnapshot => "ps",
            Self::PositionNew => "pn",
            Self::PositionUpdate => "pu",
            Self::PositionClose => "pc",
            Self::TradeExecuted => "te",
            Self::TradeUpdate => "tu",
            Self::Notification => "n",
        }
    }

    /// Whether the tag introduces a full snapshot.
    #[must_use]
    pub const fn is_snapshot(self) -> bool {
        matches!(
            self,
            Self::WalletSnapshot | Self::OrderSnapshot | Self::PositionSnapshot
        )
    }
}

/// Wallet balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet type (`exchange`, `margin`, `funding`).
    pub wallet_type: String,
    /// Currency code.
    pub currency: String,
    /// Total balance.
    pub balance: Decimal,
    /// Unsettled interest.
    pub unsettled_interest: Decimal,
    /// Available balance, when the exchange computed it.
    pub balance_available: Option<Decimal>,
}

/// Order state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id.
    pub id: i64,
    /// Client order id.
    pub client_id: Option<i64>,
    /// Instrument.
    pub symbol: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Remaining signed amount.
    pub amount: Decimal,
    /// Original signed amount.
    pub amount_orig: Decimal,
    /// Order type (`EXCHANGE LIMIT`, ...).
    pub order_type: String,
    /// Status text (`ACTIVE`, `EXECUTED @ ...`, `CANCELED`).
    pub status: String,
    /// Limit price.
    pub price: Decimal,
    /// Average fill price.
    pub price_avg: Decimal,
}

impl Order {
    /// Side implied by the original amount.
    #[must_use]
    pub fn side(&self) -> Side {
        Side::from_amount(self.amount_orig)
    }
}

/// Margin position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument.
    pub symbol: String,
    /// Status (`ACTIVE`, `CLOSED`).
    pub status: String,
    /// Signed position size.
    pub amount: Decimal,
    /// Entry price.
    pub base_price: Decimal,
    /// Profit and loss, when computed.
    pub pl: Option<Decimal>,
    /// Liquidation price, when computed.
    pub liquidation_price: Option<Decimal>,
}

/// Own trade execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Trade id.
    pub id: i64,
    /// Instrument.
    pub symbol: String,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Order the execution belongs to.
    pub order_id: i64,
    /// Signed executed amount.
    pub amount: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Fee, present on `tu` only.
    pub fee: Option<Decimal>,
    /// Fee currency, present on `tu` only.
    pub fee_currency: Option<String>,
}

/// Server notification (order request results, errors).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification time.
    pub timestamp: DateTime<Utc>,
    /// Notification type (`on-req`, `oc-req`, ...).
    pub kind: String,
    /// Status (`SUCCESS`, `ERROR`, ...).
    pub status: String,
    /// Message text.
    pub text: String,
}

/// Decoded account payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountPayload {
    /// Wallet balances.
    Wallets(Vec<Wallet>),
    /// Orders.
    Orders(Vec<Order>),
    /// Positions.
    Positions(Vec<Position>),
    /// Own trade execution.
    Execution(Execution),
    /// Notification.
    Notification(Notification),
}

/// A decoded account-feed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvent {
    /// Event-type tag.
    pub tag: AccountTag,
    /// Full-state replace rather than a delta.
    pub snapshot: bool,
    /// Decoded payload.
    pub payload: AccountPayload,
}

// =============================================================================
// Errors and Stream Events
// =============================================================================

/// Error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Socket-level failure (refused, reset, TLS).
    Transport,
    /// No reply within the deadline.
    Timeout,
    /// Malformed frame or unexpected shape.
    Protocol,
    /// The server refused a request.
    Rejected,
    /// Operation not valid in the current state.
    State,
    /// Caller cancellation.
    Cancelled,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Rejected => "rejected",
            Self::State => "state",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal error observed while processing the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    /// Error category.
    pub kind: ErrorKind,
    /// Description.
    pub message: String,
}

impl StreamError {
    /// Create a protocol error event.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }

    /// Create a transport error event.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: message.into(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Event emitted on the client's typed event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Public market data.
    Market(MarketEvent),
    /// Private account data.
    Account(AccountEvent),
    /// A frame was dropped because it could not be processed.
    Error(StreamError),
    /// The session ended; all channel bindings were invalidated.
    Disconnected {
        /// Why the session ended.
        reason: String,
        /// Subscriptions that were active and must be re-requested.
        lost: Vec<SubscriptionKey>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn market_event_serde_round_trip() {
        let event = MarketEvent {
            key: SubscriptionKey::trades("BTCUSD"),
            channel_id: ChannelId::from_value(&serde_json::json!(9)).unwrap(),
            snapshot: true,
            payload: MarketPayload::Trades(Vec::new()),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"]["channel"], "trades");
        assert_eq!(json["channel_id"], 9);

        let parsed: MarketEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn ticker_mid_and_spread() {
        let ticker = Ticker {
            bid: dec("100.1"),
            bid_size: dec("1"),
            ask: dec("100.2"),
            ask_size: dec("1"),
            daily_change: dec("0"),
            daily_change_relative: dec("0"),
            last_price: dec("100.15"),
            volume: dec("1000"),
            high: dec("110"),
            low: dec("90"),
        };

        assert_eq!(ticker.mid(), dec("100.15"));
        assert_eq!(ticker.spread(), dec("0.1"));
    }

    #[test]
    fn side_from_amount_sign() {
        assert_eq!(Side::from_amount(dec("0.5")), Side::Buy);
        assert_eq!(Side::from_amount(dec("-0.5")), Side::Sell);
    }

    #[test]
    fn book_level_removal_and_side() {
        let removal = BookLevel {
            price: dec("100"),
            count: 0,
            amount: dec("1"),
        };
        assert!(removal.is_removal());
        assert!(removal.is_bid());

        let ask = BookLevel {
            price: dec("101"),
            count: 3,
            amount: dec("-2.5"),
        };
        assert!(!ask.is_removal());
        assert!(!ask.is_bid());
    }

    #[test]
    fn account_tags_round_trip() {
        for tag in [
            "ws", "wu", "os", "on", "ou", "oc", "ps", "pn", "pu", "pc", "te", "tu", "n",
        ] {
            assert_eq!(AccountTag::from_wire(tag).unwrap().as_str(), tag);
        }
        assert!(AccountTag::from_wire("hb").is_none());
    }

    #[test]
    fn snapshot_tags() {
        assert!(AccountTag::OrderSnapshot.is_snapshot());
        assert!(!AccountTag::OrderUpdate.is_snapshot());
    }

    #[test]
    fn error_kind_labels() {
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
        assert_eq!(
            StreamError::protocol("bad frame").to_string(),
            "protocol: bad frame"
        );
    }
}
