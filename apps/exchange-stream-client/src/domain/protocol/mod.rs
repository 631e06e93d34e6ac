//! Protocol Frame Types
//!
//! Control frames exchanged with the exchange over the WebSocket session.
//! Control frames are JSON objects keyed by an `event` name; data frames are
//! JSON arrays and are handled by the dispatcher, not modelled here.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {"event":"subscribe","channel":"ticker","pair":"BTCUSD"}
//! {"event":"subscribed","channel":"ticker","pair":"BTCUSD","chanId":"5"}
//! {"event":"unsubscribe","chanId":"5"}
//! {"event":"error","code":10300,"msg":"subscribe: failed"}
//! {"event":"info","version":2}
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::domain::subscription::{Channel, SubscriptionKey};

// =============================================================================
// Channel Identifier
// =============================================================================

/// Exchange-assigned opaque channel identifier.
///
/// Exchanges send channel ids either as JSON integers or as strings. The
/// textual form is the identity; the numeric flag only controls how the id is
/// written back on the wire.
#[derive(Clone)]
pub struct ChannelId {
    text: String,
    numeric: bool,
}

impl ChannelId {
    /// Create a channel id from its textual form.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            numeric: false,
        }
    }

    /// Create a channel id that is written back as a JSON integer.
    #[must_use]
    pub fn numeric(id: u64) -> Self {
        Self {
            text: id.to_string(),
            numeric: true,
        }
    }

    /// Read a channel id from a JSON value (string or non-negative integer).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::new(s.clone())),
            Value::Number(n) => n.as_u64().map(Self::numeric),
            _ => None,
        }
    }

    /// Textual form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the id is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Whether this is the account (private feed) channel `0`.
    #[must_use]
    pub fn is_account_channel(&self) -> bool {
        self.text == "0"
    }

    fn to_value(&self) -> Value {
        if self.numeric
            && let Ok(n) = self.text.parse::<u64>()
        {
            return Value::from(n);
        }
        Value::String(self.text.clone())
    }
}

impl PartialEq for ChannelId {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for ChannelId {}

impl Hash for ChannelId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.text)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid channel id: {value}")))
    }
}

// =============================================================================
// Control Events
// =============================================================================

/// Event name carried by every control frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ControlEvent {
    /// Client subscribe request.
    Subscribe,
    /// Client unsubscribe request.
    Unsubscribe,
    /// Subscribe acknowledgement.
    Subscribed,
    /// Unsubscribe acknowledgement.
    Unsubscribed,
    /// Error reply.
    Error,
    /// Unsolicited server information (version banner, maintenance notices).
    Info,
    /// Client ping.
    Ping,
    /// Server pong.
    Pong,
    /// Authentication request or reply.
    Auth,
    /// Any event this client does not know.
    Unknown(String),
}

impl ControlEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Error => "error",
            Self::Info => "info",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Auth => "auth",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for ControlEvent {
    fn from(s: String) -> Self {
        match s.as_str() {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "subscribed" => Self::Subscribed,
            "unsubscribed" => Self::Unsubscribed,
            "error" => Self::Error,
            "info" => Self::Info,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "auth" => Self::Auth,
            _ => Self::Unknown(s),
        }
    }
}

impl From<ControlEvent> for String {
    fn from(event: ControlEvent) -> Self {
        event.as_str().to_string()
    }
}

// =============================================================================
// Control Frame
// =============================================================================

/// Explicit rejection carried by a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Exchange error code, when one was sent.
    pub code: Option<i64>,
    /// Exchange error text.
    pub message: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "({code}) {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A decoded JSON-object frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Event name.
    pub event: ControlEvent,

    /// Channel name (`ticker`, `book`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Channel id assigned by the exchange.
    #[serde(default, rename = "chanId", skip_serializing_if = "Option::is_none")]
    pub chan_id: Option<ChannelId>,

    /// Instrument identifier.
    #[serde(default, alias = "instId", skip_serializing_if = "Option::is_none")]
    pub pair: Option<String>,

    /// Book precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prec: Option<String>,

    /// Composite channel key (candles).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Error or information code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,

    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Status (`OK` / `FAILED`) on auth replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Authenticated user id on auth replies.
    #[serde(default, rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,

    /// Client id echoed on `pong`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,

    /// Protocol version on `info`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl ControlFrame {
    /// Create a bare frame with only an event name.
    #[must_use]
    pub const fn new(event: ControlEvent) -> Self {
        Self {
            event,
            channel: None,
            chan_id: None,
            pair: None,
            prec: None,
            key: None,
            code: None,
            msg: None,
            status: None,
            user_id: None,
            cid: None,
            version: None,
        }
    }

    /// Whether this is the unsolicited `info` event.
    #[must_use]
    pub fn is_info(&self) -> bool {
        self.event == ControlEvent::Info
    }

    /// Whether this frame acknowledges a subscribe or unsubscribe.
    #[must_use]
    pub fn is_subscription_ack(&self) -> bool {
        matches!(
            self.event,
            ControlEvent::Subscribed | ControlEvent::Unsubscribed
        )
    }

    /// The explicit rejection this frame carries, if any.
    ///
    /// A frame is a rejection when it is an `error` event, carries an error
    /// code, or reports a `FAILED` status.
    #[must_use]
    pub fn rejection(&self) -> Option<Rejection> {
        let failed_status = self
            .status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("failed"));

        if self.event == ControlEvent::Error || self.code.is_some() || failed_status {
            return Some(Rejection {
                code: self.code,
                message: self.msg.clone().unwrap_or_default(),
            });
        }
        None
    }

    /// The non-empty channel id carried by this frame.
    #[must_use]
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.chan_id.as_ref().filter(|id| !id.is_empty())
    }

    /// Rebuild the subscription key a `subscribed` ack refers to.
    ///
    /// Candle acks carry `key = "trade:<timeframe>:t<instrument>"` instead of
    /// a pair.
    #[must_use]
    pub fn subscription_key(&self) -> Option<SubscriptionKey> {
        let channel = Channel::from_wire(self.channel.as_deref()?)?;

        match channel {
            Channel::Candles => {
                let mut parts = self.key.as_deref()?.splitn(3, ':');
                let _kind = parts.next()?;
                let timeframe = parts.next()?;
                let symbol = parts.next()?;
                let instrument = symbol.strip_prefix('t').unwrap_or(symbol);
                Some(SubscriptionKey::candles(instrument, timeframe))
            }
            Channel::Book => {
                let prec = self.prec.clone().unwrap_or_else(|| "P0".to_string());
                Some(SubscriptionKey::book(self.pair.clone()?, prec))
            }
            Channel::Ticker | Channel::Trades => {
                Some(SubscriptionKey::new(channel, self.pair.clone()?, None))
            }
        }
    }
}

// =============================================================================
// Outbound Requests
// =============================================================================

/// Authentication fields sent with an `auth` request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Public API key.
    pub api_key: String,
    /// Hex-encoded HMAC signature of `payload`.
    pub signature: String,
    /// Strictly increasing nonce.
    pub nonce: u64,
    /// Signed payload (`"AUTH" + nonce`).
    pub payload: String,
}

impl fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPayload")
            .field("api_key", &self.api_key)
            .field("signature", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Client-to-server control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRequest {
    /// Subscribe to a single channel.
    Subscribe(SubscriptionKey),
    /// Unsubscribe by channel id.
    Unsubscribe(ChannelId),
    /// Subscribe to several channels in one frame.
    BatchSubscribe(Vec<SubscriptionKey>),
    /// Unsubscribe several channels in one frame.
    BatchUnsubscribe(Vec<SubscriptionKey>),
    /// Authenticate the session.
    Auth(AuthPayload),
    /// Protocol-level ping.
    Ping {
        /// Client id echoed by the `pong`.
        cid: u64,
    },
}

impl OutboundRequest {
    /// Short name used for logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::BatchSubscribe(_) => "batch_subscribe",
            Self::BatchUnsubscribe(_) => "batch_unsubscribe",
            Self::Auth(_) => "auth",
            Self::Ping { .. } => "ping",
        }
    }

    /// Build the JSON frame for this request.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Subscribe(key) => {
                let mut frame = subscription_args(key);
                frame["event"] = json!("subscribe");
                frame
            }
            Self::Unsubscribe(id) => json!({
                "event": "unsubscribe",
                "chanId": id,
            }),
            Self::BatchSubscribe(keys) => json!({
                "event": "subscribe",
                "args": keys.iter().map(subscription_args).collect::<Vec<_>>(),
            }),
            Self::BatchUnsubscribe(keys) => json!({
                "event": "unsubscribe",
                "args": keys.iter().map(subscription_args).collect::<Vec<_>>(),
            }),
            Self::Auth(auth) => json!({
                "event": "auth",
                "apiKey": auth.api_key,
                "authSig": auth.signature,
                "authNonce": auth.nonce,
                "authPayload": auth.payload,
            }),
            Self::Ping { cid } => json!({
                "event": "ping",
                "cid": cid,
            }),
        }
    }

    /// Serialize the request to a JSON string.
    #[must_use]
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Channel arguments identifying one subscription on the wire.
fn subscription_args(key: &SubscriptionKey) -> Value {
    let mut args = json!({ "channel": key.channel.as_str() });

    match key.channel {
        Channel::Candles => {
            let timeframe = key.aux.as_deref().unwrap_or("1m");
            args["key"] = json!(format!("trade:{timeframe}:t{}", key.instrument));
        }
        Channel::Book => {
            args["pair"] = json!(key.instrument);
            if let Some(prec) = &key.aux {
                args["prec"] = json!(prec);
            }
        }
        Channel::Ticker | Channel::Trades => {
            args["pair"] = json!(key.instrument);
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_accepts_string_and_integer() {
        let from_str: ChannelId = serde_json::from_str(r#""5""#).unwrap();
        let from_int: ChannelId = serde_json::from_str("5").unwrap();
        assert_eq!(from_str, from_int);
        assert_eq!(from_int.as_str(), "5");
    }

    #[test]
    fn channel_id_round_trips_original_form() {
        let numeric = ChannelId::numeric(17);
        assert_eq!(serde_json::to_string(&numeric).unwrap(), "17");

        let text = ChannelId::new("17");
        assert_eq!(serde_json::to_string(&text).unwrap(), r#""17""#);
    }

    #[test]
    fn channel_id_rejects_objects() {
        assert!(serde_json::from_str::<ChannelId>("{}").is_err());
        assert!(ChannelId::from_value(&json!(-3)).is_none());
    }

    #[test]
    fn control_event_unknown_is_preserved() {
        let event = ControlEvent::from("conf".to_string());
        assert_eq!(event, ControlEvent::Unknown("conf".to_string()));
        assert_eq!(event.as_str(), "conf");
    }

    #[test]
    fn subscribed_ack_decodes() {
        let frame: ControlFrame = serde_json::from_str(
            r#"{"event":"subscribed","channel":"ticker","pair":"BTCUSD","chanId":"5"}"#,
        )
        .unwrap();

        assert_eq!(frame.event, ControlEvent::Subscribed);
        assert_eq!(frame.channel_id(), Some(&ChannelId::new("5")));
        assert!(frame.rejection().is_none());
        assert!(frame.is_subscription_ack());
    }

    #[test]
    fn inst_id_alias_maps_to_pair() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"event":"subscribed","instId":"BTC-USDT"}"#).unwrap();
        assert_eq!(frame.pair.as_deref(), Some("BTC-USDT"));
    }

    #[test]
    fn empty_channel_id_is_treated_as_missing() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"event":"subscribed","chanId":""}"#).unwrap();
        assert!(frame.channel_id().is_none());
    }

    #[test]
    fn ack_rebuilds_subscription_key() {
        let ticker: ControlFrame = serde_json::from_str(
            r#"{"event":"subscribed","channel":"ticker","pair":"BTCUSD","chanId":5}"#,
        )
        .unwrap();
        assert_eq!(
            ticker.subscription_key(),
            Some(SubscriptionKey::ticker("BTCUSD"))
        );

        let book: ControlFrame = serde_json::from_str(
            r#"{"event":"subscribed","channel":"book","pair":"ETHUSD","prec":"P2","chanId":6}"#,
        )
        .unwrap();
        assert_eq!(
            book.subscription_key(),
            Some(SubscriptionKey::book("ETHUSD", "P2"))
        );

        let candles: ControlFrame = serde_json::from_str(
            r#"{"event":"subscribed","channel":"candles","key":"trade:1h:tBTCUSD","chanId":7}"#,
        )
        .unwrap();
        assert_eq!(
            candles.subscription_key(),
            Some(SubscriptionKey::candles("BTCUSD", "1h"))
        );
    }

    #[test]
    fn ack_without_channel_has_no_key() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"event":"subscribed","chanId":5}"#).unwrap();
        assert!(frame.subscription_key().is_none());
    }

    #[test]
    fn error_frame_is_rejection() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"event":"error","code":10300,"msg":"subscribe: dup"}"#)
                .unwrap();
        let rejection = frame.rejection().unwrap();
        assert_eq!(rejection.code, Some(10300));
        assert_eq!(rejection.message, "subscribe: dup");
    }

    #[test]
    fn failed_auth_is_rejection() {
        let frame: ControlFrame =
            serde_json::from_str(r#"{"event":"auth","status":"FAILED","msg":"apikey: invalid"}"#)
                .unwrap();
        let rejection = frame.rejection().unwrap();
        assert_eq!(rejection.code, None);
        assert_eq!(rejection.message, "apikey: invalid");
    }

    #[test]
    fn subscribe_request_wire_shape() {
        let request = OutboundRequest::Subscribe(SubscriptionKey::ticker("BTCUSD"));
        assert_eq!(
            request.to_value(),
            json!({"event": "subscribe", "channel": "ticker", "pair": "BTCUSD"})
        );
    }

    #[test]
    fn book_and_candle_requests_carry_aux() {
        let book = OutboundRequest::Subscribe(SubscriptionKey::book("ETHUSD", "P1"));
        assert_eq!(book.to_value()["prec"], json!("P1"));

        let candles = OutboundRequest::Subscribe(SubscriptionKey::candles("BTCUSD", "5m"));
        assert_eq!(candles.to_value()["key"], json!("trade:5m:tBTCUSD"));
    }

    #[test]
    fn unsubscribe_request_keeps_numeric_id() {
        let request = OutboundRequest::Unsubscribe(ChannelId::numeric(42));
        assert_eq!(
            request.to_value(),
            json!({"event": "unsubscribe", "chanId": 42})
        );
    }

    #[test]
    fn batch_request_lists_args() {
        let request = OutboundRequest::BatchSubscribe(vec![
            SubscriptionKey::ticker("BTCUSD"),
            SubscriptionKey::trades("ETHUSD"),
        ]);
        let value = request.to_value();
        assert_eq!(value["event"], json!("subscribe"));
        assert_eq!(value["args"].as_array().unwrap().len(), 2);
        assert_eq!(value["args"][1]["channel"], json!("trades"));
    }

    #[test]
    fn auth_request_wire_shape_and_redaction() {
        let payload = AuthPayload {
            api_key: "key".to_string(),
            signature: "abcdef".to_string(),
            nonce: 1_000,
            payload: "AUTH1000".to_string(),
        };
        let value = OutboundRequest::Auth(payload.clone()).to_value();
        assert_eq!(value["event"], json!("auth"));
        assert_eq!(value["authSig"], json!("abcdef"));
        assert_eq!(value["authNonce"], json!(1_000));
        assert_eq!(value["authPayload"], json!("AUTH1000"));

        let debug = format!("{payload:?}");
        assert!(!debug.contains("abcdef"));
    }
}
