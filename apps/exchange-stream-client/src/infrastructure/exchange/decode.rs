//! Payload Decoders
//!
//! Field-layout decoding for data frame payloads. Public channels are
//! decoded by channel kind, the account channel by event-type tag. A payload
//! whose first element is itself an array is a multi-row snapshot; a flat
//! array is a single-row update.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::streaming::{
    AccountEvent, AccountPayload, AccountTag, BookLevel, Candle, Execution, MarketPayload,
    Notification, Order, Position, Ticker, Trade, Wallet,
};
use crate::domain::subscription::Channel;

/// Decode errors for a single payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not an array.
    #[error("expected array payload, got {0}")]
    NotArray(String),

    /// A row has fewer fields than the layout needs.
    #[error("row too short: need {expected} fields, got {actual}")]
    TooShort {
        /// Fields required.
        expected: usize,
        /// Fields present.
        actual: usize,
    },

    /// A field has the wrong type or cannot be parsed.
    #[error("field {index}: {reason}")]
    Field {
        /// Position in the row.
        index: usize,
        /// What was wrong.
        reason: String,
    },

    /// The account tag is not known.
    #[error("unknown account tag: {0}")]
    UnknownTag(String),
}

// =============================================================================
// Shape
// =============================================================================

/// Payload rows and whether they form a snapshot.
#[derive(Debug)]
struct Rows<'a> {
    snapshot: bool,
    rows: Vec<&'a [Value]>,
}

fn rows(payload: &Value) -> Result<Rows<'_>, DecodeError> {
    let Value::Array(items) = payload else {
        return Err(DecodeError::NotArray(kind_of(payload).to_string()));
    };

    if items.first().is_some_and(Value::is_array) {
        let rows = items
            .iter()
            .enumerate()
            .map(|(index, row)| {
                row.as_array().map(Vec::as_slice).ok_or_else(|| DecodeError::Field {
                    index,
                    reason: format!("expected row array, got {}", kind_of(row)),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Rows {
            snapshot: true,
            rows,
        });
    }

    Ok(Rows {
        snapshot: false,
        rows: vec![items.as_slice()],
    })
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Field Readers
// =============================================================================

fn require(row: &[Value], expected: usize) -> Result<(), DecodeError> {
    if row.len() < expected {
        return Err(DecodeError::TooShort {
            expected,
            actual: row.len(),
        });
    }
    Ok(())
}

fn field_error(index: usize, reason: impl Into<String>) -> DecodeError {
    DecodeError::Field {
        index,
        reason: reason.into(),
    }
}

fn opt_decimal(row: &[Value], index: usize) -> Result<Option<Decimal>, DecodeError> {
    let text = match row.get(index) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(field_error(
                index,
                format!("expected number, got {}", kind_of(other)),
            ));
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map(Some)
        .map_err(|e| field_error(index, format!("invalid decimal {text}: {e}")))
}

fn decimal(row: &[Value], index: usize) -> Result<Decimal, DecodeError> {
    opt_decimal(row, index)?.ok_or_else(|| field_error(index, "missing decimal"))
}

fn opt_integer(row: &[Value], index: usize) -> Result<Option<i64>, DecodeError> {
    match row.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| field_error(index, format!("expected integer, got {n}"))),
        Some(other) => Err(field_error(
            index,
            format!("expected integer, got {}", kind_of(other)),
        )),
    }
}

fn integer(row: &[Value], index: usize) -> Result<i64, DecodeError> {
    opt_integer(row, index)?.ok_or_else(|| field_error(index, "missing integer"))
}

fn count(row: &[Value], index: usize) -> Result<u32, DecodeError> {
    let value = integer(row, index)?;
    u32::try_from(value).map_err(|_| field_error(index, format!("count out of range: {value}")))
}

fn opt_text(row: &[Value], index: usize) -> Option<String> {
    row.get(index).and_then(Value::as_str).map(str::to_string)
}

fn text(row: &[Value], index: usize) -> Result<String, DecodeError> {
    opt_text(row, index).ok_or_else(|| field_error(index, "expected string"))
}

fn timestamp(row: &[Value], index: usize) -> Result<DateTime<Utc>, DecodeError> {
    let millis = integer(row, index)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| field_error(index, format!("timestamp out of range: {millis}")))
}

// =============================================================================
// Public Channels
// =============================================================================

/// Decode a public channel payload. Returns the snapshot flag and payload.
///
/// # Errors
///
/// Returns an error if the payload does not match the channel's layout.
pub fn decode_market(
    channel: Channel,
    payload: &Value,
) -> Result<(bool, MarketPayload), DecodeError> {
    let Rows { snapshot, rows } = market_rows(channel, payload)?;

    let decoded = match channel {
        Channel::Ticker => {
            let row = rows
                .last()
                .ok_or(DecodeError::TooShort {
                    expected: 10,
                    actual: 0,
                })?;
            MarketPayload::Ticker(ticker(row)?)
        }
        Channel::Trades => MarketPayload::Trades(collect(&rows, trade)?),
        Channel::Book => MarketPayload::Book(collect(&rows, book_level)?),
        Channel::Candles => MarketPayload::Candles(collect(&rows, candle)?),
    };

    Ok((snapshot, decoded))
}

/// Multi-row channels may carry an empty snapshot before any rows exist.
fn market_rows(channel: Channel, payload: &Value) -> Result<Rows<'_>, DecodeError> {
    if channel != Channel::Ticker && payload.as_array().is_some_and(Vec::is_empty) {
        return Ok(Rows {
            snapshot: true,
            rows: Vec::new(),
        });
    }
    rows(payload)
}

fn collect<T>(
    rows: &[&[Value]],
    decode: fn(&[Value]) -> Result<T, DecodeError>,
) -> Result<Vec<T>, DecodeError> {
    rows.iter().map(|row| decode(row)).collect()
}

fn ticker(row: &[Value]) -> Result<Ticker, DecodeError> {
    require(row, 10)?;
    Ok(Ticker {
        bid: decimal(row, 0)?,
        bid_size: decimal(row, 1)?,
        ask: decimal(row, 2)?,
        ask_size: decimal(row, 3)?,
        daily_change: decimal(row, 4)?,
        daily_change_relative: decimal(row, 5)?,
        last_price: decimal(row, 6)?,
        volume: decimal(row, 7)?,
        high: decimal(row, 8)?,
        low: decimal(row, 9)?,
    })
}

fn trade(row: &[Value]) -> Result<Trade, DecodeError> {
    require(row, 4)?;
    Ok(Trade {
        id: integer(row, 0)?,
        timestamp: timestamp(row, 1)?,
        amount: decimal(row, 2)?,
        price: decimal(row, 3)?,
    })
}

fn book_level(row: &[Value]) -> Result<BookLevel, DecodeError> {
    require(row, 3)?;
    Ok(BookLevel {
        price: decimal(row, 0)?,
        count: count(row, 1)?,
        amount: decimal(row, 2)?,
    })
}

fn candle(row: &[Value]) -> Result<Candle, DecodeError> {
    require(row, 6)?;
    Ok(Candle {
        timestamp: timestamp(row, 0)?,
        open: decimal(row, 1)?,
        close: decimal(row, 2)?,
        high: decimal(row, 3)?,
        low: decimal(row, 4)?,
        volume: decimal(row, 5)?,
    })
}

// =============================================================================
// Account Channel
// =============================================================================

/// Decode an account channel payload by wire tag.
///
/// # Errors
///
/// Returns an error for unknown tags or payloads that do not match the
/// tag's layout.
pub fn decode_account(tag: &str, payload: &Value) -> Result<AccountEvent, DecodeError> {
    let tag = AccountTag::from_wire(tag).ok_or_else(|| DecodeError::UnknownTag(tag.to_string()))?;

    let payload = match tag {
        AccountTag::WalletSnapshot | AccountTag::WalletUpdate => {
            AccountPayload::Wallets(collect(&account_rows(tag, payload)?, wallet)?)
        }
        AccountTag::OrderSnapshot
        | AccountTag::OrderNew
        | AccountTag::OrderUpdate
        | AccountTag::OrderCancel => {
            AccountPayload::Orders(collect(&account_rows(tag, payload)?, order)?)
        }
        AccountTag::PositionSnapshot
        | AccountTag::PositionNew
        | AccountTag::PositionUpdate
        | AccountTag::PositionClose => {
            AccountPayload::Positions(collect(&account_rows(tag, payload)?, position)?)
        }
        AccountTag::TradeExecuted | AccountTag::TradeUpdate => {
            AccountPayload::Execution(execution(single_row(payload)?)?)
        }
        AccountTag::Notification => {
            AccountPayload::Notification(notification(single_row(payload)?)?)
        }
    };

    Ok(AccountEvent {
        tag,
        snapshot: tag.is_snapshot(),
        payload,
    })
}

/// Snapshot tags may carry an empty array; update tags always carry one row.
fn account_rows(tag: AccountTag, payload: &Value) -> Result<Vec<&[Value]>, DecodeError> {
    if tag.is_snapshot() && payload.as_array().is_some_and(Vec::is_empty) {
        return Ok(Vec::new());
    }
    Ok(rows(payload)?.rows)
}

fn single_row(payload: &Value) -> Result<&[Value], DecodeError> {
    payload
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| DecodeError::NotArray(kind_of(payload).to_string()))
}

fn wallet(row: &[Value]) -> Result<Wallet, DecodeError> {
    require(row, 4)?;
    Ok(Wallet {
        wallet_type: text(row, 0)?,
        currency: text(row, 1)?,
        balance: decimal(row, 2)?,
        unsettled_interest: decimal(row, 3)?,
        balance_available: opt_decimal(row, 4)?,
    })
}

fn order(row: &[Value]) -> Result<Order, DecodeError> {
    require(row, 18)?;
    Ok(Order {
        id: integer(row, 0)?,
        client_id: opt_integer(row, 2)?,
        symbol: text(row, 3)?,
        created_at: timestamp(row, 4)?,
        updated_at: timestamp(row, 5)?,
        amount: decimal(row, 6)?,
        amount_orig: decimal(row, 7)?,
        order_type: text(row, 8)?,
        status: text(row, 13)?,
        price: decimal(row, 16)?,
        price_avg: opt_decimal(row, 17)?.unwrap_or_default(),
    })
}

fn position(row: &[Value]) -> Result<Position, DecodeError> {
    require(row, 4)?;
    Ok(Position {
        symbol: text(row, 0)?,
        status: text(row, 1)?,
        amount: decimal(row, 2)?,
        base_price: decimal(row, 3)?,
        pl: opt_decimal(row, 6)?,
        liquidation_price: opt_decimal(row, 8)?,
    })
}

fn execution(row: &[Value]) -> Result<Execution, DecodeError> {
    require(row, 6)?;
    Ok(Execution {
        id: integer(row, 0)?,
        symbol: text(row, 1)?,
        timestamp: timestamp(row, 2)?,
        order_id: integer(row, 3)?,
        amount: decimal(row, 4)?,
        price: decimal(row, 5)?,
        fee: opt_decimal(row, 9)?,
        fee_currency: opt_text(row, 10),
    })
}

fn notification(row: &[Value]) -> Result<Notification, DecodeError> {
    require(row, 8)?;
    Ok(Notification {
        timestamp: timestamp(row, 0)?,
        kind: text(row, 1)?,
        status: text(row, 6)?,
        text: opt_text(row, 7).unwrap_or_default(),
    })
}
