//! Frame Codec
//!
//! Classifies raw text frames into control frames (JSON object root) and
//! data frames (JSON array root).
//!
//! Data frames are only split into their discriminant parts here; payload
//! decoding happens in [`super::decode`].
//!
//! ```json
//! {"event":"subscribed","channel":"ticker","chanId":5}   -> Control
//! [5,"hb"]                                               -> Data / Heartbeat
//! [5,[100.1,1,100.2,1,0,0,100.15,1000,110,90]]           -> Data / Payload
//! [5,100.1,1,100.2,1,0,0,100.15,1000,110,90]             -> Data / Payload (flat)
//! [0,"os",[[1,2,3,"tBTCUSD",...]]]                       -> Data / Tagged
//! ```

use serde_json::Value;

use crate::domain::protocol::{ChannelId, ControlFrame};

/// Heartbeat sentinel carried in the second element of a data frame.
pub const HEARTBEAT_SENTINEL: &str = "hb";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Empty data frame.
    #[error("empty data frame")]
    EmptyArray,

    /// First element of a data frame is not a channel id.
    #[error("data frame has no channel id: {0}")]
    MissingChannelId(String),

    /// Root is neither an object nor an array.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

/// Body of a data frame after the channel id.
#[derive(Debug, Clone, PartialEq)]
pub enum DataBody {
    /// `[chanId, "hb"]`
    Heartbeat,
    /// `[chanId, "<tag>", payload]`
    Tagged {
        /// Event-type tag.
        tag: String,
        /// Payload following the tag (`Null` when absent).
        payload: Value,
    },
    /// `[chanId, payload]` or the flat `[chanId, v1, v2, ...]` form.
    Payload(Value),
}

/// Data frame split into channel id and body.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Channel id from element 0.
    pub channel_id: ChannelId,
    /// Remaining elements.
    pub body: DataBody,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// JSON object root.
    Control(ControlFrame),
    /// JSON array root.
    Data(DataFrame),
}

/// JSON codec for the exchange feed.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classify a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON, the root is neither an
    /// object nor an array, or a data frame lacks a channel id.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let trimmed = text.trim_start();

        if trimmed.starts_with('{') {
            Ok(InboundFrame::Control(serde_json::from_str(trimmed)?))
        } else if trimmed.starts_with('[') {
            let elements: Vec<Value> = serde_json::from_str(trimmed)?;
            split_data_frame(elements).map(InboundFrame::Data)
        } else {
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}...",
                preview(trimmed)
            )))
        }
    }
}

fn split_data_frame(mut elements: Vec<Value>) -> Result<DataFrame, CodecError> {
    if elements.is_empty() {
        return Err(CodecError::EmptyArray);
    }

    let channel_id = ChannelId::from_value(&elements[0])
        .ok_or_else(|| CodecError::MissingChannelId(elements[0].to_string()))?;

    let tag = match elements.get(1) {
        Some(Value::String(tag)) => Some(tag.clone()),
        _ => None,
    };
    let nested = elements.len() == 2 && elements[1].is_array();

    let body = match tag {
        Some(tag) if tag == HEARTBEAT_SENTINEL => DataBody::Heartbeat,
        Some(tag) => DataBody::Tagged {
            tag,
            payload: elements.get_mut(2).map(Value::take).unwrap_or(Value::Null),
        },
        None if nested => DataBody::Payload(elements.pop().unwrap_or(Value::Null)),
        None => DataBody::Payload(Value::Array(elements.split_off(1))),
    };

    Ok(DataFrame { channel_id, body })
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}
