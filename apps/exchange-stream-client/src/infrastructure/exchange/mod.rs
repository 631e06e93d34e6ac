//! Exchange WebSocket Adapter
//!
//! Implements the streaming client for a channel-id multiplexed exchange
//! feed:
//!
//! - **connection**: one WebSocket session with heartbeat and ordered inbound delivery
//! - **correlator**: serialized request/reply pairing for a feed without request ids
//! - **codec** / **decode**: frame classification and payload decoding
//! - **dispatcher**: per-frame routing to replies, events, drops and errors
//! - **auth**: signed session and REST authentication
//! - **client**: the facade wiring it all together

pub mod auth;
pub mod client;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod decode;
pub mod dispatcher;
pub mod heartbeat;
pub mod reconnect;

pub use auth::{
    AuthError, AuthSigner, AuthState, Authenticator, Credentials, NonceGenerator, RestAuthHeaders,
    RestSigner,
};
pub use client::{ClientConfig, PingError, StreamClient, Subscription};
pub use codec::{CodecError, DataBody, DataFrame, InboundFrame, JsonCodec};
pub use connection::{
    ConnectError, Connection, ConnectionConfig, ConnectionEvent, ConnectionManager,
    ConnectionState,
};
pub use correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
pub use decode::{DecodeError, decode_account, decode_market};
pub use dispatcher::{AckRouting, Dispatch, Dispatcher};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
