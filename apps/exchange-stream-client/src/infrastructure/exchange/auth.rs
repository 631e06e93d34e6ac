//! Session and REST Authentication
//!
//! Builds the signed `auth` control frame for the private account feed and the
//! signed headers for REST calls. Both sign with HMAC-SHA384 over the API
//! secret and use a strictly increasing nonce.
//!
//! # Authentication Flow
//!
//! 1. Connect to the WebSocket endpoint
//! 2. Compute `payload = "AUTH" + nonce` and `sig = hex(HMAC-SHA384(payload, secret))`
//! 3. Send `{"event":"auth","apiKey":..,"authSig":sig,"authNonce":nonce,"authPayload":payload}`
//! 4. Receive `{"event":"auth","status":"OK","userId":..}` or a `FAILED` status with `msg`
//!
//! REST requests sign `"/api/" + path + nonce + body` the same way.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha384;
use thiserror::Error;

use crate::application::ports::CorrelationError;
use crate::domain::protocol::{AuthPayload, ControlEvent, ControlFrame};
use crate::domain::streaming::ErrorKind;

type HmacSha384 = Hmac<Sha384>;

/// REST header carrying the nonce.
pub const NONCE_HEADER: &str = "bfx-nonce";
/// REST header carrying the API key.
pub const API_KEY_HEADER: &str = "bfx-apikey";
/// REST header carrying the signature.
pub const SIGNATURE_HEADER: &str = "bfx-signature";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A credential field was empty.
    #[error("{0} cannot be empty")]
    EmptyCredential(&'static str),

    /// No credentials were configured.
    #[error("no API credentials configured")]
    MissingCredentials,

    /// HMAC construction failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The request/reply exchange failed.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The exchange refused the credentials.
    #[error("authentication rejected: {message}")]
    Rejected {
        /// Exchange error code.
        code: Option<i64>,
        /// Exchange error text.
        message: String,
    },

    /// The reply reported success but carried no user id.
    #[error("auth reply carried no user id")]
    MissingUserId,

    /// The reply was some other control event.
    #[error("unexpected reply to auth: {0}")]
    UnexpectedReply(String),
}

impl AuthError {
    /// Error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyCredential(_) | Self::MissingCredentials => ErrorKind::State,
            Self::Signing(_) | Self::MissingUserId | Self::UnexpectedReply(_) => {
                ErrorKind::Protocol
            }
            Self::Correlation(e) => e.kind(),
            Self::Rejected { .. } => ErrorKind::Rejected,
        }
    }
}

// =============================================================================
// Authentication State
// =============================================================================

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// No auth attempted on this session.
    #[default]
    Unauthenticated,
    /// Auth request outstanding.
    Authenticating,
    /// Authenticated as `user_id`.
    Authenticated {
        /// Exchange user id.
        user_id: u64,
    },
    /// The last attempt failed.
    Failed,
}

impl AuthState {
    /// Check if currently authenticated.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }
}

/// Interpret the reply to an `auth` request.
///
/// # Errors
///
/// Returns `Rejected` when the frame reports failure or carries a message
/// without a user id, `MissingUserId` when it carries neither, and
/// `UnexpectedReply` for any other event.
pub fn interpret_auth_reply(frame: &ControlFrame) -> Result<u64, AuthError> {
    if let Some(rejection) = frame.rejection() {
        return Err(AuthError::Rejected {
            code: rejection.code,
            message: rejection.message,
        });
    }

    if frame.event != ControlEvent::Auth {
        return Err(AuthError::UnexpectedReply(frame.event.as_str().to_string()));
    }

    match (frame.user_id, frame.msg.as_deref()) {
        (Some(user_id), _) => Ok(user_id),
        (None, Some(message)) if !message.is_empty() => Err(AuthError::Rejected {
            code: frame.code,
            message: message.to_string(),
        }),
        (None, _) => Err(AuthError::MissingUserId),
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// API key and secret. `Debug` and `Display` never show the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either value is empty.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into();
        let api_secret = api_secret.into();

        if api_key.is_empty() {
            return Err(AuthError::EmptyCredential("API key"));
        }
        if api_secret.is_empty() {
            return Err(AuthError::EmptyCredential("API secret"));
        }

        Ok(Self {
            api_key,
            api_secret,
        })
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Display for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials(api_key={})", self.api_key)
    }
}

// =============================================================================
// Nonce
// =============================================================================

/// Strictly increasing nonce: wall-clock milliseconds plus a fixed offset.
///
/// Calls within the same millisecond (or after the clock steps back) return
/// the previous nonce plus one.
#[derive(Debug, Default)]
pub struct NonceGenerator {
    offset: u64,
    last: AtomicU64,
}

impl NonceGenerator {
    /// Create a generator with an offset added to every nonce.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self {
            offset,
            last: AtomicU64::new(0),
        }
    }

    /// Next nonce.
    pub fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let candidate = now.saturating_add(self.offset);

        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = candidate.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

// =============================================================================
// Signing
// =============================================================================

/// HMAC-SHA384 signer with hex output.
#[derive(Clone)]
pub struct AuthSigner {
    secret: Vec<u8>,
}

impl AuthSigner {
    /// Create a signer for a secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Hex-encoded HMAC-SHA384 of `message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HMAC cannot be keyed.
    pub fn sign(&self, message: &str) -> Result<String, AuthError> {
        let mut mac = HmacSha384::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Signing(format!("failed to create HMAC: {e}")))?;

        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for AuthSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthSigner([REDACTED])")
    }
}

/// Builds signed session `auth` payloads.
#[derive(Debug)]
pub struct Authenticator {
    credentials: Credentials,
    signer: AuthSigner,
    nonces: NonceGenerator,
}

impl Authenticator {
    /// Create an authenticator.
    #[must_use]
    pub fn new(credentials: Credentials, nonce_offset: u64) -> Self {
        let signer = AuthSigner::new(credentials.api_secret());
        Self {
            credentials,
            signer,
            nonces: NonceGenerator::new(nonce_offset),
        }
    }

    /// Credentials in use.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Build a fresh signed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn payload(&self) -> Result<AuthPayload, AuthError> {
        let nonce = self.nonces.next();
        let payload = format!("AUTH{nonce}");
        let signature = self.signer.sign(&payload)?;

        Ok(AuthPayload {
            api_key: self.credentials.api_key().to_string(),
            signature,
            nonce,
            payload,
        })
    }
}

/// Signed REST authentication headers.
#[derive(Clone, PartialEq, Eq)]
pub struct RestAuthHeaders {
    /// Nonce used in the signature.
    pub nonce: u64,
    /// API key.
    pub api_key: String,
    /// Hex signature.
    pub signature: String,
}

impl RestAuthHeaders {
    /// Header name/value pairs.
    #[must_use]
    pub fn to_pairs(&self) -> [(&'static str, String); 3] {
        [
            (NONCE_HEADER, self.nonce.to_string()),
            (API_KEY_HEADER, self.api_key.clone()),
            (SIGNATURE_HEADER, self.signature.clone()),
        ]
    }
}

impl std::fmt::Debug for RestAuthHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestAuthHeaders")
            .field("nonce", &self.nonce)
            .field("api_key", &self.api_key)
            .field("signature", &"[REDACTED]")
            .finish()
    }
}

/// Signs authenticated REST requests.
#[derive(Debug)]
pub struct RestSigner {
    credentials: Credentials,
    signer: AuthSigner,
    nonces: NonceGenerator,
}

impl RestSigner {
    /// Create a REST signer.
    #[must_use]
    pub fn new(credentials: Credentials, nonce_offset: u64) -> Self {
        let signer = AuthSigner::new(credentials.api_secret());
        Self {
            credentials,
            signer,
            nonces: NonceGenerator::new(nonce_offset),
        }
    }

    /// Sign a request to `path` (without the `/api/` prefix) with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&self, path: &str, body: &str) -> Result<RestAuthHeaders, AuthError> {
        let nonce = self.nonces.next();
        let path = path.trim_start_matches('/');
        let message = format!("/api/{path}{nonce}{body}");

        Ok(RestAuthHeaders {
            nonce,
            api_key: self.credentials.api_key().to_string(),
            signature: self.signer.sign(&message)?,
        })
    }
}
