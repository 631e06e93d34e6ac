//! Client Configuration Settings
//!
//! Configuration types for the stream client, loaded from environment
//! variables. Unparseable numbers fall back to their defaults; missing
//! required values are errors.

use std::time::Duration;

use crate::domain::subscription::{ParseKeyError, SubscriptionKey};
use crate::infrastructure::exchange::auth::Credentials;

/// Reconnect supervisor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Whether the binary reconnects after a dropped session.
    pub enabled: bool,
    /// Initial reconnection delay.
    pub initial_delay: Duration,
    /// Maximum reconnection delay.
    pub max_delay: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// WebSocket URL.
    pub url: String,
    /// API credentials for the private feed.
    pub credentials: Option<Credentials>,
    /// Added to the millisecond clock when generating nonces.
    pub nonce_offset: u64,
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Reply deadline for correlated requests.
    pub request_timeout: Duration,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence before the session is considered dead.
    pub heartbeat_timeout: Duration,
    /// Queue subscription changes and flush them in batches.
    pub batch_mode: bool,
    /// Time between batch flushes.
    pub batch_interval: Duration,
    /// Maximum keys per batch frame.
    pub batch_size: usize,
    /// Event queue depth.
    pub event_capacity: usize,
    /// Subscriptions requested at startup.
    pub subscriptions: Vec<SubscriptionKey>,
    /// Reconnect supervisor settings.
    pub reconnect: ReconnectSettings,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl ClientSettings {
    /// Settings with defaults for everything but the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            nonce_offset: 0,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            batch_mode: false,
            batch_interval: Duration::from_millis(1000),
            batch_size: 60,
            event_capacity: 4096,
            subscriptions: Vec::new(),
            reconnect: ReconnectSettings::default(),
            metrics_port: 0,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `STREAM_URL` is missing or empty, only one of the
    /// credential pair is set, or a subscription entry cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`ClientSettings::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let url = env
            .get("STREAM_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("STREAM_URL".to_string()))?;
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("STREAM_URL".to_string()));
        }

        let defaults = Self::new(url);
        let reconnect_defaults = ReconnectSettings::default();

        let credentials = match (env.get("STREAM_API_KEY"), env.get("STREAM_API_SECRET")) {
            (None, None) => None,
            (Some(key), Some(secret)) => Some(
                Credentials::new(key, secret)
                    .map_err(|e| ConfigError::EmptyValue(e.to_string()))?,
            ),
            _ => return Err(ConfigError::IncompleteCredentials),
        };

        let subscriptions = env
            .get("STREAM_SUBSCRIPTIONS")
            .map(|raw| parse_subscriptions(&raw))
            .transpose()?
            .unwrap_or_default();

        let reconnect = ReconnectSettings {
            enabled: env.bool("STREAM_RECONNECT_ENABLED", reconnect_defaults.enabled),
            initial_delay: env.duration_millis(
                "STREAM_RECONNECT_DELAY_INITIAL_MS",
                reconnect_defaults.initial_delay,
            ),
            max_delay: env.duration_secs(
                "STREAM_RECONNECT_DELAY_MAX_SECS",
                reconnect_defaults.max_delay,
            ),
            multiplier: env.parse(
                "STREAM_RECONNECT_DELAY_MULTIPLIER",
                reconnect_defaults.multiplier,
            ),
            max_attempts: env.parse(
                "STREAM_MAX_RECONNECT_ATTEMPTS",
                reconnect_defaults.max_attempts,
            ),
        };

        Ok(Self {
            credentials,
            nonce_offset: env.parse("STREAM_NONCE_OFFSET", defaults.nonce_offset),
            connect_timeout: env.duration_secs(
                "STREAM_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
            request_timeout: env.duration_secs(
                "STREAM_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout,
            ),
            heartbeat_interval: env.duration_secs(
                "STREAM_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env.duration_secs(
                "STREAM_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            batch_mode: env.bool("STREAM_BATCH_MODE", defaults.batch_mode),
            batch_interval: env.duration_millis(
                "STREAM_BATCH_INTERVAL_MS",
                defaults.batch_interval,
            ),
            batch_size: env.parse("STREAM_BATCH_SIZE", defaults.batch_size).max(1),
            event_capacity: env
                .parse("STREAM_EVENT_CAPACITY", defaults.event_capacity)
                .max(1),
            subscriptions,
            reconnect,
            metrics_port: env.parse("STREAM_METRICS_PORT", defaults.metrics_port),
            ..defaults
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// Only one of `STREAM_API_KEY` / `STREAM_API_SECRET` is set.
    #[error("STREAM_API_KEY and STREAM_API_SECRET must be set together")]
    IncompleteCredentials,

    /// A `STREAM_SUBSCRIPTIONS` entry is invalid.
    #[error("invalid subscription {entry:?}: {source}")]
    InvalidSubscription {
        /// The offending entry.
        entry: String,
        /// Parse failure.
        source: ParseKeyError,
    },
}

fn parse_subscriptions(raw: &str) -> Result<Vec<SubscriptionKey>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse()
                .map_err(|source| ConfigError::InvalidSubscription {
                    entry: entry.to_string(),
                    source,
                })
        })
        .collect()
}

/// Typed reads over a variable lookup.
struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key).map_or(default, |v| {
            matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        })
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
