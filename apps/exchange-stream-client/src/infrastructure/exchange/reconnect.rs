//! Reconnection Policy
//!
//! Exponential backoff with jitter for re-establishing a dropped session.
//! The client never reconnects on its own; this policy drives the explicit
//! supervisor loop in the binary, which reconnects and then resubscribes the
//! keys reported as lost.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ReconnectSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.2 = ±20%).
    pub jitter_factor: f64,
    /// Maximum attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `ReconnectSettings`.
    #[must_use]
    pub const fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: settings.initial_delay,
            max_delay: settings.max_delay,
            multiplier: settings.multiplier,
            jitter_factor: 0.2,
            max_attempts: settings.max_attempts,
        }
    }

    /// Un-jittered delay before attempt `attempt` (0-based), capped at
    /// `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.initial_delay.as_millis() as f64 * factor).round();

        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.max_delay.as_millis() as f64;
        if scaled.is_finite() && scaled < max_millis {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let millis = scaled as u64;
            Duration::from_millis(millis)
        } else {
            self.max_delay
        }
    }
}

/// Attempt counter producing backoff delays.
///
/// ```rust
/// use exchange_stream_client::infrastructure::exchange::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert!(policy.next_delay().is_some());
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let delay = self.jitter(self.config.base_delay(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Start over after a session was re-established.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt < self.config.max_attempts
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        let base = delay.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.001))
    }
}

/// Error type for reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Every allowed attempt failed.
    #[error("gave up after {0} reconnection attempts")]
    Exhausted(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_grow_geometrically() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 10_000, 2.0, 0));

        let delays: Vec<_> = (0..4).filter_map(|_| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn delays_are_capped() {
        let config = no_jitter(1_000, 2_500, 4.0, 0);
        assert_eq!(config.base_delay(0), Duration::from_millis(1_000));
        assert_eq!(config.base_delay(1), Duration::from_millis(2_500));
        assert_eq!(config.base_delay(200), Duration::from_millis(2_500));
    }

    #[test]
    fn attempts_are_bounded() {
        let mut policy = ReconnectPolicy::new(no_jitter(10, 100, 2.0, 2));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let config = ReconnectConfig {
            jitter_factor: 0.2,
            ..no_jitter(1_000, 10_000, 2.0, 0)
        };

        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(config.clone());
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((800..=1_200).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn from_settings_copies_bounds() {
        let settings = ReconnectSettings {
            enabled: true,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            multiplier: 1.5,
            max_attempts: 7,
        };
        let config = ReconnectConfig::from_settings(&settings);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(8));
        assert_eq!(config.max_attempts, 7);
    }
}
