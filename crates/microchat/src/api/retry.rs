//! Automatic retry with capped exponential backoff.
//!
//! Retries transient HTTP failures (429 and every 5xx). A positive
//! `Retry-After` hint from the server wins over the computed backoff, but is
//! still clamped to the configured maximum delay.

use std::time::Duration;

use crate::ErrorKind;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Whether failed attempts are retried at all.
    pub enabled: bool,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,
    /// Upper bound for any single delay, hints included.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryConfig {
    /// Enabled config with the given number of retries and default backoff.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            enabled: true,
            max_retries: retries,
            ..Default::default()
        }
    }

    /// Total attempts the executor will make, first attempt included.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Backoff delay for a 0-indexed attempt, ignoring server hints.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        delay_for(self, attempt, None)
    }
}

/// Whether an HTTP status is worth retrying: 429 or anything in `500..600`.
pub fn is_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Delay before retrying after the given 0-indexed attempt.
///
/// `retry_after_secs` is the server's `Retry-After` value; a positive hint
/// replaces the exponential schedule. The schedule is evaluated in `f64` so
/// that large attempt numbers saturate at `max_delay` instead of overflowing.
pub fn delay_for(config: &RetryConfig, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let max_ms = config.max_delay.as_millis() as f64;

    if let Some(secs) = retry_after_secs
        && secs > 0
    {
        let hinted = Duration::from_secs(secs);
        return hinted.min(config.max_delay);
    }

    let exponent = attempt.min(i32::MAX as u32) as i32;
    let base = config.initial_delay.as_millis() as f64 * config.multiplier.powi(exponent);
    let capped = if !base.is_finite() || base > max_ms {
        max_ms
    } else {
        base.max(0.0)
    };
    Duration::from_millis(capped.round() as u64)
}

/// Map a final HTTP status onto the error taxonomy.
///
/// `0` means no response arrived at all.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        0 => ErrorKind::NetworkError,
        401 | 403 => ErrorKind::AuthError,
        429 => ErrorKind::RateLimited,
        400..=499 => ErrorKind::InvalidRequest,
        _ => ErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(initial: u64, multiplier: f64, max: u64) -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_millis(initial),
            multiplier,
            max_delay: Duration::from_millis(max),
        }
    }

    #[test]
    fn default_config_disabled() {
        let config = RetryConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(1000));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.attempts(), 1);
    }

    #[test]
    fn with_retries_enables() {
        let config = RetryConfig::with_retries(5);
        assert!(config.enabled);
        assert_eq!(config.attempts(), 6);
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let config = backoff(1000, 2.0, 30_000);
        assert_eq!(delay_for(&config, 0, None), Duration::from_millis(1000));
        assert_eq!(delay_for(&config, 1, None), Duration::from_millis(2000));
        assert_eq!(delay_for(&config, 2, None), Duration::from_millis(4000));
        assert_eq!(delay_for(&config, 3, None), Duration::from_millis(8000));
    }

    #[test]
    fn delay_capped_at_max() {
        let config = backoff(1000, 2.0, 30_000);
        assert_eq!(delay_for(&config, 5, None), Duration::from_millis(30_000));
        assert_eq!(delay_for(&config, 50, None), Duration::from_millis(30_000));
        assert_eq!(delay_for(&config, u32::MAX, None), Duration::from_millis(30_000));
    }

    #[test]
    fn retry_after_hint_wins_but_is_clamped() {
        let config = backoff(1000, 2.0, 10_000);
        assert_eq!(delay_for(&config, 0, Some(60)), Duration::from_millis(10_000));
        assert_eq!(delay_for(&config, 3, Some(2)), Duration::from_millis(2000));
    }

    #[test]
    fn zero_hint_falls_back_to_backoff() {
        let config = backoff(1000, 2.0, 30_000);
        assert_eq!(delay_for(&config, 1, Some(0)), Duration::from_millis(2000));
    }

    #[test]
    fn other_multipliers() {
        let config = backoff(500, 3.0, 60_000);
        assert_eq!(delay_for(&config, 0, None), Duration::from_millis(500));
        assert_eq!(delay_for(&config, 1, None), Duration::from_millis(1500));
        assert_eq!(delay_for(&config, 2, None), Duration::from_millis(4500));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4500));
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 599] {
            assert!(is_retryable(status), "{status} should be retryable");
        }
        for status in [0, 200, 400, 401, 403, 404, 600] {
            assert!(!is_retryable(status), "{status} should not be retryable");
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(0), ErrorKind::NetworkError);
        assert_eq!(classify_status(401), ErrorKind::AuthError);
        assert_eq!(classify_status(403), ErrorKind::AuthError);
        assert_eq!(classify_status(429), ErrorKind::RateLimited);
        assert_eq!(classify_status(400), ErrorKind::InvalidRequest);
        assert_eq!(classify_status(404), ErrorKind::InvalidRequest);
        assert_eq!(classify_status(500), ErrorKind::ServerError);
        assert_eq!(classify_status(503), ErrorKind::ServerError);
    }
}
