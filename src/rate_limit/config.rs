//! Rate limiter tuning.

use std::time::Duration;

/// Adaptive rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Delay between requests to one host when it is healthy.
    pub base_delay: Duration,
    /// Floor the delay never drops below during recovery.
    pub min_delay: Duration,
    /// Ceiling for backoff.
    pub max_delay: Duration,
    /// Multiplier applied on 429/503.
    pub backoff_multiplier: f64,
    /// Multiplier applied on other 5xx answers.
    pub server_error_multiplier: f64,
    /// Multiplier (< 1) applied after a run of successes while backing off.
    pub recovery_multiplier: f64,
    /// Successes needed before the delay shrinks.
    pub recovery_threshold: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            server_error_multiplier: 1.5,
            recovery_multiplier: 0.8,
            recovery_threshold: 5,
        }
    }
}

/// Per-host statistics for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainStats {
    pub current_delay: Duration,
    pub in_backoff: bool,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
}
