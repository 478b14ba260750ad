//! Per-host pacing state.

use std::time::{Duration, Instant};

/// State for a single host.
#[derive(Debug, Clone)]
pub struct DomainState {
    pub current_delay: Duration,
    pub last_request: Option<Instant>,
    /// Consecutive successes since the last backoff step.
    pub consecutive_successes: u32,
    pub in_backoff: bool,
    pub total_requests: u64,
    pub rate_limit_hits: u64,
}

impl DomainState {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            current_delay: base_delay,
            last_request: None,
            consecutive_successes: 0,
            in_backoff: false,
            total_requests: 0,
            rate_limit_hits: 0,
        }
    }

    /// Multiply the delay, capped at `max`.
    pub fn back_off(&mut self, multiplier: f64, max: Duration) {
        let next = Duration::from_secs_f64(self.current_delay.as_secs_f64() * multiplier);
        self.current_delay = next.min(max);
        self.consecutive_successes = 0;
    }
}
