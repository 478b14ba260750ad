//! Adaptive per-host rate limiter.
//!
//! Paces requests per host and adapts the delay to how the host responds:
//! backs off on 429/503, a little on other 5xx, and recovers gradually
//! after a run of successes.

mod config;
mod domain_state;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

pub use config::{DomainStats, RateLimitConfig};
use domain_state::DomainState;

/// Rate limiter shared by every request the pipeline makes.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    domains: Arc<RwLock<HashMap<String, DomainState>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            domains: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn extract_domain(url: &str) -> Option<String> {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_ascii_lowercase()))
    }

    /// Wait for the host's next slot. Returns the host key for reporting.
    ///
    /// The slot is reserved under the lock, so concurrent callers for the same
    /// host queue up one delay apart instead of all firing at once.
    pub async fn acquire(&self, url: &str) -> Option<String> {
        let domain = Self::extract_domain(url)?;

        let wait = {
            let mut domains = self.domains.write().await;
            let state = domains
                .entry(domain.clone())
                .or_insert_with(|| DomainState::new(self.config.base_delay));
            let now = Instant::now();
            let slot = match state.last_request {
                Some(last) => (last + state.current_delay).max(now),
                None => now,
            };
            state.last_request = Some(slot);
            state.total_requests += 1;
            slot.saturating_duration_since(now)
        };

        if wait > Duration::ZERO {
            debug!("Rate limiting {}: waiting {:?}", domain, wait);
            tokio::time::sleep(wait).await;
        }

        Some(domain)
    }

    /// Feed a response status back into the host's pacing.
    pub async fn report_status(&self, domain: &str, status: u16) {
        match status {
            429 | 503 => self.report_rate_limit(domain, status).await,
            500..=599 => self.report_server_error(domain).await,
            200..=399 => self.report_success(domain).await,
            _ => {}
        }
    }

    /// A successful request; may shrink the delay.
    pub async fn report_success(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            state.consecutive_successes += 1;

            if state.in_backoff && state.consecutive_successes >= self.config.recovery_threshold {
                let next = Duration::from_secs_f64(
                    state.current_delay.as_secs_f64() * self.config.recovery_multiplier,
                );
                state.current_delay = next.max(self.config.min_delay);

                if state.current_delay <= self.config.base_delay {
                    state.in_backoff = false;
                    state.current_delay = self.config.base_delay;
                    info!("Host {} recovered from rate limit backoff", domain);
                } else {
                    debug!("Host {} delay reduced to {:?}", domain, state.current_delay);
                }

                state.consecutive_successes = 0;
            }
        }
    }

    /// A definite rate limit answer (429 or 503).
    pub async fn report_rate_limit(&self, domain: &str, status: u16) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            state.rate_limit_hits += 1;
            state.in_backoff = true;
            state.back_off(self.config.backoff_multiplier, self.config.max_delay);

            warn!(
                "Rate limited by {} (HTTP {}), backing off to {:?}",
                domain, status, state.current_delay
            );
        }
    }

    /// Server error other than 503; mild backoff.
    pub async fn report_server_error(&self, domain: &str) {
        let mut domains = self.domains.write().await;
        if let Some(state) = domains.get_mut(domain) {
            state.back_off(self.config.server_error_multiplier, self.config.max_delay);
            debug!(
                "Server error from {}, delay increased to {:?}",
                domain, state.current_delay
            );
        }
    }

    pub async fn get_stats(&self) -> HashMap<String, DomainStats> {
        let domains = self.domains.read().await;
        domains
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    DomainStats {
                        current_delay: v.current_delay,
                        in_backoff: v.in_backoff,
                        total_requests: v.total_requests,
                        rate_limit_hits: v.rate_limit_hits,
                    },
                )
            })
            .collect()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
