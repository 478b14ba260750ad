//! Retry scheduling with exponential backoff and a per-host circuit breaker.

mod circuit;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use circuit::Admission;
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStats};

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff; counts against the host's circuit.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// The server asked us to slow down, optionally saying for how long.
    RateLimited(Option<Duration>),
}

/// Backoff tuning.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Relative jitter applied to each delay (0.25 = ±25%).
    pub jitter: f64,
    /// Upper bound on a server-provided Retry-After.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            max_attempts: 6,
            jitter: 0.25,
            max_rate_limit_wait: Duration::from_secs(300),
        }
    }
}

/// Why a scheduled operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// A permanent failure; no retry was attempted.
    #[error("{0}")]
    Fatal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { last: E, attempts: u32 },

    #[error("circuit open for {host}")]
    CircuitOpen { host: String },
}

impl<E> RetryError<E> {
    /// The underlying error of the last attempt, if one ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Fatal(e) | Self::Exhausted { last: e, .. } => Some(e),
            Self::CircuitOpen { .. } => None,
        }
    }
}

/// Runs fallible network operations under the retry policy and circuit breaker.
///
/// Cheap to clone; clones share circuit state.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy, circuit: CircuitConfig) -> Self {
        Self {
            policy,
            breaker: CircuitBreaker::new(circuit),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Circuit key for a URL.
    pub fn host_key(url: &str) -> String {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_else(|| url.to_string())
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// Doubles from the base delay up to the cap, with uniform jitter. Once the
    /// nominal delay reaches the cap it is used as-is, so successive delays
    /// never decrease.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let nominal = self.policy.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let cap = self.policy.max_delay.as_secs_f64();
        if nominal >= cap {
            return self.policy.max_delay;
        }

        let delay = if self.policy.jitter > 0.0 {
            let range = nominal * self.policy.jitter;
            nominal + rand::random_range(-range..=range)
        } else {
            nominal
        };

        Duration::from_secs_f64(delay.clamp(0.0, cap))
    }

    /// Delay before a persisted retry after the `attempt`-th failure: the
    /// backoff, stretched to the server's Retry-After (capped) when longer.
    pub fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff_delay(attempt);
        match retry_after {
            Some(wait) => backoff.max(wait.min(self.policy.max_rate_limit_wait)),
            None => backoff,
        }
    }

    fn wait_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        match class {
            ErrorClass::RateLimited(Some(wait)) => wait.min(self.policy.max_rate_limit_wait),
            _ => self.backoff_delay(attempt),
        }
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        url: &str,
        mut op: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let host = Self::host_key(url);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.attempt(&host, &mut op, &classify).await? {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let (err, class) = err;
            if attempt >= self.policy.max_attempts {
                warn!("Giving up on {} after {} attempts: {}", url, attempt, err);
                return Err(RetryError::Exhausted {
                    last: err,
                    attempts: attempt,
                });
            }

            let delay = self.wait_for(class, attempt);
            debug!(
                "Attempt {} for {} failed ({}), retrying in {:?}",
                attempt, url, err, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `op` once through the circuit breaker.
    ///
    /// For callers that persist their own retry schedule: a retryable failure
    /// comes back as `Exhausted { attempts: 1 }`.
    pub async fn guard<T, E, F, Fut, C>(
        &self,
        url: &str,
        mut op: F,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let host = Self::host_key(url);
        match self.attempt(&host, &mut op, &classify).await? {
            Ok(value) => Ok(value),
            Err((last, _)) => Err(RetryError::Exhausted { last, attempts: 1 }),
        }
    }

    /// One attempt. The outer `Err` ends the retry loop (open circuit or
    /// permanent failure); the inner one is a retryable failure.
    async fn attempt<T, E, F, Fut, C>(
        &self,
        host: &str,
        op: &mut F,
        classify: &C,
    ) -> Result<Result<T, (E, ErrorClass)>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let probing = match self.breaker.admit(host).await {
            Admission::Refused => {
                return Err(RetryError::CircuitOpen {
                    host: host.to_string(),
                })
            }
            Admission::Allowed => false,
            Admission::Probe => true,
        };
        let mut guard = ProbeGuard {
            breaker: &self.breaker,
            host,
            armed: probing,
        };

        let outcome = match op().await {
            Ok(value) => {
                self.breaker.record_success(host).await;
                Ok(Ok(value))
            }
            Err(err) => match classify(&err) {
                ErrorClass::Permanent => {
                    // The host answered; it is healthy even if the resource is not.
                    self.breaker.record_success(host).await;
                    Err(RetryError::Fatal(err))
                }
                ErrorClass::Transient => {
                    self.breaker.record_failure(host).await;
                    Ok(Err((err, ErrorClass::Transient)))
                }
                class @ ErrorClass::RateLimited(_) => {
                    self.breaker.record_inconclusive(host).await;
                    Ok(Err((err, class)))
                }
            },
        };
        guard.armed = false;
        outcome
    }
}

/// Hands the half-open probe slot back when a probing call is dropped
/// before it records an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    host: &'a str,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Probe for {} abandoned", self.host);
            self.breaker.abandon_probe(self.host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_scheduler(max_attempts: u32) -> RetryScheduler {
        RetryScheduler::new(
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(8),
                max_attempts,
                jitter: 0.25,
                max_rate_limit_wait: Duration::from_millis(5),
            },
            CircuitConfig::default(),
        )
    }

    #[derive(Debug)]
    struct Flaky(ErrorClass);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let scheduler = RetryScheduler::default();
        for _ in 0..50 {
            let delays: Vec<Duration> = (1..=8).map(|a| scheduler.backoff_delay(a)).collect();
            for pair in delays.windows(2) {
                assert!(pair[0] <= pair[1], "{:?}", delays);
            }
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(32)));
        }
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let scheduler = RetryScheduler::default();
        for _ in 0..50 {
            let d = scheduler.backoff_delay(3).as_secs_f64();
            assert!((3.0..=5.0).contains(&d), "{}", d);
        }
        assert_eq!(scheduler.backoff_delay(6), Duration::from_secs(32));
        assert_eq!(scheduler.backoff_delay(40), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let scheduler = fast_scheduler(6);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<&str, RetryError<Flaky>> = scheduler
            .execute(
                "https://dati.example.org/a.xml",
                || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(Flaky(ErrorClass::Transient))
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |e: &Flaky| e.0,
            )
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let scheduler = fast_scheduler(4);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), RetryError<Flaky>> = scheduler
            .execute(
                "https://dati.example.org/a.xml",
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err(Flaky(ErrorClass::RateLimited(None))) }
                },
                |e: &Flaky| e.0,
            )
            .await;

        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let scheduler = fast_scheduler(6);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), RetryError<Flaky>> = scheduler
            .execute(
                "https://dati.example.org/a.xml",
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err(Flaky(ErrorClass::Permanent)) }
                },
                |e: &Flaky| e.0,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let scheduler = RetryScheduler::new(
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 1,
                ..Default::default()
            },
            CircuitConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        let url = "https://dati.example.org/a.xml";
        for _ in 0..2 {
            let _: Result<(), _> = scheduler
                .guard(url, || async { Err(Flaky(ErrorClass::Transient)) }, |e: &Flaky| e.0)
                .await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), RetryError<Flaky>> = scheduler
            .guard(
                url,
                || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                |e: &Flaky| e.0,
            )
            .await;

        assert!(matches!(result, Err(RetryError::CircuitOpen { ref host }) if host == "dati.example.org"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_probe_frees_half_open_slot() {
        let scheduler = RetryScheduler::new(
            RetryPolicy::default(),
            CircuitConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let url = "https://dati.example.org/a.xml";
        let _: Result<(), _> = scheduler
            .guard(url, || async { Err(Flaky(ErrorClass::Transient)) }, |e: &Flaky| e.0)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The probe hangs and its caller gives up on it.
        let hung = scheduler.guard(
            url,
            || std::future::pending::<Result<(), Flaky>>(),
            |e: &Flaky| e.0,
        );
        assert!(tokio::time::timeout(Duration::from_millis(10), hung)
            .await
            .is_err());
        tokio::task::yield_now().await;

        let result: Result<&str, RetryError<Flaky>> = scheduler
            .guard(url, || async { Ok("ok") }, |e: &Flaky| e.0)
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(
            scheduler.breaker().state("dati.example.org").await,
            CircuitState::Closed
        );
    }

    #[test]
    fn test_retry_delay_honours_server_wait() {
        let scheduler = RetryScheduler::new(
            RetryPolicy {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(60),
                jitter: 0.0,
                max_rate_limit_wait: Duration::from_secs(300),
                ..Default::default()
            },
            CircuitConfig::default(),
        );
        assert_eq!(scheduler.retry_delay(1, None), Duration::from_secs(10));
        assert_eq!(
            scheduler.retry_delay(1, Some(Duration::from_secs(120))),
            Duration::from_secs(120)
        );
        assert_eq!(
            scheduler.retry_delay(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(300)
        );
        // A shorter server wait never shortens the backoff.
        assert_eq!(
            scheduler.retry_delay(3, Some(Duration::from_secs(1))),
            Duration::from_secs(40)
        );
    }
}
