//! Per-host circuit breaker.
//!
//! Counts consecutive transient failures per host inside a rolling window.
//! Once tripped, the host is refused for a cool-down; after that a single
//! half-open probe decides whether it closes again.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive transient failures that trip the circuit.
    pub failure_threshold: u32,
    /// Failures older than this no longer count.
    pub failure_window: Duration,
    /// How long a tripped circuit refuses calls.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// State of one host's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    /// Cool-down elapsed; one probe call may go through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of a host's circuit for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub recent_failures: u32,
    pub trips: u64,
}

/// Answer to a request for a call slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Refused,
    Allowed,
    /// Allowed as the single half-open probe.
    Probe,
}

#[derive(Debug, Clone)]
struct HostCircuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    trips: u64,
}

impl HostCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
            trips: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.failures.clear();
        self.trips += 1;
    }
}

/// Process-wide breaker keyed by host.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    hosts: Arc<RwLock<HashMap<String, HostCircuit>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            hosts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether a call to `host` may proceed now.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// admits exactly one caller.
    pub async fn allow(&self, host: &str) -> bool {
        self.admit(host).await != Admission::Refused
    }

    pub(crate) async fn admit(&self, host: &str) -> Admission {
        let mut hosts = self.hosts.write().await;
        let circuit = match hosts.get_mut(host) {
            Some(c) => c,
            None => return Admission::Allowed,
        };

        match circuit.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if cooled {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    info!("Circuit for {} half-open, probing", host);
                    Admission::Probe
                } else {
                    Admission::Refused
                }
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    Admission::Refused
                } else {
                    circuit.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// The probe call went away without an outcome; free its slot.
    ///
    /// Callable from `Drop`: takes the lock without waiting when it can and
    /// otherwise finishes on the runtime.
    pub(crate) fn abandon_probe(&self, host: &str) {
        fn release(hosts: &mut HashMap<String, HostCircuit>, host: &str) {
            if let Some(circuit) = hosts.get_mut(host) {
                if circuit.state == CircuitState::HalfOpen {
                    circuit.probe_in_flight = false;
                }
            }
        }

        if let Ok(mut hosts) = self.hosts.try_write() {
            release(&mut hosts, host);
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hosts = self.hosts.clone();
            let host = host.to_string();
            runtime.spawn(async move {
                release(&mut *hosts.write().await, &host);
            });
        }
    }

    /// The host answered; the circuit closes.
    pub async fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.write().await;
        if let Some(circuit) = hosts.get_mut(host) {
            if circuit.state != CircuitState::Closed {
                info!("Circuit for {} closed", host);
            }
            circuit.state = CircuitState::Closed;
            circuit.failures.clear();
            circuit.opened_at = None;
            circuit.probe_in_flight = false;
        }
    }

    /// A transient failure against the host.
    pub async fn record_failure(&self, host: &str) {
        let now = Instant::now();
        let mut hosts = self.hosts.write().await;
        let circuit = hosts
            .entry(host.to_string())
            .or_insert_with(HostCircuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.open(now);
                warn!(
                    "Circuit for {} reopened after failed probe, cooling down {:?}",
                    host, self.config.cooldown
                );
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                circuit.failures.push_back(now);
                while let Some(front) = circuit.failures.front() {
                    if now.duration_since(*front) > self.config.failure_window {
                        circuit.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if circuit.failures.len() >= self.config.failure_threshold as usize {
                    circuit.open(now);
                    warn!(
                        "Circuit for {} tripped after {} consecutive failures, cooling down {:?}",
                        host, self.config.failure_threshold, self.config.cooldown
                    );
                }
            }
        }
    }

    /// The call neither proved nor disproved the host's health (rate limited).
    /// A half-open circuit gets its probe slot back.
    pub async fn record_inconclusive(&self, host: &str) {
        let mut hosts = self.hosts.write().await;
        if let Some(circuit) = hosts.get_mut(host) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.probe_in_flight = false;
            }
        }
    }

    pub async fn state(&self, host: &str) -> CircuitState {
        let hosts = self.hosts.read().await;
        hosts
            .get(host)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Stats for every host seen so far.
    pub async fn stats(&self) -> HashMap<String, CircuitStats> {
        let hosts = self.hosts.read().await;
        hosts
            .iter()
            .map(|(host, c)| {
                (
                    host.clone(),
                    CircuitStats {
                        state: c.state,
                        recent_failures: c.failures.len() as u32,
                        trips: c.trips,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[tokio::test]
    async fn test_trips_after_threshold() {
        let cb = breaker(10_000);
        for _ in 0..2 {
            cb.record_failure("camera.example.org").await;
        }
        assert!(cb.allow("camera.example.org").await);

        cb.record_failure("camera.example.org").await;
        assert_eq!(cb.state("camera.example.org").await, CircuitState::Open);
        assert!(!cb.allow("camera.example.org").await);
        // Other hosts are unaffected.
        assert!(cb.allow("senato.example.org").await);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker(10_000);
        cb.record_failure("h").await;
        cb.record_failure("h").await;
        cb.record_success("h").await;
        cb.record_failure("h").await;
        cb.record_failure("h").await;
        assert_eq!(cb.state("h").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let cb = breaker(20);
        for _ in 0..3 {
            cb.record_failure("h").await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cb.allow("h").await);
        assert_eq!(cb.state("h").await, CircuitState::HalfOpen);
        assert!(!cb.allow("h").await);

        cb.record_success("h").await;
        assert_eq!(cb.state("h").await, CircuitState::Closed);
        assert!(cb.allow("h").await);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let cb = breaker(20);
        for _ in 0..3 {
            cb.record_failure("h").await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow("h").await);

        cb.record_failure("h").await;
        assert_eq!(cb.state("h").await, CircuitState::Open);
        assert!(!cb.allow("h").await);
        assert_eq!(cb.stats().await["h"].trips, 2);
    }

    #[tokio::test]
    async fn test_abandoned_probe_can_be_retaken() {
        let cb = breaker(20);
        for _ in 0..3 {
            cb.record_failure("h").await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.admit("h").await, Admission::Probe);
        assert_eq!(cb.admit("h").await, Admission::Refused);

        cb.abandon_probe("h");
        assert_eq!(cb.admit("h").await, Admission::Probe);
        assert_eq!(cb.state("h").await, CircuitState::HalfOpen);
    }
}
