//! Circuit breaker for failure-prone scheduled work

use crate::config::BreakerSettings;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally; failures are tracked in a trailing window.
    Closed,
    /// Calls fail fast until `next_attempt`.
    Open,
    /// A single probe call is in flight.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitor window that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub reset_timeout: Duration,
    /// Trailing window over which failures are counted.
    pub monitor_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitor_window: Duration::from_secs(60),
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.threshold,
            reset_timeout: Duration::from_millis(settings.timeout_ms),
            monitor_window: Duration::from_millis(settings.window_ms),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Circuit breaker implementation
///
/// State transitions happen under one short lock and never across an
/// await point, so the breaker is safe to share between tasks.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Outcome of an admission check.
enum Admission {
    Allowed,
    Probe,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                next_attempt: None,
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    /// Execute an operation under breaker protection.
    ///
    /// In `Open` state this rejects with `Error::State` until the reset
    /// timeout elapses, after which exactly one caller is admitted as the
    /// half-open probe; concurrent callers keep getting the state error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.admit() {
            Admission::Rejected => {
                return Err(Error::State(format!(
                    "circuit breaker '{}' is open",
                    self.name
                )));
            }
            Admission::Probe => {
                debug!(breaker = %self.name, "admitting half-open probe");
            }
            Admission::Allowed => {}
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let due = inner
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    info!(breaker = %self.name, "transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Probe
                } else {
                    inner.total_rejections += 1;
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.total_rejections += 1;
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "probe succeeded, closing circuit");
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.next_attempt = None;
        }
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, error: &Error) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, %error, "probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.next_attempt = Some(now + self.config.reset_timeout);
                inner.probe_in_flight = false;
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                if let Some(window_start) = now.checked_sub(self.config.monitor_window) {
                    while inner
                        .failures
                        .front()
                        .is_some_and(|&t| t < window_start)
                    {
                        inner.failures.pop_front();
                    }
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        "opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.next_attempt = Some(now + self.config.reset_timeout);
                }
            }
            CircuitState::Open => {
                // A call admitted before the transition may report late.
                debug!(breaker = %self.name, "failure recorded while open");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reset to closed with an empty failure window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(breaker = %self.name, "reset to closed");
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.next_attempt = None;
        inner.probe_in_flight = false;
    }

    /// Force the circuit open, e.g. during supervised recovery.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "forced open");
        inner.state = CircuitState::Open;
        inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
        inner.probe_in_flight = false;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            window_failures: inner.failures.len() as u32,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }
}

/// Circuit breaker counters
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub window_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}
