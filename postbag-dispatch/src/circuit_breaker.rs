//! Circuit breaker around the transport send path
//!
//! Protects the mail relay from being hammered while it is down. Every batch
//! send goes through [`CircuitBreaker::execute`], which either runs the send or
//! short-circuits straight to the caller's fallback.
//!
//! # Circuit Breaker Pattern
//!
//! The circuit breaker has three states:
//! - **Closed**: Normal operation, all sends allowed
//! - **Open**: Circuit tripped due to failures, all sends rejected immediately
//! - **Half-Open**: Testing recovery, one trial send at a time
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  Failure threshold exceeded  ┌──────┐
//! │ Closed  │ ──────────────────────────>  │ Open │
//! └─────────┘                               └──────┘
//!     ^                                        │
//!     │                                        │ Cooldown elapsed
//!     │                                        v
//!     │  Success              ┌───────────────┐
//!     └───────────────────────│  Half-Open    │
//!                             └───────────────┘
//!                                     │
//!                                     │ Failure
//!                                     v
//!                               ┌──────┐
//!                               │ Open │
//!                               └──────┘
//! ```
//!
//! # Example
//!
//! ```text
//! Threshold: 5 failures in 60 seconds
//! Cooldown: 5 minutes
//!
//! t=0s:   Closed (normal)
//! t=50s:  5 failed batches → Open (circuit trips)
//! t=50s-350s: Batches short-circuited to the recovery fallback
//! t=350s: Half-Open (one trial batch allowed)
//! t=351s: Trial succeeds → Closed (normal operation resumes)
//! ```

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use postbag_common::tracing;
use postbag_metrics::DispatchMetrics;
use serde::{Deserialize, Serialize};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time window for counting failures (seconds)
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// How long the circuit stays open before testing recovery (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Number of consecutive successes needed to close circuit from half-open
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            timeout_secs: default_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5 // Trip circuit after 5 failures
}

const fn default_failure_window_secs() -> u64 {
    60 // Count failures within 60 second window
}

const fn default_timeout_secs() -> u64 {
    300 // Keep circuit open for 5 minutes
}

const fn default_success_threshold() -> u32 {
    1 // Close circuit after 1 success in half-open state
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all sends allowed
    Closed,
    /// Circuit tripped - reject all sends immediately
    Open,
    /// Testing recovery - one trial send at a time
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Why the fallback of [`CircuitBreaker::execute`] ran
#[derive(Debug)]
pub enum Trip<E> {
    /// The circuit was open; the operation was never started
    Open,
    /// The operation ran and failed
    Failed(E),
}

/// Whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    /// Half-open probe; only one may be outstanding
    Trial,
    Rejected,
}

#[derive(Debug)]
struct CircuitBreakerData {
    state: CircuitState,
    /// Number of consecutive failures
    failure_count: u32,
    /// Timestamp of first failure in current window
    first_failure_at: Option<Instant>,
    /// Timestamp when circuit was opened
    opened_at: Option<Instant>,
    /// Number of consecutive successes in half-open state
    consecutive_successes: u32,
    /// A half-open trial is currently running
    trial_in_flight: bool,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerData {
    const fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            first_failure_at: None,
            opened_at: None,
            consecutive_successes: 0,
            trial_in_flight: false,
            config,
        }
    }

    fn is_failure_window_expired(&self) -> bool {
        self.first_failure_at.is_none_or(|first_failure| {
            let window = Duration::from_secs(self.config.failure_window_secs);
            Instant::now().duration_since(first_failure) > window
        })
    }

    fn is_timeout_expired(&self) -> bool {
        self.opened_at.is_some_and(|opened_at| {
            let timeout = Duration::from_secs(self.config.timeout_secs);
            Instant::now().duration_since(opened_at) >= timeout
        })
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
    }

    /// Record a failure and update state
    ///
    /// Returns the new state if the circuit transitioned
    fn record_failure(&mut self) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                if self.is_failure_window_expired() {
                    self.failure_count = 0;
                    self.first_failure_at = None;
                }

                if self.first_failure_at.is_none() {
                    self.first_failure_at = Some(Instant::now());
                }
                self.failure_count += 1;

                if self.failure_count >= self.config.failure_threshold {
                    self.open();
                    tracing::warn!(
                        failure_count = self.failure_count,
                        threshold = self.config.failure_threshold,
                        timeout_secs = self.config.timeout_secs,
                        "Circuit breaker OPENED - short-circuiting sends to the transport"
                    );
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.open();
                tracing::warn!("Circuit breaker trial failed - reopening circuit");
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Record a success and update state
    ///
    /// Returns the new state if the circuit transitioned
    fn record_success(&mut self) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.first_failure_at = None;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;

                if self.consecutive_successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.first_failure_at = None;
                    self.opened_at = None;
                    self.consecutive_successes = 0;
                    tracing::info!("Circuit breaker CLOSED - normal operation resumed");
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => {
                tracing::warn!("Unexpected success while circuit is open");
                None
            }
        }
    }

    /// Decide whether a call may proceed, moving Open → Half-Open once the
    /// cooldown has elapsed
    fn admit(&mut self) -> (Admission, Option<CircuitState>) {
        match self.state {
            CircuitState::Closed => (Admission::Allowed, None),
            CircuitState::Open if self.is_timeout_expired() => {
                self.state = CircuitState::HalfOpen;
                self.consecutive_successes = 0;
                self.trial_in_flight = true;
                tracing::info!("Circuit breaker entering HALF-OPEN state - testing recovery");
                (Admission::Trial, Some(CircuitState::HalfOpen))
            }
            CircuitState::Open => (Admission::Rejected, None),
            CircuitState::HalfOpen if self.trial_in_flight => (Admission::Rejected, None),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                (Admission::Trial, None)
            }
        }
    }
}

/// Clears the half-open trial slot when the trial finishes or is dropped
struct TrialSlot<'a> {
    data: &'a Mutex<CircuitBreakerData>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        self.data.lock().trial_in_flight = false;
    }
}

/// Circuit breaker guarding the transport
#[derive(Debug)]
pub struct CircuitBreaker {
    data: Mutex<CircuitBreakerData>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            data: Mutex::new(CircuitBreakerData::new(config)),
            metrics: None,
        }
    }

    /// Report state transitions to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `operation` under the breaker.
    ///
    /// When the circuit rejects the call, `operation` is never started and
    /// `fallback(Trip::Open)` supplies the result. When `operation` fails the
    /// failure is recorded and `fallback(Trip::Failed(error))` supplies the
    /// result. The fallback must not retry the operation.
    pub async fn execute<T, E, Op, OpFut, Fb, FbFut>(&self, operation: Op, fallback: Fb) -> T
    where
        Op: FnOnce() -> OpFut,
        OpFut: Future<Output = Result<T, E>>,
        Fb: FnOnce(Trip<E>) -> FbFut,
        FbFut: Future<Output = T>,
    {
        let admission = self.admit();

        if admission == Admission::Rejected {
            tracing::debug!("Circuit breaker rejected call - running fallback");
            return fallback(Trip::Open).await;
        }

        let _slot = (admission == Admission::Trial).then(|| TrialSlot { data: &self.data });

        match operation().await {
            Ok(value) => {
                self.record_success();
                value
            }
            Err(error) => {
                self.record_failure();
                fallback(Trip::Failed(error)).await
            }
        }
    }

    fn admit(&self) -> Admission {
        let (admission, transition) = self.data.lock().admit();
        self.report(transition);
        admission
    }

    /// Record a successful call
    ///
    /// Returns `true` if circuit transitioned to Closed state (recovered)
    pub fn record_success(&self) -> bool {
        let transition = self.data.lock().record_success();
        self.report(transition);
        transition.is_some()
    }

    /// Record a failed call
    ///
    /// Returns `true` if circuit transitioned to Open state (tripped)
    pub fn record_failure(&self) -> bool {
        let transition = self.data.lock().record_failure();
        self.report(transition);
        transition.is_some()
    }

    fn report(&self, transition: Option<CircuitState>) {
        if let (Some(state), Some(metrics)) = (transition, &self.metrics) {
            metrics.record_breaker_transition(state.as_str());
        }
    }

    /// Current circuit state
    ///
    /// Does not advance Open → Half-Open; that only happens on admission.
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Statistics for monitoring/debugging
    pub fn stats(&self) -> CircuitBreakerStats {
        let data = self.data.lock();
        CircuitBreakerStats {
            state: data.state,
            failure_count: data.failure_count,
            consecutive_successes: data.consecutive_successes,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Number of consecutive failures
    pub failure_count: u32,
    /// Number of consecutive successes in half-open state
    pub consecutive_successes: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config(failure_threshold: u32, timeout_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            failure_window_secs: 60,
            timeout_secs,
            success_threshold: 1,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> &'static str {
        breaker
            .execute(
                || async { Err::<&str, &str>("boom") },
                |trip| async move {
                    match trip {
                        Trip::Open => "open",
                        Trip::Failed(_) => "failed",
                    }
                },
            )
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> &'static str {
        breaker
            .execute(
                || async { Ok::<&str, &str>("ok") },
                |trip| async move {
                    match trip {
                        Trip::Open => "open",
                        Trip::Failed(_) => "failed",
                    }
                },
            )
            .await
    }

    #[test]
    fn test_circuit_breaker_closed_to_open() {
        let breaker = CircuitBreaker::new(config(3, 5));

        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn test_circuit_breaker_half_open_success() {
        let breaker = CircuitBreaker::new(config(2, 0));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Immediate cooldown (timeout=0)
        assert_eq!(breaker.admit(), Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.record_success());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_half_open_failure() {
        let breaker = CircuitBreaker::new(config(2, 0));

        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.admit(), Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_one_trial_at_a_time() {
        let breaker = CircuitBreaker::new(config(1, 0));
        breaker.record_failure();

        assert_eq!(breaker.admit(), Admission::Trial);
        assert_eq!(breaker.admit(), Admission::Rejected);

        // Releasing the slot lets the next trial through
        drop(TrialSlot {
            data: &breaker.data,
        });
        assert_eq!(breaker.admit(), Admission::Trial);
    }

    #[test]
    fn test_circuit_breaker_failure_window_expiry() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window_secs: 1,
            timeout_secs: 5,
            success_threshold: 1,
        });

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        std::thread::sleep(Duration::from_secs(2));

        // Next failure starts a new window
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let breaker = CircuitBreaker::new(config(3, 5));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_stats() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);

        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.stats().failure_count, 2);
    }

    #[tokio::test]
    async fn test_execute_runs_fallback_on_failure() {
        let breaker = CircuitBreaker::new(config(2, 300));

        assert_eq!(succeed(&breaker).await, "ok");
        assert_eq!(fail(&breaker).await, "failed");
        assert_eq!(fail(&breaker).await, "failed");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_short_circuits_when_open() {
        let breaker = CircuitBreaker::new(config(1, 300));
        let calls = AtomicU32::new(0);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<&str, &str>("ok") }
                },
                |trip| async move {
                    assert!(matches!(trip, Trip::Open));
                    "open"
                },
            )
            .await;

        assert_eq!(result, "open");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_trial_recovers_circuit() {
        let breaker = CircuitBreaker::new(config(1, 0));

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        assert_eq!(succeed(&breaker).await, "ok");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(config(1, 0));

        fail(&breaker).await;
        assert_eq!(fail(&breaker).await, "failed");
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_transitions_are_reported_to_metrics() {
        let metrics = Arc::new(DispatchMetrics::new().expect("metrics"));
        let breaker = CircuitBreaker::new(config(1, 0)).with_metrics(Arc::clone(&metrics));

        fail(&breaker).await;
        succeed(&breaker).await;

        assert_eq!(metrics.breaker_opened_total(), 1);
    }
}
