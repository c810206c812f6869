//! Per-backend circuit breaker.
//!
//! The circuit breaker prevents request pile-up during backend outages by
//! failing fast once a service is known to be unhealthy. This reduces load on
//! the failing service and improves its recovery time.
//!
//! # States
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        Circuit Breaker                             │
//! │                                                                    │
//! │  ┌─────────┐    failures > threshold    ┌─────────┐               │
//! │  │  Closed │ ────────────────────────► │  Open   │               │
//! │  │ (Normal)│                            │ (Fail   │               │
//! │  └────┬────┘                            │  Fast)  │               │
//! │       ▲                                 └────┬────┘               │
//! │       │                                      │                    │
//! │       │                                      │ cool-down elapsed, │
//! │       │                                      │ next call attempt  │
//! │       │                                      ▼                    │
//! │       │ max_probes                   ┌───────────────┐            │
//! │       │ successes                    │   HalfOpen    │            │
//! │       └───────────────────────────── │ (at most      │            │
//! │                                      │  max_probes)  │            │
//! │                                      └───────┬───────┘            │
//! │                                              │ any probe failure  │
//! │                                              ▼                    │
//! │                                      ┌─────────┐                  │
//! │                                      │  Open   │ (fresh cool-down)│
//! │                                      └─────────┘                  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Permits
//!
//! Every admitted call holds a [`CallPermit`] stamped with the breaker's
//! generation. The generation advances on every state transition, so an
//! outcome reported by a call admitted under an earlier state is discarded
//! instead of corrupting the counters of the current one. A permit dropped
//! without an outcome (client went away mid-call) releases its probe slot.
//!
//! # Usage
//!
//! ```rust,ignore
//! let breaker = registry.get_or_create("users");
//! let permit = breaker.try_acquire()?;          // CircuitOpen when rejected
//! let response = forward(request).await;
//! permit.record(CallOutcome::from_status(response.status()));
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
    /// Testing recovery - allowing a bounded number of probes through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Result of a call that went through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    /// Server errors count against the backend; every other completed
    /// response counts as healthy.
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_server_error() {
            CallOutcome::Failure
        } else {
            CallOutcome::Success
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures tolerated; one more opens the circuit.
    pub failure_threshold: u32,
    /// Probes admitted per half-open period; that many successes close the circuit.
    pub max_probes: u32,
    /// How long to stay in open state before transitioning to half-open.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            max_probes: 3,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    pub fn new(failure_threshold: u32, max_probes: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            max_probes,
            open_duration,
        }
    }
}

/// Point-in-time view of a breaker, for health output and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probes_in_flight: u32,
}

/// Internal state for the circuit breaker.
struct CircuitBreakerState {
    state: CircuitState,
    /// When the circuit was opened (for cool-down calculation).
    opened_at: Option<Instant>,
    /// Consecutive failures while closed.
    consecutive_failures: u32,
    probes_in_flight: u32,
    probe_successes: u32,
    /// Bumped on every transition.
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            consecutive_failures: 0,
            probes_in_flight: 0,
            probe_successes: 0,
            generation: 0,
        }
    }
}

/// Thread-safe circuit breaker for one backend service.
///
/// Transitions are serialized behind a synchronous mutex: critical sections
/// never await, and [`CallPermit`]'s `Drop` has to be able to take the lock.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    /// Total number of times the circuit has been opened.
    times_opened: AtomicU32,
    /// Total number of calls rejected while open or probe-saturated.
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker for `service`.
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(CircuitBreakerState::new()),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission to call the backend.
    ///
    /// # State Transitions
    ///
    /// - **Closed**: Always admits
    /// - **Open**: Rejects until the cool-down has elapsed; the first attempt
    ///   after it moves the breaker to HalfOpen and is admitted as a probe
    /// - **HalfOpen**: Admits until `max_probes` probes are outstanding or
    ///   have succeeded
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::CircuitOpen` when the call is rejected. Nothing
    /// is recorded for a rejected call.
    pub fn try_acquire(self: &Arc<Self>) -> GatewayResult<CallPermit> {
        let mut state = self.lock();

        if state.state == CircuitState::Open {
            let cooled_down = state
                .opened_at
                .is_none_or(|opened_at| opened_at.elapsed() >= self.config.open_duration);
            if !cooled_down {
                drop(state);
                return Err(self.reject());
            }
            self.transition(&mut state, CircuitState::HalfOpen);
        }

        match state.state {
            CircuitState::Closed => Ok(CallPermit::new(self, state.generation, false)),
            CircuitState::HalfOpen => {
                if state.probes_in_flight + state.probe_successes >= self.config.max_probes {
                    drop(state);
                    return Err(self.reject());
                }
                state.probes_in_flight += 1;
                debug!(
                    service = %self.service,
                    probes_in_flight = state.probes_in_flight,
                    "Admitted half-open probe"
                );
                Ok(CallPermit::new(self, state.generation, true))
            }
            CircuitState::Open => {
                drop(state);
                Err(self.reject())
            }
        }
    }

    fn reject(&self) -> GatewayError {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_rejection(&self.service);
        GatewayError::CircuitOpen(self.service.clone())
    }

    /// Apply an outcome reported through a permit. `None` means the call was
    /// abandoned before completing.
    fn settle(&self, generation: u64, probe: bool, outcome: Option<CallOutcome>) {
        let mut state = self.lock();

        if state.generation != generation {
            debug!(service = %self.service, "Discarding outcome from a previous breaker state");
            return;
        }

        match (state.state, outcome) {
            (CircuitState::Closed, Some(CallOutcome::Success)) => {
                state.consecutive_failures = 0;
            }
            (CircuitState::Closed, Some(CallOutcome::Failure)) => {
                state.consecutive_failures += 1;
                debug!(
                    service = %self.service,
                    consecutive_failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker recorded failure"
                );
                if state.consecutive_failures > self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, outcome) if probe => {
                state.probes_in_flight = state.probes_in_flight.saturating_sub(1);
                match outcome {
                    Some(CallOutcome::Success) => {
                        state.probe_successes += 1;
                        if state.probe_successes >= self.config.max_probes {
                            self.transition(&mut state, CircuitState::Closed);
                        }
                    }
                    Some(CallOutcome::Failure) => {
                        state.consecutive_failures += 1;
                        self.transition(&mut state, CircuitState::Open);
                    }
                    None => {}
                }
            }
            _ => {}
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.generation = state.generation.wrapping_add(1);
        state.probes_in_flight = 0;
        state.probe_successes = 0;

        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_breaker_open(&self.service);
                warn!(
                    service = %self.service,
                    %from,
                    failures = state.consecutive_failures,
                    open_duration = ?self.config.open_duration,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(service = %self.service, %from, "Circuit breaker half-open, probing backend");
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.consecutive_failures = 0;
                info!(
                    service = %self.service,
                    %from,
                    "Circuit breaker closed after successful recovery"
                );
            }
        }

        metrics::set_circuit_breaker_state(&self.service, to);
    }

    /// Get the current circuit state.
    ///
    /// An open breaker whose cool-down has elapsed still reports `Open` until
    /// the next call attempt moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_probes_in_flight: state.probes_in_flight,
        }
    }

    /// Name of the backend service this breaker guards.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get the number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Get the number of calls rejected by this breaker.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }
}

/// Admission ticket for one backend call.
///
/// Consume it with [`CallPermit::record`]. Dropping it unrecorded releases a
/// half-open probe slot without counting an outcome.
#[must_use = "report the call outcome with CallPermit::record"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: &Arc<CircuitBreaker>, generation: u64, probe: bool) -> Self {
        Self {
            breaker: Arc::clone(breaker),
            generation,
            probe,
            settled: false,
        }
    }

    /// Whether this call was admitted as a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Report how the call went.
    pub fn record(mut self, outcome: CallOutcome) {
        self.settled = true;
        self.breaker.settle(self.generation, self.probe, Some(outcome));
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.generation, self.probe, None);
        }
    }
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("service", &self.breaker.service)
            .field("generation", &self.generation)
            .field("probe", &self.probe)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, max_probes: u32, open_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "users",
            CircuitBreakerConfig::new(
                failure_threshold,
                max_probes,
                Duration::from_millis(open_ms),
            ),
        ))
    }

    fn fail(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().record(CallOutcome::Failure);
    }

    fn succeed(cb: &Arc<CircuitBreaker>) {
        cb.try_acquire().unwrap().record(CallOutcome::Success);
    }

    /// Fail calls until the breaker opens.
    fn trip(cb: &Arc<CircuitBreaker>) {
        while cb.state() != CircuitState::Open {
            fail(cb);
        }
    }

    #[test]
    fn test_circuit_breaker_starts_closed() {
        let cb = Arc::new(CircuitBreaker::new("users", CircuitBreakerConfig::default()));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            CallOutcome::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            CallOutcome::Failure
        );
        assert_eq!(
            CallOutcome::from_status(StatusCode::SERVICE_UNAVAILABLE),
            CallOutcome::Failure
        );
        assert_eq!(
            CallOutcome::from_status(StatusCode::NOT_FOUND),
            CallOutcome::Success
        );
        assert_eq!(CallOutcome::from_status(StatusCode::OK), CallOutcome::Success);
    }

    #[test]
    fn test_failures_beyond_threshold_open_circuit() {
        let cb = breaker(5, 3, 30_000);

        for _ in 0..5 {
            fail(&cb);
        }
        // Reaching the threshold is tolerated.
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 5);

        fail(&cb);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, 6);
        assert_eq!(cb.times_opened(), 1);
    }

    #[test]
    fn test_circuit_rejects_when_open_without_recording() {
        let cb = breaker(1, 3, 30_000);
        trip(&cb);

        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen(ref s) if s == "users"));
        assert_eq!(cb.requests_rejected(), 1);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let cb = breaker(3, 1, 30_000);

        fail(&cb);
        fail(&cb);
        succeed(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 0);

        fail(&cb);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_first_attempt_after_cool_down_is_probe() {
        let cb = breaker(1, 3, 10);
        trip(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.snapshot().half_open_probes_in_flight, 1);
        permit.record(CallOutcome::Success);
    }

    #[tokio::test]
    async fn test_half_open_admits_at_most_max_probes() {
        let cb = breaker(1, 3, 10);
        trip(&cb);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let p1 = cb.try_acquire().unwrap();
        let p2 = cb.try_acquire().unwrap();
        let p3 = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_err());

        p1.record(CallOutcome::Success);
        // Still saturated: one success plus two in flight.
        assert!(cb.try_acquire().is_err());

        p2.record(CallOutcome::Success);
        p3.record(CallOutcome::Success);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failing_probe_reopens_with_fresh_cool_down() {
        let cb = breaker(1, 3, 30);
        trip(&cb);
        tokio::time::sleep(Duration::from_millis(40)).await;

        cb.try_acquire().unwrap().record(CallOutcome::Failure);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.times_opened(), 2);

        // The cool-down restarted, so the breaker rejects straight away.
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_stale_outcome_is_discarded() {
        let cb = breaker(2, 1, 10);

        let slow_call = cb.try_acquire().unwrap();
        trip(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let probe = cb.try_acquire().unwrap();

        // Admitted while closed; must not count against the half-open period.
        slow_call.record(CallOutcome::Failure);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        probe.record(CallOutcome::Success);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_probe_releases_slot() {
        let cb = breaker(1, 1, 10);
        trip(&cb);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let probe = cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_err());
        drop(probe);

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }
}
