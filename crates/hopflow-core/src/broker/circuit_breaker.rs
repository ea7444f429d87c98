//! Count-based circuit breaker guarding broker dispatch.
//!
//! State machine:
//! - `Closed`: calls flow. The last `sliding_window_size` outcomes are kept;
//!   once at least `minimum_number_of_calls` are buffered, a failure rate or
//!   slow-call rate at or above its threshold opens the circuit.
//! - `Open`: calls are rejected until `wait_duration_in_open_state` elapses.
//!   With automatic transition enabled the breaker reports `HalfOpen` as soon
//!   as the wait is over; otherwise it moves on the next call attempt
//!   or an explicit [`CircuitBreaker::transition_to_half_open`].
//! - `HalfOpen`: up to `permitted_number_of_calls_in_half_open_state` trial
//!   calls. Any failed or slow trial reopens the circuit; a full set of
//!   healthy trials closes it.
//!
//! Guarded calls hold a [`CallPermit`]. A permit dropped before its outcome
//! is recorded (a cancelled send, for instance) hands its trial slot back so
//! the breaker cannot stall in `HalfOpen`.
//!
//! State lives behind a mutex so every dispatch can read and update it
//! without caller coordination.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use hopflow_types::config::CircuitBreakerConfig;
use hopflow_types::error::BrokerError;
use serde::Serialize;
use tokio::time::Instant;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// `None` until the minimum number of calls has been buffered.
    pub failure_rate: Option<f64>,
    pub slow_call_rate: Option<f64>,
    pub buffered_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub not_permitted_calls: u64,
}

#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    failed: bool,
    slow: bool,
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { issued: usize, outcomes: Vec<CallOutcome> },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Bumped on every transition; permits from an earlier state are stale.
    generation: u64,
    window: VecDeque<CallOutcome>,
    not_permitted_calls: u64,
}

/// Permission for one guarded call, obtained from [`CircuitBreaker::acquire`].
///
/// Report the outcome with [`CallPermit::record`]. Dropping the permit
/// without recording frees its slot and leaves the window untouched.
#[derive(Debug)]
#[must_use = "an unrecorded permit does not count toward the breaker's window"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    started: Instant,
    settled: bool,
}

impl CallPermit {
    /// Record the call's outcome, timed from acquisition.
    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker
            .settle(self.generation, self.started.elapsed(), success);
    }

    /// Give the permit back without counting the call.
    pub fn release(self) {}
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_slot(self.generation);
        }
    }
}

/// Circuit breaker for one dispatch target.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                window: VecDeque::new(),
                not_permitted_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Reports `HalfOpen` once the open wait has elapsed when
    /// automatic transition is enabled.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        if self.config.automatic_transition_from_open_to_half_open_enabled {
            self.maybe_half_open(&mut inner);
        }
        Self::public_state(&inner.state)
    }

    /// Ask permission for one call, returning a permit that reports back
    /// to this breaker.
    pub fn acquire(self: &Arc<Self>) -> Result<CallPermit, BrokerError> {
        let generation = self.acquire_slot()?;
        Ok(CallPermit {
            breaker: Arc::clone(self),
            generation,
            started: Instant::now(),
            settled: false,
        })
    }

    /// Ask permission for one call. The caller must report the outcome
    /// through [`CircuitBreaker::on_result`].
    pub fn try_acquire(&self) -> Result<(), BrokerError> {
        self.acquire_slot().map(|_| ())
    }

    /// Record a permitted call's outcome.
    pub fn on_result(&self, elapsed: Duration, success: bool) {
        let mut guard = self.lock();
        self.apply_outcome(&mut guard, self.outcome(elapsed, success));
    }

    /// Force `Open -> HalfOpen` regardless of the remaining wait.
    pub fn transition_to_half_open(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, BreakerState::Open { .. }) {
            self.transition(&mut inner, BreakerState::HalfOpen {
                issued: 0,
                outcomes: Vec::new(),
            });
        }
    }

    /// Return to `Closed` with an empty window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.not_permitted_calls = 0;
        self.transition(&mut inner, BreakerState::Closed);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.lock();
        if self.config.automatic_transition_from_open_to_half_open_enabled {
            self.maybe_half_open(&mut inner);
        }
        let buffered = inner.window.len();
        let failed = inner.window.iter().filter(|o| o.failed).count();
        let slow = inner.window.iter().filter(|o| o.slow).count();
        let enough = buffered >= self.minimum_calls();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: Self::public_state(&inner.state),
            failure_rate: enough.then(|| percentage(failed, buffered)),
            slow_call_rate: enough.then(|| percentage(slow, buffered)),
            buffered_calls: buffered,
            failed_calls: failed,
            slow_calls: slow,
            not_permitted_calls: inner.not_permitted_calls,
        }
    }

    // ---- internals ----

    /// Take a call slot; returns the generation it was granted in.
    fn acquire_slot(&self) -> Result<u64, BrokerError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.maybe_half_open(inner);

        let permitted = self.config.permitted_number_of_calls_in_half_open_state;
        let allowed = match &mut inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { .. } => false,
            BreakerState::HalfOpen { issued, .. } => {
                if *issued < permitted {
                    *issued += 1;
                    true
                } else {
                    false
                }
            }
        };

        if allowed {
            Ok(inner.generation)
        } else {
            inner.not_permitted_calls += 1;
            Err(BrokerError::CircuitOpen {
                name: self.name.clone(),
                state: Self::public_state(&inner.state).to_string(),
            })
        }
    }

    fn settle(&self, generation: u64, elapsed: Duration, success: bool) {
        let mut guard = self.lock();
        if guard.generation != generation {
            return;
        }
        self.apply_outcome(&mut guard, self.outcome(elapsed, success));
    }

    fn release_slot(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let BreakerState::HalfOpen { issued, .. } = &mut inner.state {
            *issued = issued.saturating_sub(1);
        }
    }

    fn outcome(&self, elapsed: Duration, success: bool) -> CallOutcome {
        CallOutcome {
            failed: !success,
            slow: elapsed >= self.config.slow_call_duration_threshold(),
        }
    }

    fn apply_outcome(&self, inner: &mut Inner, outcome: CallOutcome) {
        match &mut inner.state {
            BreakerState::Closed => {
                inner.window.push_back(outcome);
                while inner.window.len() > self.config.sliding_window_size {
                    inner.window.pop_front();
                }
                if self.threshold_exceeded(&inner.window) {
                    self.transition(inner, BreakerState::Open {
                        opened_at: Instant::now(),
                    });
                }
            }
            BreakerState::HalfOpen { outcomes, .. } => {
                outcomes.push(outcome);
                let trials = outcomes.len();
                if outcome.failed || outcome.slow {
                    self.transition(inner, BreakerState::Open {
                        opened_at: Instant::now(),
                    });
                } else if trials >= self.config.permitted_number_of_calls_in_half_open_state {
                    self.transition(inner, BreakerState::Closed);
                }
            }
            // A call permitted before the circuit opened; its outcome no longer matters.
            BreakerState::Open { .. } => {}
        }
    }

    fn minimum_calls(&self) -> usize {
        self.config
            .minimum_number_of_calls
            .min(self.config.sliding_window_size)
            .max(1)
    }

    fn threshold_exceeded(&self, window: &VecDeque<CallOutcome>) -> bool {
        let total = window.len();
        if total < self.minimum_calls() {
            return false;
        }
        let failed = window.iter().filter(|o| o.failed).count();
        let slow = window.iter().filter(|o| o.slow).count();
        percentage(failed, total) >= self.config.failure_rate_threshold
            || percentage(slow, total) >= self.config.slow_call_rate_threshold
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if let BreakerState::Open { opened_at } = inner.state
            && opened_at.elapsed() >= self.config.wait_duration_in_open_state()
        {
            self.transition(inner, BreakerState::HalfOpen {
                issued: 0,
                outcomes: Vec::new(),
            });
        }
    }

    fn transition(&self, inner: &mut Inner, next: BreakerState) {
        let from = Self::public_state(&inner.state);
        let to = Self::public_state(&next);
        inner.state = next;
        inner.generation += 1;
        inner.window.clear();

        if from == to {
            return;
        }
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, %from, %to, "circuit breaker opened")
            }
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit breaker state transition"),
        }
    }

    fn public_state(state: &BreakerState) -> CircuitState {
        match state {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// Keyed set of circuit breakers sharing one configuration.
///
/// Created once at startup and handed to the dispatch components.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create the breaker with this name.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = %name, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Metrics for every registered breaker, sorted by name.
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: Duration = Duration::from_millis(1);

    fn config(window: usize, min_calls: usize, failure_rate: f64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: window,
            minimum_number_of_calls: min_calls,
            failure_rate_threshold: failure_rate,
            permitted_number_of_calls_in_half_open_state: 2,
            wait_duration_in_open_state_ms: 1_000,
            ..CircuitBreakerConfig::default()
        }
    }

    fn call(cb: &CircuitBreaker, success: bool) {
        cb.try_acquire().unwrap();
        cb.on_result(FAST, success);
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let cb = CircuitBreaker::new("broker-memory", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_at_failure_rate_within_window() {
        let cb = CircuitBreaker::new("broker-memory", config(4, 2, 50.0));
        call(&cb, true);
        call(&cb, true);
        call(&cb, false);
        assert_eq!(cb.state(), CircuitState::Closed);
        call(&cb, false);
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        match err {
            BrokerError::CircuitOpen { name, state } => {
                assert_eq!(name, "broker-memory");
                assert_eq!(state, "OPEN");
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(cb.metrics().not_permitted_calls, 1);
    }

    #[test]
    fn test_minimum_calls_gate() {
        let cb = CircuitBreaker::new("b", config(10, 5, 50.0));
        for _ in 0..4 {
            call(&cb, false);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.metrics().failure_rate.is_none());
        call(&cb, false);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_sliding_window_evicts_old_outcomes() {
        let cb = CircuitBreaker::new("b", config(4, 4, 75.0));
        call(&cb, false);
        call(&cb, false);
        call(&cb, true);
        call(&cb, true);
        // window [F, F, S, S] = 50%
        call(&cb, true);
        // window [F, S, S, S] = 25%
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failed_calls, 1);
    }

    #[test]
    fn test_slow_calls_open_circuit() {
        let mut cfg = config(4, 2, 100.0);
        cfg.slow_call_rate_threshold = 50.0;
        cfg.slow_call_duration_threshold_ms = 100;
        let cb = CircuitBreaker::new("b", cfg);
        cb.try_acquire().unwrap();
        cb.on_result(Duration::from_millis(150), true);
        cb.try_acquire().unwrap();
        cb.on_result(Duration::from_millis(150), true);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_transition_to_half_open_then_close() {
        let cb = CircuitBreaker::new("b", config(2, 2, 50.0));
        call(&cb, false);
        call(&cb, false);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        call(&cb, true);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        call(&cb, true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("b", config(2, 2, 50.0));
        call(&cb, false);
        call(&cb, false);
        tokio::time::advance(Duration::from_secs(1)).await;

        call(&cb, false);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let cb = CircuitBreaker::new("b", config(2, 2, 50.0));
        call(&cb, false);
        call(&cb, false);
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, BrokerError::CircuitOpen { ref state, .. } if state == "HALF_OPEN"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_transition_waits_for_next_call() {
        let mut cfg = config(2, 2, 50.0);
        cfg.automatic_transition_from_open_to_half_open_enabled = false;
        let cb = CircuitBreaker::new("b", cfg);
        call(&cb, false);
        call(&cb, false);

        tokio::time::advance(Duration::from_secs(5)).await;
        // Still reported open until the next call attempt.
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    fn tripped(cfg: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let cb = Arc::new(CircuitBreaker::new("b", cfg));
        call(&cb, false);
        call(&cb, false);
        cb
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_permit_frees_trial_slot() {
        let cb = tripped(config(2, 2, 50.0));
        tokio::time::advance(Duration::from_secs(1)).await;

        let first = cb.acquire().unwrap();
        let second = cb.acquire().unwrap();
        assert!(cb.acquire().is_err());

        drop(first);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let third = cb.acquire().unwrap();

        second.record(true);
        third.record(true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_trial_keeps_breaker_usable() {
        let mut cfg = config(2, 2, 50.0);
        cfg.permitted_number_of_calls_in_half_open_state = 1;
        let cb = tripped(cfg);
        tokio::time::advance(Duration::from_secs(1)).await;

        for _ in 0..3 {
            drop(cb.acquire().unwrap());
        }
        cb.acquire().unwrap().record(true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_permit_ignored_after_transition() {
        let cb = tripped(config(2, 2, 50.0));
        tokio::time::advance(Duration::from_secs(1)).await;

        let stale = cb.acquire().unwrap();
        cb.acquire().unwrap().record(false);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        let a = cb.acquire().unwrap();
        let b = cb.acquire().unwrap();
        // Belongs to the previous half-open round; must not free a slot now.
        drop(stale);
        assert!(cb.acquire().is_err());

        a.record(true);
        b.release();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.acquire().unwrap().record(true);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_released_permit_leaves_window_untouched() {
        let cb = Arc::new(CircuitBreaker::new("b", config(4, 1, 50.0)));
        cb.acquire().unwrap().release();
        assert_eq!(cb.metrics().buffered_calls, 0);
        cb.acquire().unwrap().record(true);
        assert_eq!(cb.metrics().buffered_calls, 1);
    }

    #[test]
    fn test_explicit_transition_and_reset() {
        let cb = CircuitBreaker::new("b", config(2, 2, 50.0));
        call(&cb, false);
        call(&cb, false);
        cb.transition_to_half_open();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().buffered_calls, 0);
    }

    #[test]
    fn test_registry_returns_shared_breaker() {
        let registry = CircuitBreakerRegistry::new(config(2, 2, 50.0));
        let a = registry.breaker("broker-memory");
        let b = registry.breaker("broker-memory");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("broker-kafka").is_none());

        call(&a, false);
        call(&a, false);
        assert_eq!(b.state(), CircuitState::Open);

        let metrics = registry.all_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].state, CircuitState::Open);
    }
}
