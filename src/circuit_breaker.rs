//! Count-based circuit breaker.
//!
//! The breaker keeps a sliding window of the last `failure_capacity` recorded outcomes while
//! closed and opens once `failure_threshold` of them are failures. After `open_delay` the next
//! caller moves it to half-open, where up to `success_capacity` probes run concurrently.
//! `success_threshold` successful probes close it again; as soon as that many successes can
//! no longer be reached within `success_capacity` probes it reopens.
//!
//! Callers take a [`BreakerPermit`] before each attempt and record the outcome on it. A
//! permit dropped without a recorded outcome (a cancelled attempt) frees its half-open slot
//! and counts toward neither side.
//!
//! ```rust
//! use reelguard::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
//!
//! let breaker = CircuitBreakerPolicy::new(CircuitBreakerConfig::default()).unwrap();
//! for _ in 0..4 {
//!     breaker.try_acquire().unwrap().record_failure();
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(breaker.try_acquire().is_err());
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open delay elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("{which} threshold must be within 1..={capacity} (got {threshold})")]
    InvalidRatio { which: &'static str, threshold: usize, capacity: usize },
    #[error("open_delay must be > 0")]
    InvalidOpenDelay,
}

/// Rejection by an open breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker open (next probe in {remaining:?})")]
pub struct CircuitOpen {
    pub remaining: Duration,
}

impl<E> From<CircuitOpen> for ResilienceError<E> {
    fn from(open: CircuitOpen) -> Self {
        ResilienceError::CircuitOpen { remaining: open.remaining }
    }
}

/// Breaker thresholds. Defaults: open on 4 failures out of the last 10 executions, close on
/// 6 successes out of 10 probes, wait 5s before probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub failure_capacity: usize,
    pub success_threshold: usize,
    pub success_capacity: usize,
    pub open_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 4,
            failure_capacity: 10,
            success_threshold: 6,
            success_capacity: 10,
            open_delay: Duration::from_secs(5),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_ratio(mut self, threshold: usize, capacity: usize) -> Self {
        self.failure_threshold = threshold;
        self.failure_capacity = capacity;
        self
    }

    pub fn with_success_ratio(mut self, threshold: usize, capacity: usize) -> Self {
        self.success_threshold = threshold;
        self.success_capacity = capacity;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        check_ratio("failure", self.failure_threshold, self.failure_capacity)?;
        check_ratio("success", self.success_threshold, self.success_capacity)?;
        if self.open_delay.is_zero() {
            return Err(CircuitBreakerError::InvalidOpenDelay);
        }
        Ok(())
    }
}

fn check_ratio(which: &'static str, threshold: usize, capacity: usize) -> Result<(), CircuitBreakerError> {
    if threshold == 0 || threshold > capacity {
        return Err(CircuitBreakerError::InvalidRatio { which, threshold, capacity });
    }
    Ok(())
}

/// Last `capacity` outcomes, oldest first.
#[derive(Debug)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    failures: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity), capacity, failures: 0 }
    }

    fn push(&mut self, failed: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn successes(&self) -> usize {
        self.outcomes.len() - self.failures
    }
}

#[derive(Debug)]
enum Phase {
    Closed { window: OutcomeWindow },
    Open { opened_at: u64 },
    HalfOpen { window: OutcomeWindow, in_flight: usize },
}

#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    /// Bumped on every transition so late permits cannot touch a newer phase.
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    name: Arc<str>,
}

/// Circuit breaker guarding calls to one dependency.
///
/// Clones share the same underlying state via `Arc`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    shared: Arc<Shared>,
}

impl CircuitBreakerPolicy {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        Self::with_clock(config, MonotonicClock::default())
    }

    /// Create a breaker reading time from `clock` (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(
        config: CircuitBreakerConfig,
        clock: C,
    ) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self::from_validated(config, Arc::new(clock)))
    }

    fn from_validated(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BreakerState {
                    phase: Phase::Closed { window: OutcomeWindow::new(config.failure_capacity) },
                    generation: 0,
                }),
                config,
                clock,
                name: Arc::from("default"),
            }),
        }
    }

    /// Name used in log events. Only meaningful before the breaker is cloned.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.name = name.into();
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Current state. An open breaker whose delay has elapsed reports (and becomes) half-open.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        if let Phase::Open { opened_at } = state.phase {
            if self.open_remaining(opened_at).is_zero() {
                self.transition(&mut state, Phase::HalfOpen {
                    window: OutcomeWindow::new(self.shared.config.success_capacity),
                    in_flight: 0,
                });
            }
        }
        match state.phase {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Force the breaker closed with an empty window.
    pub fn reset(&self) {
        let mut state = self.lock();
        self.transition(&mut state, Phase::Closed {
            window: OutcomeWindow::new(self.shared.config.failure_capacity),
        });
    }

    /// Ask permission to run one attempt.
    pub fn try_acquire(&self) -> Result<BreakerPermit, CircuitOpen> {
        let config = &self.shared.config;
        let mut state = self.lock();

        if let Phase::Open { opened_at } = state.phase {
            let remaining = self.open_remaining(opened_at);
            if !remaining.is_zero() {
                return Err(CircuitOpen { remaining });
            }
            self.transition(&mut state, Phase::HalfOpen {
                window: OutcomeWindow::new(config.success_capacity),
                in_flight: 0,
            });
        }

        let generation = state.generation;
        let half_open = match &mut state.phase {
            Phase::Closed { .. } => false,
            Phase::HalfOpen { in_flight, .. } => {
                if *in_flight >= config.success_capacity {
                    return Err(CircuitOpen { remaining: Duration::ZERO });
                }
                *in_flight += 1;
                tracing::debug!(
                    target: "reelguard::circuit_breaker",
                    breaker = %self.shared.name,
                    in_flight = *in_flight,
                    "half-open probe admitted"
                );
                true
            }
            Phase::Open { .. } => return Err(CircuitOpen { remaining: Duration::ZERO }),
        };

        Ok(BreakerPermit { breaker: self.clone(), generation, half_open, settled: false })
    }

    fn record(&self, generation: u64, half_open: bool, failed: Option<bool>) {
        let config = &self.shared.config;
        let mut state = self.lock();
        if state.generation != generation {
            // outcome belongs to a phase that already ended
            return;
        }

        let next = match &mut state.phase {
            Phase::Closed { window } => match failed {
                Some(failed) => {
                    window.push(failed);
                    (window.failures >= config.failure_threshold).then(|| {
                        tracing::error!(
                            target: "reelguard::circuit_breaker",
                            breaker = %self.shared.name,
                            failures = window.failures,
                            window = window.outcomes.len(),
                            "Circuit breaker → open"
                        );
                        Phase::Open { opened_at: self.shared.clock.now_millis() }
                    })
                }
                None => None,
            },
            Phase::HalfOpen { window, in_flight } => {
                if half_open {
                    *in_flight = in_flight.saturating_sub(1);
                }
                match failed {
                    Some(failed) => {
                        window.push(failed);
                        let max_failures = config.success_capacity - config.success_threshold;
                        if window.successes() >= config.success_threshold {
                            tracing::info!(
                                target: "reelguard::circuit_breaker",
                                breaker = %self.shared.name,
                                "Circuit breaker → closed"
                            );
                            Some(Phase::Closed { window: OutcomeWindow::new(config.failure_capacity) })
                        } else if window.failures > max_failures {
                            tracing::warn!(
                                target: "reelguard::circuit_breaker",
                                breaker = %self.shared.name,
                                failures = window.failures,
                                "Circuit breaker: probes failed → open"
                            );
                            Some(Phase::Open { opened_at: self.shared.clock.now_millis() })
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            }
            Phase::Open { .. } => None,
        };

        if let Some(phase) = next {
            self.transition(&mut state, phase);
        }
    }

    fn transition(&self, state: &mut BreakerState, phase: Phase) {
        if let Phase::HalfOpen { .. } = phase {
            tracing::info!(
                target: "reelguard::circuit_breaker",
                breaker = %self.shared.name,
                "Circuit breaker → half-open"
            );
        }
        state.phase = phase;
        state.generation = state.generation.wrapping_add(1);
    }

    fn open_remaining(&self, opened_at: u64) -> Duration {
        let elapsed = self.shared.clock.now_millis().saturating_sub(opened_at);
        let delay = u64::try_from(self.shared.config.open_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(delay.saturating_sub(elapsed))
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::from_validated(CircuitBreakerConfig::default(), Arc::new(MonotonicClock::default()))
    }
}

/// Permission to run one attempt. Record exactly one outcome on it, or drop it to abandon
/// the attempt.
#[derive(Debug)]
#[must_use = "a permit records nothing unless an outcome is reported"]
pub struct BreakerPermit {
    breaker: CircuitBreakerPolicy,
    generation: u64,
    half_open: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn record_success(self) {
        self.record(false);
    }

    pub fn record_failure(self) {
        self.record(true);
    }

    /// Record a failed attempt as a failure, or as a success when `failed` is false.
    pub fn record(mut self, failed: bool) {
        self.settled = true;
        self.breaker.record(self.generation, self.half_open, Some(failed));
    }

    pub fn is_probe(&self) -> bool {
        self.half_open
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(self.generation, self.half_open, None);
        }
    }
}
