//! Circuit breaker core: a closed/open/half-open state machine protecting a
//! single named collaborator (a bus backend, an exchange adapter, ...).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::behavior::CircuitBreakerBehavior;
use super::config::CircuitBreakerConfig;
use super::metrics::CircuitBreakerMetrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast without attempting the underlying operation.
    Open,
    /// A single probe is allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// A named circuit breaker guarding one external collaborator.
///
/// Tripping is driven purely by consecutive failures/successes; this does
/// not attempt sliding-window rate accounting (see `RestartBackoff` in the
/// process supervisor for that shape, which is a different concern).
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_duration_nanos: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    fn set_state(&self, new_state: CircuitState) {
        let old = CircuitState::from_u8(self.state.swap(new_state.as_u8(), Ordering::SeqCst));
        if old != new_state {
            tracing::info!(
                circuit_breaker = %self.name,
                from = ?old,
                to = ?new_state,
                "circuit breaker state transition"
            );
        }
        if new_state == CircuitState::Open {
            *self.opened_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);

        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;

            if self.state() == CircuitState::HalfOpen && successes >= self.config.success_threshold
            {
                self.set_state(CircuitState::Closed);
                self.consecutive_successes.store(0, Ordering::Relaxed);
            }
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

            match self.state() {
                CircuitState::HalfOpen => self.set_state(CircuitState::Open),
                CircuitState::Closed if failures >= self.config.failure_threshold => {
                    self.set_state(CircuitState::Open)
                }
                _ => {}
            }
        }
    }
}

impl CircuitBreakerBehavior for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn should_allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.timeout {
                    self.set_state(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self, duration: Duration) {
        self.record(true, duration);
    }

    fn record_failure(&self, duration: Duration) {
        self.record(false, duration);
    }

    fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    fn force_open(&self) {
        self.set_state(CircuitState::Open);
    }

    fn force_closed(&self) {
        self.set_state(CircuitState::Closed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.store(0, Ordering::Relaxed);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let total_duration = Duration::from_nanos(self.total_duration_nanos.load(Ordering::Relaxed));

        let (failure_rate, success_rate) = if total_calls > 0 {
            (
                failure_count as f64 / total_calls as f64,
                success_count as f64 / total_calls as f64,
            )
        } else {
            (0.0, 0.0)
        };

        let average_duration = if total_calls > 0 {
            total_duration / total_calls as u32
        } else {
            Duration::ZERO
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed) as u64,
            half_open_calls: 0,
            total_duration,
            current_state: self.state(),
            failure_rate,
            success_rate,
            average_duration,
        }
    }
}

impl CircuitBreaker {
    /// Convenience wrapper used outside the `with_breaker` closure pattern
    /// (e.g. manual instrumentation in callers that already have a duration).
    pub fn record_success_manual(&self, duration: Duration) {
        self.record_success(duration);
    }

    pub fn record_failure_manual(&self, duration: Duration) {
        self.record_failure(duration);
    }
}
