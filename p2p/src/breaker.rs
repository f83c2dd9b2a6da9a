//! Circuit breaker guarding outbound network operations.
//!
//! CLOSED executes and counts failures; at the failure threshold the
//! breaker OPENs and short-circuits callers until the reset timeout has
//! elapsed, then probes through HALF_OPEN and re-CLOSEs after enough
//! consecutive successes. A single failure in HALF_OPEN reopens it.

use crate::error::P2pError;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{
    future::Future,
    time::{Duration, Instant},
};
use tracing::{info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening.
    pub failure_threshold: u32,
    /// How long OPEN lasts before the next call probes HALF_OPEN.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Lifetime counters, readable for diagnostics.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct CircuitStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub transitions: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    stats: CircuitStats,
}

/// Named breaker around a class of fallible operations.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: SmolStr,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<SmolStr>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure: None,
                stats: CircuitStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        self.inner.lock().stats
    }

    /// Successes required in HALF_OPEN to close again.
    fn required_half_open_successes(&self) -> u32 {
        self.config.failure_threshold.div_ceil(2).max(1)
    }

    /// Admission check. Counts the request; fails fast with `CircuitOpen`
    /// while OPEN, moving to HALF_OPEN once the reset timeout has elapsed.
    pub fn preflight(&self) -> Result<(), P2pError> {
        let mut inner = self.inner.lock();
        inner.stats.requests += 1;
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true);
            if !elapsed {
                return Err(P2pError::CircuitOpen(self.name.clone()));
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.stats.transitions += 1;
            info!(breaker = %self.name, "circuit half-open, probing");
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.successes += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.required_half_open_successes() {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.stats.transitions += 1;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.stats.failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.stats.transitions += 1;
                    warn!(breaker = %self.name, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.stats.transitions += 1;
                warn!(breaker = %self.name, "circuit reopened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` through the breaker.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T, P2pError>
    where
        Fut: Future<Output = Result<T, P2pError>>,
    {
        self.preflight()?;
        match op.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Administrative force back to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            inner.stats.transitions += 1;
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        info!(breaker = %self.name, "circuit reset");
    }
}
