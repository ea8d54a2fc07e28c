//! Per-operation circuit breaker (§4.B–D). Three-state machine grounded in
//! the breaker pattern from the reference message-bus implementation, with
//! a bounded transition history added for the health-indicator surface.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

const MAX_TRANSITION_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
#[error("circuit breaker '{operation}' is open")]
pub struct CircuitOpenError {
    pub operation: String,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerStats {
    pub state: Option<CircuitState>,
    pub failure_count: u32,
    pub success_count: u32,
    pub trips: u64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_state_change: DateTime<Utc>,
    trips: u64,
    history: VecDeque<StateTransition>,
}

/// Tracks health of a single named downstream operation and decides whether
/// calls should be attempted, short-circuited, or treated as trial probes.
pub struct CircuitBreaker {
    operation: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_state_change: Utc::now(),
                trips: 0,
                history: VecDeque::new(),
            }),
        }
    }

    /// Runs `call`, gated by the breaker's current state. Callers get
    /// `Err(CircuitOpenError)` without the call ever executing when open.
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.should_attempt() {
            return Err(CircuitCallError::Open(CircuitOpenError {
                operation: self.operation.clone(),
            }));
        }
        match tokio::time::timeout(self.config.call_timeout, call()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(CircuitCallError::Inner(e))
            }
            Err(_) => {
                self.record_failure();
                Err(CircuitCallError::Timeout)
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_state_change = Utc::now();
        if inner.history.len() >= MAX_TRANSITION_HISTORY {
            inner.history.pop_front();
        }
        inner.history.push_back(StateTransition {
            from,
            to,
            at: inner.last_state_change,
        });
    }

    fn should_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = Utc::now().signed_duration_since(inner.last_state_change);
                if elapsed.num_milliseconds() as u64 >= self.config.recovery_timeout.as_millis() as u64
                {
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    info!(operation = %self.operation, "circuit entering half-open state");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        if inner.state == CircuitState::HalfOpen && inner.success_count >= self.config.success_threshold {
            inner.failure_count = 0;
            inner.success_count = 0;
            self.transition(&mut inner, CircuitState::Closed);
            info!(operation = %self.operation, "circuit closed after recovery");
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.trips += 1;
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(
                        operation = %self.operation,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.trips += 1;
                self.transition(&mut inner, CircuitState::Open);
                warn!(operation = %self.operation, "circuit reopened after probe failure");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: Some(inner.state),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            trips: inner.trips,
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitCallError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error("call timed out")]
    Timeout,
    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(20),
            success_threshold: 1,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("op", fast_config());
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        let result = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitCallError::Open(_))));
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new("op", fast_config());
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
