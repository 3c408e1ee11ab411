//! Circuit breaker gating connection attempts
//!
//! The breaker counts consecutive failures of the operations it wraps. Once the
//! count reaches the threshold it opens and rejects further attempts without
//! running them, until the recovery timeout has elapsed. The next attempt after
//! that runs as a probe in the half-open state.
//!
//! ```text
//! Closed ──[failure_threshold failures]──> Open
//!   ▲                                        │
//!   │                                        │ [recovery_timeout elapsed + next execute]
//!   │                                        ▼
//!   └──────[3 consecutive successes]──── HalfOpen
//!                 [any failure] ───────────> Open
//! ```
//!
//! All state lives behind a short synchronous lock that is never held across an
//! `.await`, so the connection manager can poll an attempt while status queries
//! read a snapshot.

use crate::config::CircuitBreakerSection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Consecutive half-open successes required to close the breaker
pub const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, attempts flow through
    Closed,
    /// Tripped, attempts are rejected without running
    Open,
    /// Probing recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker is open; the operation was not run
    #[error("Circuit breaker is open, retry in {retry_after:?}")]
    Open { retry_after: Duration },
    /// The operation ran and failed
    #[error(transparent)]
    Operation(E),
}

/// Serializable view of the breaker for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub monitoring_period_ms: u64,
}

type StateChangeCallback = Arc<dyn Fn(CircuitState, u32) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Circuit breaker protecting an unhealthy endpoint from repeated attempts
pub struct CircuitBreaker {
    config: CircuitBreakerSection,
    inner: Mutex<BreakerState>,
    on_state_change: Mutex<Option<StateChangeCallback>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerSection) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_at: None,
            }),
            on_state_change: Mutex::new(None),
        }
    }

    /// Register the state change callback, replacing any previous one
    ///
    /// The callback receives the new state and the failure count at the time of the
    /// transition. A panicking callback is logged and otherwise ignored.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(CircuitState, u32) + Send + Sync + 'static,
    {
        let mut slot = self
            .on_state_change
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(callback));
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_ms: self.config.recovery_timeout_ms,
            monitoring_period_ms: self.config.monitoring_period_ms,
        }
    }

    /// Run an operation through the breaker
    ///
    /// While open and inside the recovery timeout the operation is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_after) = self.admit() {
            return Err(CircuitBreakerError::Open { retry_after });
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    /// Record a successful operation
    pub fn on_success(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failure_count = 0;

            if inner.state == CircuitState::HalfOpen {
                inner.success_count += 1;
                debug!(
                    success_count = inner.success_count,
                    "Circuit breaker probe succeeded"
                );
                if inner.success_count >= HALF_OPEN_SUCCESS_THRESHOLD {
                    inner.state = CircuitState::Closed;
                    inner.success_count = 0;
                    info!("Circuit breaker closed, normal operation resumed");
                    Some((CircuitState::Closed, inner.failure_count))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some((state, failures)) = transition {
            self.notify(state, failures);
        }
    }

    /// Record a failed operation
    pub fn on_failure(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failure_count += 1;
            inner.last_failure = Some(Instant::now());
            inner.last_failure_at = Some(Utc::now());

            let should_open = inner.state == CircuitState::HalfOpen
                || inner.failure_count >= self.config.failure_threshold;

            if should_open && inner.state != CircuitState::Open {
                let from = inner.state;
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!(
                    from = %from,
                    failure_count = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker opened"
                );
                Some((CircuitState::Open, inner.failure_count))
            } else {
                None
            }
        };

        if let Some((state, failures)) = transition {
            self.notify(state, failures);
        }
    }

    /// Decide whether an attempt may run, moving Open to HalfOpen once the recovery
    /// timeout has elapsed. Returns the remaining wait when rejected.
    fn admit(&self) -> Result<(), Duration> {
        let transition = {
            let mut inner = self.lock();
            if inner.state != CircuitState::Open {
                return Ok(());
            }

            let recovery_timeout = self.config.recovery_timeout();
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(recovery_timeout);

            if elapsed < recovery_timeout {
                return Err(recovery_timeout - elapsed);
            }

            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!("Circuit breaker half-open, probing recovery");
            (CircuitState::HalfOpen, inner.failure_count)
        };

        self.notify(transition.0, transition.1);
        Ok(())
    }

    fn notify(&self, state: CircuitState, failure_count: u32) {
        let callback = self
            .on_state_change
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        if let Some(callback) = callback {
            let result = catch_unwind(AssertUnwindSafe(|| callback(state, failure_count)));
            if result.is_err() {
                error!(
                    state = %state,
                    "Circuit breaker state change callback panicked"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerSection {
            failure_threshold: threshold,
            recovery_timeout_ms: recovery_ms,
            monitoring_period_ms: 10_000,
        })
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = breaker(3, 1000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.last_failure_at, None);
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let breaker = breaker(3, 1000);

        for _ in 0..2 {
            assert!(matches!(
                fail(&breaker).await,
                Err(CircuitBreakerError::Operation("boom"))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.snapshot().last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 1000);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.failure_count(), 2);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_running_operation() {
        let breaker = breaker(1, 1000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invocations = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = breaker(1, 1000);
        let _ = fail(&breaker).await;

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(CircuitBreakerError::Open { .. })
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_successes_close_breaker() {
        let breaker = breaker(1, 100);
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(100)).await;

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(3, 100);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(100)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_callback_receives_transitions() {
        let breaker = breaker(2, 100);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        breaker.on_state_change(move |state, failures| {
            sink.lock().unwrap().push((state, failures));
        });

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..3 {
            succeed(&breaker).await.unwrap();
        }

        let transitions = transitions.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Open, 2),
                (CircuitState::HalfOpen, 2),
                (CircuitState::Closed, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_break_transition() {
        let breaker = breaker(1, 100);
        breaker.on_state_change(|_, _| panic!("subscriber exploded"));

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&breaker).await,
            Err(CircuitBreakerError::Open { .. })
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
    }
}
