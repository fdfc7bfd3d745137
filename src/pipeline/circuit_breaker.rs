//! Circuit Breaker pattern implementation.
//!
//! Wraps a family of fallible operations (remote API calls, storage writes)
//! and fails fast once the family looks unhealthy.
//!
//! ## States
//!
//! - **Closed**: calls run; consecutive failures are counted and reaching
//!   `failure_threshold` opens the breaker.
//! - **Open**: calls are rejected with [`AppError::CircuitOpen`] until
//!   `recovery_timeout` has elapsed, without running the operation.
//! - **Half-open**: the first call after the timeout is the single probe.
//!   Its success closes the breaker, its failure reopens it. Other calls are
//!   rejected while the probe is in flight.
//!
//! A [`AppError::RateLimited`] response is neither a success nor a failure:
//! the remote side is up and asking callers to slow down, which the retry
//! policy already handles. It leaves the state and failure count untouched.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub next_attempt: Option<Instant>,
}

/// State-transition event published to subscribers.
#[derive(Debug, Clone)]
pub struct Transition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one family of operations.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<Transition>,
}

impl CircuitBreaker {
    /// Create a breaker with the given name (used in errors and logs).
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                next_attempt: None,
                probe_in_flight: false,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            next_attempt: inner.next_attempt,
        }
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }

    /// Run `op` through the breaker.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut admission = self.admit()?;
        let result = op().await;
        admission.settled = true;
        match &result {
            Ok(_) => self.on_success(),
            Err(AppError::RateLimited { .. }) => self.release(),
            Err(e) => self.on_failure(e),
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Result<Admission<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let ready = inner.next_attempt.is_none_or(|at| Instant::now() >= at);
                if !ready {
                    return Err(self.rejected());
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.probe_in_flight = true;
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.rejected());
                }
                inner.probe_in_flight = true;
            }
        }
        Ok(Admission {
            breaker: self,
            settled: false,
        })
    }

    fn rejected(&self) -> AppError {
        AppError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.next_attempt = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn on_failure(&self, error: &AppError) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        inner.probe_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            inner.next_attempt = Some(now + self.config.recovery_timeout());
            log::warn!(
                "Circuit '{}' opening after {} consecutive failures (last: {})",
                self.name,
                inner.consecutive_failures,
                error
            );
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    /// Free the half-open slot without judging the outcome. Used when the
    /// admitted operation was throttled or dropped before completing.
    fn release(&self) {
        let mut inner = self.lock();
        inner.probe_in_flight = false;
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        log::info!("Circuit '{}': {:?} -> {:?}", self.name, from, to);
        let _ = self.events.send(Transition {
            breaker: self.name.clone(),
            from,
            to,
            consecutive_failures: inner.consecutive_failures,
        });
    }
}

/// Releases the half-open probe slot if the operation future is dropped.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: 1_000,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::connection("boom"))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<u32> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(2);
        let calls = AtomicUsize::new(0);

        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let result = succeed(&cb, &calls).await;
        assert!(matches!(result, Err(AppError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "open breaker must not run op");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let cb = breaker(2);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(succeed(&cb, &calls).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let cb = breaker(2);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        let first_next = cb.snapshot().next_attempt.unwrap();

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(matches!(
            fail(&cb, &calls).await,
            Err(AppError::Connection(_))
        ));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.snapshot().next_attempt.unwrap() > first_next);

        // Still inside the new recovery window.
        assert!(matches!(
            succeed(&cb, &calls).await,
            Err(AppError::CircuitOpen { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_probe() {
        let cb = Arc::new(breaker(1));
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = succeed(&cb, &calls).await;
        assert!(matches!(concurrent, Err(AppError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert!(probe.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(2);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = succeed(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_published() {
        let cb = breaker(1);
        let mut events = cb.subscribe();
        let calls = AtomicUsize::new(0);

        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;
        let _ = succeed(&cb, &calls).await;

        let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    async fn throttled(cb: &CircuitBreaker, calls: &AtomicUsize) -> Result<()> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::RateLimited { retry_after: None })
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_responses_do_not_open() {
        let cb = breaker(2);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        for _ in 0..5 {
            assert!(matches!(
                throttled(&cb, &calls).await,
                Err(AppError::RateLimited { .. })
            ));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_half_open_call_frees_slot() {
        let cb = breaker(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert!(throttled(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb, &calls).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cb = breaker(1);
        let calls = AtomicUsize::new(0);
        let _ = fail(&cb, &calls).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        {
            let pending = cb.execute(|| std::future::pending::<Result<()>>());
            let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;
        }
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb, &calls).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
