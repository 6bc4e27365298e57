//! Failure-rate gate shared by every execution of one coordinator.
//!
//! * **closed**: calls pass, consecutive failures are counted. Counts are
//!   cleared every `rolling_interval` (zero disables clearing).
//! * **open**: calls are rejected with [`JobcuterError::CircuitOpen`] until
//!   `cool_down` has elapsed.
//! * **half-open**: at most `max_requests_half_open` trial calls pass. A trial
//!   success closes the breaker, a trial failure reopens it.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::JobcuterError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub max_requests_half_open: u32,
    pub rolling_interval: Duration,
    pub cool_down: Duration,
    pub consecutive_failure_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            max_requests_half_open: 1,
            rolling_interval: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
            consecutive_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
}

/// Admission ticket for one call. Hand it back through
/// [`CircuitBreaker::record`] once the call has an outcome.
#[derive(Debug)]
#[must_use = "a permit must be recorded with the call outcome"]
pub struct Permit {
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let breaker = Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };
        {
            let mut inner = breaker.lock();
            let now = Instant::now();
            breaker.new_generation(&mut inner, now);
        }
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// Asks to let one call through.
    pub fn allow(&self) -> Result<Permit, JobcuterError> {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        match inner.state {
            BreakerState::Open => return Err(JobcuterError::CircuitOpen),
            BreakerState::HalfOpen
                if inner.counts.requests >= self.settings.max_requests_half_open =>
            {
                return Err(JobcuterError::CircuitOpen);
            }
            _ => {}
        }

        inner.counts.requests += 1;
        Ok(Permit {
            generation: inner.generation,
        })
    }

    /// Records the outcome of a call admitted by [`allow`](Self::allow).
    /// Outcomes from a previous generation are ignored.
    pub fn record(&self, permit: Permit, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);
        if permit.generation != inner.generation {
            return;
        }

        if success {
            inner.counts.successes += 1;
            inner.counts.consecutive_failures = 0;
            if inner.state == BreakerState::HalfOpen {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.counts.failures += 1;
            inner.counts.consecutive_failures += 1;
            match inner.state {
                BreakerState::Closed
                    if inner.counts.consecutive_failures
                        > self.settings.consecutive_failure_threshold =>
                {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                BreakerState::HalfOpen => {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
                _ => {}
            }
        }
    }

    /// Hands back a permit whose call was abandoned without an outcome, so it
    /// does not keep occupying a half-open trial slot.
    pub fn forget(&self, permit: Permit) {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        if permit.generation == inner.generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    /// Runs `operation` through the breaker. The operation is not invoked at
    /// all while the breaker rejects calls.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, JobcuterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, JobcuterError>>,
    {
        let permit = self.allow()?;
        let result = operation().await;
        self.record(permit, result.is_ok());
        result
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        if inner.state == state {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        self.new_generation(inner, now);

        match state {
            BreakerState::Open => tracing::warn!(
                breaker = %self.name,
                from = %previous,
                cool_down = ?self.settings.cool_down,
                "Circuit breaker opened"
            ),
            _ => tracing::info!(
                breaker = %self.name,
                from = %previous,
                to = %state,
                "Circuit breaker state changed"
            ),
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed if self.settings.rolling_interval.is_zero() => None,
            BreakerState::Closed => Some(now + self.settings.rolling_interval),
            BreakerState::Open => Some(now + self.settings.cool_down),
            BreakerState::HalfOpen => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings() -> BreakerSettings {
        BreakerSettings {
            max_requests_half_open: 1,
            rolling_interval: Duration::ZERO,
            cool_down: Duration::from_secs(30),
            consecutive_failure_threshold: 3,
        }
    }

    fn fail(breaker: &CircuitBreaker) {
        let permit = breaker.allow().unwrap();
        breaker.record(permit, false);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_is_exceeded() {
        let breaker = CircuitBreaker::new("test", settings());
        for _ in 0..3 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.allow().unwrap_err(), JobcuterError::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", settings());
        for _ in 0..3 {
            fail(&breaker);
        }
        let permit = breaker.allow().unwrap();
        breaker.record(permit, true);
        for _ in 0..3 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_call_does_not_invoke_operation() {
        let breaker = CircuitBreaker::new("test", settings());
        for _ in 0..4 {
            fail(&breaker);
        }
        let invoked = AtomicU32::new(0);
        let result: Result<(), _> = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(JobcuterError::CircuitOpen));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_bounded_trials_then_closes_on_success() {
        let breaker = CircuitBreaker::new("test", settings());
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let trial = breaker.allow().unwrap();
        assert_eq!(breaker.allow().unwrap_err(), JobcuterError::CircuitOpen);
        breaker.record(trial, true);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", settings());
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_trial_frees_its_slot() {
        let breaker = CircuitBreaker::new("test", settings());
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breaker.allow().unwrap();
        breaker.forget(trial);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_permit_is_ignored() {
        let breaker = CircuitBreaker::new("test", settings());
        let stale = breaker.allow().unwrap();
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.record(stale, true);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_interval_clears_counts_while_closed() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerSettings {
                rolling_interval: Duration::from_secs(60),
                ..settings()
            },
        );
        for _ in 0..3 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        fail(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.counts().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_trial_count_is_honoured() {
        let breaker = CircuitBreaker::new(
            "test",
            BreakerSettings {
                max_requests_half_open: 3,
                ..settings()
            },
        );
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trials: Vec<_> = (0..3).map(|_| breaker.allow().unwrap()).collect();
        assert!(breaker.allow().is_err());
        for trial in trials {
            breaker.record(trial, true);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
