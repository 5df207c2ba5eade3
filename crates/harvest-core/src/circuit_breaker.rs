//! Circuit breaker around per-job execution.
//!
//! Trips on the failure ratio over a rolling window of the most recent calls,
//! so a burst of infrastructure failures fails fast for the jobs behind it.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[failures/total > threshold]--> OPEN --[reset timeout]--> HALF_OPEN (one trial)
//!                                           ^                             |
//!                                           +--------[trial fails]--------+
//!                                                                         |
//! CLOSED <-----------------------[trial succeeds]-------------------------+
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::error::{ErrorKind, ScrapeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0.0..=1.0) that must be exceeded to open.
    pub failure_threshold: f64,

    /// Number of most recent calls the ratio is computed over.
    pub window_size: usize,

    /// The ratio is not evaluated until the window holds this many calls.
    pub minimum_calls: usize,

    /// Time to wait in Open before admitting a trial call.
    pub reset_timeout: Duration,

    /// When the circuit opens on a rate-limit failure, multiply the current
    /// reset timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Cap for the extended reset timeout.
    pub max_reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            window_size: 20,
            minimum_calls: 5,
            reset_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_reset_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    /// `true` marks a failed call.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_error_message: Option<String>,
    current_reset_timeout: Duration,
    total_calls: u64,
    total_failures: u64,
    short_circuited: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.window_size),
            opened_at: None,
            trial_in_flight: false,
            last_error_message: None,
            current_reset_timeout: config.reset_timeout,
            total_calls: 0,
            total_failures: 0,
            short_circuited: 0,
        }
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_failures() as f64 / self.window.len() as f64
        }
    }

    fn time_until_half_open(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|t| (t + self.current_reset_timeout).saturating_duration_since(now))
            .unwrap_or(self.current_reset_timeout)
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub window_calls: usize,
    pub window_failures: usize,
    pub failure_ratio: f64,
    pub total_calls: u64,
    pub total_failures: u64,
    pub short_circuited: u64,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// Rejected without calling the operation.
    #[error("Circuit breaker '{name}' is open. Retry after {} ms.", .retry_after.as_millis())]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(ScrapeError),
}

impl CircuitBreakerError {
    /// Collapse into the scrape taxonomy. A short-circuit is a retryable
    /// SERVICE_ERROR.
    pub fn into_scrape_error(self) -> ScrapeError {
        match self {
            CircuitBreakerError::Inner(e) => e,
            open @ CircuitBreakerError::Open { .. } => {
                ScrapeError::new(ErrorKind::ServiceError, open.to_string())
            }
        }
    }
}

/// Thread-safe rolling-window circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// it records an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock_inner().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner, Instant::now());
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner, now);

        let time_until_half_open =
            (inner.state == CircuitState::Open).then(|| inner.time_until_half_open(now));

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            window_calls: inner.window.len(),
            window_failures: inner.window_failures(),
            failure_ratio: inner.failure_ratio(),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            short_circuited: inner.short_circuited,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Executes `operation` through the breaker.
    ///
    /// - Closed: runs the operation and records the outcome
    /// - Open: returns `CircuitBreakerError::Open` without running it
    /// - HalfOpen: the first caller runs as the trial; others are rejected
    ///   until the trial records an outcome
    ///
    /// Errors whose kind does not trip the circuit count as successful calls:
    /// the system answered, the job was at fault.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
    {
        let mut guard = TrialGuard {
            breaker: self,
            armed: false,
        };

        {
            let now = Instant::now();
            let mut inner = self.lock_inner();
            self.maybe_transition_to_half_open(&mut inner, now);

            match inner.state {
                CircuitState::Open => {
                    inner.short_circuited += 1;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: inner.time_until_half_open(now),
                    });
                }
                CircuitState::HalfOpen if inner.trial_in_flight => {
                    inner.short_circuited += 1;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    guard.armed = true;
                }
                CircuitState::Closed => {}
            }
        }

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => self.record_success(),
        }
        guard.armed = false;

        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        inner.total_calls += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful trial");
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.last_error_message = None;
                inner.current_reset_timeout = self.config.reset_timeout;
            }
            CircuitState::Closed => self.push_outcome(&mut inner, false),
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &ScrapeError) {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_error_message = Some(error.to_string());
        let is_rate_limit = error.kind == ErrorKind::RateLimited;

        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                let min_calls = self.config.minimum_calls.max(1);
                let ratio = inner.failure_ratio();
                if inner.window.len() >= min_calls && ratio > self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.window_failures(),
                        calls = inner.window.len(),
                        error = %error,
                        "Circuit breaker opening at failure ratio {:.2}",
                        ratio
                    );
                    self.open(&mut inner, now, is_rate_limit);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker trial failed, returning to open state"
                );
                inner.trial_in_flight = false;
                self.open(&mut inner, now, is_rate_limit);
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.window.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.last_error_message = None;
        inner.current_reset_timeout = self.config.reset_timeout;
    }

    fn push_outcome(&self, inner: &mut CircuitBreakerInner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.config.window_size.max(1) {
            inner.window.pop_front();
        }
    }

    fn open(&self, inner: &mut CircuitBreakerInner, now: Instant, is_rate_limit: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);

        if is_rate_limit {
            inner.current_reset_timeout = std::cmp::min(
                Duration::from_secs_f32(
                    inner.current_reset_timeout.as_secs_f32()
                        * self.config.rate_limit_backoff_multiplier,
                ),
                self.config.max_reset_timeout,
            );
            tracing::info!(
                circuit = %self.name,
                reset_timeout_secs = inner.current_reset_timeout.as_secs(),
                "Extended reset timeout due to rate limit"
            );
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner, now: Instant) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && now.saturating_duration_since(opened_at) >= inner.current_reset_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::{Notify, oneshot};

    use super::*;

    fn network() -> ScrapeError {
        ScrapeError::new(ErrorKind::NetworkError, "connection reset")
    }

    fn small_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 0.5,
            window_size: 4,
            minimum_calls: 4,
            reset_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn open_breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        let min = config.minimum_calls;
        let cb = CircuitBreaker::new("test", config);
        for _ in 0..min {
            cb.record_failure(&network());
        }
        assert_eq!(cb.state(), CircuitState::Open);
        cb
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_ratio_at_threshold_stays_closed() {
        let cb = CircuitBreaker::new("test", small_config());
        cb.record_failure(&network());
        cb.record_failure(&network());
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_ratio, 0.5);
    }

    #[test]
    fn test_below_minimum_calls_stays_closed() {
        let cb = CircuitBreaker::new("test", small_config());
        for _ in 0..3 {
            cb.record_failure(&network());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(&network());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_old_outcomes_roll_out_of_window() {
        let cb = CircuitBreaker::new("test", small_config());
        cb.record_failure(&network());
        cb.record_failure(&network());
        for _ in 0..4 {
            cb.record_success();
        }
        cb.record_failure(&network());
        cb.record_failure(&network());
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure(&network());
        assert_eq!(cb.state(), CircuitState::Open);
        let stats = cb.stats();
        assert_eq!(stats.window_calls, 4);
        assert_eq!(stats.window_failures, 3);
        assert_eq!(stats.total_failures, 5);
    }

    #[tokio::test]
    async fn test_job_level_errors_do_not_trip() {
        let cb = CircuitBreaker::new("test", small_config());
        for _ in 0..10 {
            let _ = cb
                .call(|| async { Err::<(), _>(ScrapeError::parse("no match")) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_makes_no_underlying_call() {
        let cb = open_breaker(small_config());
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        for _ in 0..5 {
            let result = cb
                .call(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ScrapeError>(())
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().short_circuited, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let cb = open_breaker(small_config());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes_and_clears_window() {
        let cb = open_breaker(small_config());
        tokio::time::advance(Duration::from_secs(10)).await;

        let result = cb.call(|| async { Ok::<_, ScrapeError>(1) }).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let cb = open_breaker(small_config());
        tokio::time::advance(Duration::from_secs(10)).await;

        let _ = cb.call(|| async { Err::<(), _>(network()) }).await;
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.time_until_half_open, Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = open_breaker(small_config());
        tokio::time::advance(Duration::from_secs(10)).await;

        let entered = Arc::new(Notify::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let trial = {
            let cb = cb.clone();
            let entered = Arc::clone(&entered);
            tokio::spawn(async move {
                cb.call(move || async move {
                    entered.notify_one();
                    let _ = release_rx.await;
                    Ok::<_, ScrapeError>("trial")
                })
                .await
            })
        };
        entered.notified().await;

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let second = cb
            .call(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ScrapeError>("second")
            })
            .await;
        assert!(matches!(second, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_slot() {
        let cb = open_breaker(small_config());
        tokio::time::advance(Duration::from_secs(10)).await;

        let entered = Arc::new(Notify::new());
        let trial = {
            let cb = cb.clone();
            let entered = Arc::clone(&entered);
            tokio::spawn(async move {
                cb.call(move || async move {
                    entered.notify_one();
                    std::future::pending::<Result<(), ScrapeError>>().await
                })
                .await
            })
        };
        entered.notified().await;
        trial.abort();
        let _ = trial.await;

        let result = cb.call(|| async { Ok::<_, ScrapeError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_extends_reset_timeout() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                minimum_calls: 1,
                reset_timeout: Duration::from_secs(30),
                ..Default::default()
            },
        );
        cb.record_failure(&ScrapeError::new(ErrorKind::RateLimited, "429"));

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.time_until_half_open, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_backoff_capped_at_max() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                minimum_calls: 1,
                reset_timeout: Duration::from_secs(200),
                max_reset_timeout: Duration::from_secs(300),
                ..Default::default()
            },
        );
        cb.record_failure(&ScrapeError::new(ErrorKind::RateLimited, "429"));
        assert_eq!(cb.stats().time_until_half_open, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_manual_reset() {
        let cb = open_breaker(small_config());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().window_calls, 0);
    }

    #[test]
    fn test_open_error_maps_to_service_error() {
        let err = CircuitBreakerError::Open {
            name: "orchestrator".into(),
            retry_after: Duration::from_secs(3),
        }
        .into_scrape_error();
        assert_eq!(err.kind, ErrorKind::ServiceError);
        assert!(err.is_retryable());
    }
}
