//! Retry decisions and exponential backoff.
//!
//! The delay for attempt `n` (the job's current `retry_count`) is
//!
//! ```text
//! delay = min(initial * factor^n + jitter, max) * load   (re-capped at max)
//! ```
//!
//! where `jitter` is uniform in `[0, 1000ms)` and `load` is a system-load
//! factor clamped to `[1.0, 2.0]`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::ScrapeError;
use crate::job::{Job, RetryConfig};

/// Upper bound (exclusive) of the random jitter added to each delay.
pub const MAX_JITTER: Duration = Duration::from_millis(1_000);

/// Maximum system-load scaling applied to a delay.
pub const MAX_LOAD_FACTOR: f64 = 2.0;

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job after `delay` with its retry count set to `next_retry_count`.
    Retry {
        delay: Duration,
        next_retry_count: u32,
    },
    /// Finalize the job as failed and route it to the dead-letter destination.
    DeadLetter { reason: String },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_jitter: MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never adds jitter. Delays become fully deterministic.
    pub fn without_jitter() -> Self {
        Self {
            max_jitter: Duration::ZERO,
        }
    }

    /// Backoff delay for a job that has already been retried `retry_count` times.
    pub fn delay(&self, retry_count: u32, config: &RetryConfig, load_factor: f64) -> Duration {
        let jitter = self.jitter();
        Self::compute(retry_count, config, jitter, load_factor)
    }

    /// The exponential component alone, before jitter and load scaling.
    pub fn delay_without_jitter(retry_count: u32, config: &RetryConfig) -> Duration {
        Self::compute(retry_count, config, Duration::ZERO, 1.0)
    }

    fn compute(
        retry_count: u32,
        config: &RetryConfig,
        jitter: Duration,
        load_factor: f64,
    ) -> Duration {
        let max_ms = config.max_delay as f64;
        let factor = if config.backoff_factor.is_finite() && config.backoff_factor >= 1.0 {
            config.backoff_factor
        } else {
            1.0
        };
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let base_ms = config.initial_delay as f64 * factor.powi(exponent);
        let capped_ms = (base_ms + jitter.as_millis() as f64).min(max_ms);
        let load = if load_factor.is_finite() {
            load_factor.clamp(1.0, MAX_LOAD_FACTOR)
        } else {
            1.0
        };
        let scaled_ms = (capped_ms * load).min(max_ms).max(0.0);
        Duration::from_millis(scaled_ms as u64)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..max_ms))
    }

    /// Decide what happens to `job` after it failed with `error`.
    pub fn decide(&self, job: &Job, error: &ScrapeError, load_factor: f64) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::DeadLetter {
                reason: format!("{} is not retryable", error.kind),
            };
        }
        if !job.can_retry() {
            return RetryDecision::DeadLetter {
                reason: format!(
                    "retries exhausted ({} of {})",
                    job.retry_count, job.retry_config.max_retries
                ),
            };
        }

        let delay = self.delay(job.retry_count, &job.retry_config, load_factor);
        debug!(
            job_id = %job.id,
            kind = %error.kind,
            retry_count = job.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );
        RetryDecision::Retry {
            delay,
            next_retry_count: job.retry_count + 1,
        }
    }
}

/// Tracks in-flight jobs against worker capacity to produce a load factor.
///
/// Idle workers give 1.0; a saturated pool gives 2.0.
#[derive(Debug, Clone)]
pub struct LoadGauge {
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
}

impl LoadGauge {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity: capacity.max(1),
        }
    }

    /// Mark one job in flight until the returned guard is dropped.
    pub fn enter(&self) -> LoadGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LoadGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn factor(&self) -> f64 {
        let ratio = self.in_flight() as f64 / self.capacity as f64;
        (1.0 + ratio).clamp(1.0, MAX_LOAD_FACTOR)
    }
}

#[derive(Debug)]
pub struct LoadGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
