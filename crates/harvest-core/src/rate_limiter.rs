//! Per-institution token-bucket rate limiting.
//!
//! Each institution key owns a bucket of capacity `burstLimit` that refills
//! continuously at `requestsPerSecond`. A rate-limit signal from the remote
//! site drains the bucket and starts a cooldown during which every request
//! for that institution is refused, whatever the token count.
//!
//! The limiter never sleeps: [`RateLimiter::try_acquire`] answers
//! immediately with a [`Permit`] and callers decide whether to wait, requeue
//! or give up.
//!
//! # Locking
//!
//! Buckets live in a [`DashMap`] of `Arc<Mutex<_>>`. The map shard is only
//! held long enough to clone the `Arc`; the per-key mutex is the single
//! critical section for that institution, so unrelated institutions never
//! contend with each other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::job::RateLimitConfig;

/// Tolerance for floating-point refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Length of the trailing window in which grants may not exceed the burst.
const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Longest wait a denial reports.
const MAX_WAIT: Duration = Duration::from_secs(24 * 3600);

/// Answer to a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub allowed: bool,
    /// How long until a retry could succeed. Zero when allowed.
    pub wait: Duration,
}

impl Permit {
    fn granted() -> Self {
        Self {
            allowed: true,
            wait: Duration::ZERO,
        }
    }

    fn denied(wait: Duration) -> Self {
        Self {
            allowed: false,
            wait,
        }
    }

    pub fn wait_ms(&self) -> u64 {
        self.wait.as_millis() as u64
    }
}

/// Point-in-time view of one institution's limiter state.
///
/// Attached to errors and dead letters for remediation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSnapshot {
    pub institution_key: String,
    pub tokens_available: f64,
    pub burst_limit: u32,
    pub requests_per_second: f64,
    pub cooldown_remaining_ms: u64,
    pub total_grants: u64,
    pub total_denials: u64,
    pub cooldowns: u64,
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    tokens_available: f64,
    cooldown_until: Option<Instant>,
    last_refill_time: Instant,
    /// Grant instants inside the trailing burst window, oldest first.
    recent_grants: VecDeque<Instant>,
    total_grants: u64,
    total_denials: u64,
    cooldowns: u64,
}

impl RateLimitState {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            config: config.clone(),
            tokens_available: f64::from(config.burst_limit),
            cooldown_until: None,
            last_refill_time: now,
            recent_grants: VecDeque::new(),
            total_grants: 0,
            total_denials: 0,
            cooldowns: 0,
        }
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.burst_limit.max(1))
    }

    /// Grants allowed inside one trailing second: the burst, or the steady
    /// rate when that is higher so the window never throttles below `rps`.
    fn window_cap(&self) -> usize {
        let steady = self.config.requests_per_second.ceil().max(1.0) as usize;
        (self.config.burst_limit.max(1) as usize).max(steady)
    }

    fn apply_config(&mut self, config: &RateLimitConfig) {
        if &self.config != config {
            self.config = config.clone();
            self.tokens_available = self.tokens_available.min(self.capacity());
        }
    }

    fn refill(&mut self, now: Instant) {
        // A finished cooldown refills from empty, starting at the moment it ended.
        if let Some(until) = self.cooldown_until
            && until <= now
        {
            self.cooldown_until = None;
            self.tokens_available = 0.0;
            self.last_refill_time = until;
        }

        let elapsed = now.saturating_duration_since(self.last_refill_time);
        let added = elapsed.as_secs_f64() * self.config.requests_per_second;
        self.tokens_available = (self.tokens_available + added).min(self.capacity());
        self.last_refill_time = now;

        while let Some(&oldest) = self.recent_grants.front() {
            if now.saturating_duration_since(oldest) >= BURST_WINDOW {
                self.recent_grants.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_acquire(&mut self, now: Instant) -> Permit {
        if let Some(until) = self.cooldown_until
            && until > now
        {
            self.total_denials += 1;
            return Permit::denied(until - now);
        }

        self.refill(now);

        let token_wait = if self.tokens_available + TOKEN_EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            let missing = 1.0 - self.tokens_available;
            Duration::try_from_secs_f64(missing / self.config.requests_per_second)
                .unwrap_or(MAX_WAIT)
                .min(MAX_WAIT)
        };

        let window_wait = if self.recent_grants.len() >= self.window_cap() {
            self.recent_grants
                .front()
                .map(|&oldest| (oldest + BURST_WINDOW).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        let wait = token_wait.max(window_wait);
        if wait.is_zero() {
            self.tokens_available = (self.tokens_available - 1.0).max(0.0);
            self.recent_grants.push_back(now);
            self.total_grants += 1;
            Permit::granted()
        } else {
            self.total_denials += 1;
            // Round up so a caller that waits exactly `wait` is not refused again.
            Permit::denied(wait + Duration::from_micros(1))
        }
    }

    fn start_cooldown(&mut self, now: Instant) {
        self.tokens_available = 0.0;
        self.last_refill_time = now;
        // `cooldown()` is clamped to a day, so this cannot overflow.
        self.cooldown_until = Some(now + self.config.cooldown());
        self.cooldowns += 1;
    }

    fn snapshot(&self, key: &str, now: Instant) -> RateLimitSnapshot {
        let cooldown_remaining = self
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        RateLimitSnapshot {
            institution_key: key.to_string(),
            tokens_available: self.tokens_available,
            burst_limit: self.config.burst_limit,
            requests_per_second: self.config.requests_per_second,
            cooldown_remaining_ms: cooldown_remaining.as_millis() as u64,
            total_grants: self.total_grants,
            total_denials: self.total_denials,
            cooldowns: self.cooldowns,
        }
    }
}

/// Token-bucket limiter keyed by institution.
///
/// Designed to be shared behind an `Arc` by every worker of a consumer.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Mutex<RateLimitState>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: Instant,
    ) -> Arc<Mutex<RateLimitState>> {
        if let Some(existing) = self.buckets.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RateLimitState::new(config, now))))
                .value(),
        )
    }

    fn lock(bucket: &Mutex<RateLimitState>) -> std::sync::MutexGuard<'_, RateLimitState> {
        bucket.lock().unwrap_or_else(|poisoned| {
            warn!("Recovered from poisoned rate limiter mutex");
            poisoned.into_inner()
        })
    }

    /// Attempt to take one request grant for `key`.
    pub fn try_acquire(&self, key: &str, config: &RateLimitConfig) -> Permit {
        self.try_acquire_at(key, config, Instant::now())
    }

    pub fn try_acquire_at(&self, key: &str, config: &RateLimitConfig, now: Instant) -> Permit {
        let bucket = self.bucket(key, config, now);
        let mut state = Self::lock(&bucket);
        state.apply_config(config);
        let permit = state.try_acquire(now);
        if permit.allowed {
            debug!(
                institution = %key,
                tokens = state.tokens_available,
                "Rate limit grant"
            );
        } else {
            debug!(
                institution = %key,
                wait_ms = permit.wait_ms(),
                "Rate limit denied"
            );
        }
        permit
    }

    /// Feed back the outcome of a granted request.
    ///
    /// `was_rate_limited = true` drains the bucket and starts the cooldown.
    /// Reports for a key that never acquired are ignored.
    pub fn report_outcome(&self, key: &str, was_rate_limited: bool) {
        self.report_outcome_at(key, was_rate_limited, Instant::now());
    }

    pub fn report_outcome_at(&self, key: &str, was_rate_limited: bool, now: Instant) {
        if !was_rate_limited {
            return;
        }
        let Some(bucket) = self.buckets.get(key).map(|b| Arc::clone(b.value())) else {
            debug!(institution = %key, "Rate-limit report for unknown institution ignored");
            return;
        };
        let mut state = Self::lock(&bucket);
        state.start_cooldown(now);
        warn!(
            institution = %key,
            cooldown_secs = state.config.cooldown_period,
            "Institution signalled rate limiting, entering cooldown"
        );
    }

    /// Current state for `key`, if any request has been seen for it.
    pub fn snapshot(&self, key: &str) -> Option<RateLimitSnapshot> {
        self.snapshot_at(key, Instant::now())
    }

    pub fn snapshot_at(&self, key: &str, now: Instant) -> Option<RateLimitSnapshot> {
        let bucket = self.buckets.get(key).map(|b| Arc::clone(b.value()))?;
        let state = Self::lock(&bucket);
        Some(state.snapshot(key, now))
    }

    /// True while `key` is inside a cooldown.
    pub fn in_cooldown(&self, key: &str) -> bool {
        self.snapshot(key)
            .map(|s| s.cooldown_remaining_ms > 0)
            .unwrap_or(false)
    }

    pub fn tracked_institutions(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rps: f64, burst: u32, cooldown: f64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: rps,
            burst_limit: burst,
            cooldown_period: cooldown,
        }
    }

    #[test]
    fn vanishing_rate_saturates_wait() {
        let limiter = RateLimiter::new();
        let cfg = config(1e-300, 1, 60.0);
        let now = Instant::now();

        assert!(limiter.try_acquire_at("slow.edu", &cfg, now).allowed);
        let denied = limiter.try_acquire_at("slow.edu", &cfg, now);
        assert!(!denied.allowed);
        assert!(denied.wait >= MAX_WAIT);
        assert!(denied.wait <= MAX_WAIT + Duration::from_millis(1));

        let stalled = config(0.0, 1, 60.0);
        let denied = limiter.try_acquire_at("slow.edu", &stalled, now);
        assert!(!denied.allowed);
        assert!(denied.wait >= MAX_WAIT);
    }

    #[test]
    fn huge_cooldown_is_clamped() {
        let limiter = RateLimiter::new();
        let cfg = config(1.0, 1, 1e300);
        let now = Instant::now();

        assert!(limiter.try_acquire_at("busy.gov", &cfg, now).allowed);
        limiter.report_outcome_at("busy.gov", true, now);

        let snap = limiter.snapshot_at("busy.gov", now).unwrap();
        assert_eq!(snap.cooldown_remaining_ms, 86_400_000);
        let denied = limiter.try_acquire_at("busy.gov", &cfg, now);
        assert!(!denied.allowed);
        assert_eq!(denied.wait, Duration::from_secs(86_400));
    }

    #[test]
    fn burst_is_granted_then_denied() {
        let limiter = RateLimiter::new();
        let cfg = config(2.0, 5, 10.0);
        let now = Instant::now();

        let granted = (0..10)
            .filter(|_| limiter.try_acquire_at("mit.edu", &cfg, now).allowed)
            .count();
        assert_eq!(granted, 5);

        let denied = limiter.try_acquire_at("mit.edu", &cfg, now);
        assert!(!denied.allowed);
        assert!(denied.wait >= Duration::from_millis(500));
    }

    #[test]
    fn tokens_never_exceed_burst() {
        let limiter = RateLimiter::new();
        let cfg = config(100.0, 3, 1.0);
        let start = Instant::now();
        limiter.try_acquire_at("a", &cfg, start);

        let later = start + Duration::from_secs(3600);
        limiter.try_acquire_at("a", &cfg, later);
        let snap = limiter.snapshot_at("a", later).unwrap();
        assert!(snap.tokens_available <= 3.0);
    }

    #[test]
    fn refill_is_continuous() {
        let limiter = RateLimiter::new();
        let cfg = config(4.0, 1, 1.0);
        let start = Instant::now();

        assert!(limiter.try_acquire_at("k", &cfg, start).allowed);
        assert!(!limiter.try_acquire_at("k", &cfg, start + Duration::from_millis(100)).allowed);
        assert!(limiter.try_acquire_at("k", &cfg, start + Duration::from_millis(250)).allowed);
    }

    #[test]
    fn cooldown_rejects_regardless_of_tokens() {
        let limiter = RateLimiter::new();
        let cfg = config(10.0, 10, 5.0);
        let start = Instant::now();

        assert!(limiter.try_acquire_at("nist.gov", &cfg, start).allowed);
        limiter.report_outcome_at("nist.gov", true, start);

        let during = limiter.try_acquire_at("nist.gov", &cfg, start + Duration::from_secs(4));
        assert!(!during.allowed);
        assert_eq!(during.wait, Duration::from_secs(1));

        // Right at the end of cooldown the bucket is empty.
        let at_end = limiter.try_acquire_at("nist.gov", &cfg, start + Duration::from_secs(5));
        assert!(!at_end.allowed);

        // And refills from there.
        let after = limiter.try_acquire_at(
            "nist.gov",
            &cfg,
            start + Duration::from_secs(5) + Duration::from_millis(150),
        );
        assert!(after.allowed);
    }

    #[test]
    fn successful_outcome_does_not_change_state() {
        let limiter = RateLimiter::new();
        let cfg = config(1.0, 2, 5.0);
        let now = Instant::now();
        limiter.try_acquire_at("k", &cfg, now);
        limiter.report_outcome_at("k", false, now);
        let snap = limiter.snapshot_at("k", now).unwrap();
        assert_eq!(snap.cooldowns, 0);
        assert_eq!(snap.cooldown_remaining_ms, 0);
    }

    #[test]
    fn institutions_are_independent() {
        let limiter = RateLimiter::new();
        let cfg = config(1.0, 1, 60.0);
        let now = Instant::now();

        assert!(limiter.try_acquire_at("a.edu", &cfg, now).allowed);
        limiter.report_outcome_at("a.edu", true, now);
        assert!(!limiter.try_acquire_at("a.edu", &cfg, now).allowed);
        assert!(limiter.try_acquire_at("b.edu", &cfg, now).allowed);
        assert_eq!(limiter.tracked_institutions(), 2);
    }

    #[test]
    fn rolling_second_never_exceeds_burst() {
        let limiter = RateLimiter::new();
        let cfg = config(2.0, 3, 1.0);
        let start = Instant::now();
        let mut grants = Vec::new();

        // Poll every 10ms for 5 seconds.
        for step in 0..500u64 {
            let now = start + Duration::from_millis(step * 10);
            if limiter.try_acquire_at("k", &cfg, now).allowed {
                grants.push(now);
            }
        }

        for (i, &t) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|&&g| g.duration_since(t) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 3, "window starting at grant {i} has {in_window} grants");
        }

        // Sustained rate over the last 4 seconds stays at or under rps.
        let tail = grants
            .iter()
            .filter(|&&g| g >= start + Duration::from_secs(1))
            .count();
        assert!(tail <= 2 * 4 + 2, "sustained grants {tail}");
    }

    #[test]
    fn config_change_clamps_tokens() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        limiter.try_acquire_at("k", &config(1.0, 10, 1.0), now);
        limiter.try_acquire_at("k", &config(1.0, 2, 1.0), now);
        let snap = limiter.snapshot_at("k", now).unwrap();
        assert!(snap.tokens_available <= 2.0);
        assert_eq!(snap.burst_limit, 2);
    }

    #[test]
    fn unknown_key_has_no_snapshot() {
        let limiter = RateLimiter::new();
        assert!(limiter.snapshot("nowhere").is_none());
        limiter.report_outcome("nowhere", true);
        assert!(!limiter.in_cooldown("nowhere"));
    }

    #[tokio::test(start_paused = true)]
    async fn ten_jobs_drain_in_at_least_two_and_a_half_seconds() {
        let limiter = Arc::new(RateLimiter::new());
        let cfg = config(2.0, 5, 10.0);
        let start = Instant::now();

        let mut immediate = 0;
        let mut deferred = Vec::new();
        for i in 0..10 {
            let permit = limiter.try_acquire("stanford.edu", &cfg);
            if permit.allowed {
                immediate += 1;
            } else {
                deferred.push((i, permit.wait));
            }
        }
        assert_eq!(immediate, 5);
        assert_eq!(deferred.len(), 5);

        let mut tasks = Vec::new();
        for (_, first_wait) in deferred {
            let limiter = Arc::clone(&limiter);
            let cfg = cfg.clone();
            tasks.push(tokio::spawn(async move {
                let mut wait = first_wait;
                loop {
                    tokio::time::sleep(wait).await;
                    let permit = limiter.try_acquire("stanford.edu", &cfg);
                    if permit.allowed {
                        return Instant::now();
                    }
                    wait = permit.wait;
                }
            }));
        }

        let mut last = start;
        for task in tasks {
            last = last.max(task.await.unwrap());
        }
        assert!(last.duration_since(start) >= Duration::from_millis(2500));
    }
}
