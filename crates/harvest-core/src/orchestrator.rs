//! Per-job state machine: limiter gate, breaker-wrapped adapter call, then
//! completion, requeue or dead-letter.
//!
//! Retries are never run inline. A job that needs another attempt is
//! republished with a delay and the current delivery is acknowledged, so an
//! attempt and its retry can never overlap.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{AppError, ErrorKind, ScrapeError};
use crate::job::{EngineType, InstitutionType, Job, JobStatus};
use crate::metrics::{JOBS_FAILED, JOBS_PROCESSED, JOBS_RATE_LIMITED, JOBS_RETRIED, SCRAPE_DURATION};
use crate::models::{DeadLetter, ScrapeResult};
use crate::pool::EnginePool;
use crate::rate_limiter::RateLimiter;
use crate::retry::{LoadGauge, RetryDecision, RetryPolicy};
use crate::traits::{AdapterContext, Broker, InstitutionAdapter, MetricsSink, ResultStore};

/// Upper bound on the stagger between continuation jobs.
const MAX_CONTINUATION_SPACING: Duration = Duration::from_secs(3600);

/// What happened to one job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(ScrapeResult),
    /// Limiter denied entry; the job was republished to run after `wait`.
    RateLimited { wait: Duration },
    /// Failed retryably; republished as attempt `retry_count` after `delay`.
    Retrying { delay: Duration, retry_count: u32 },
    DeadLettered(ScrapeError),
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "completed",
            JobOutcome::RateLimited { .. } => "rate_limited",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::DeadLettered(_) => "dead_lettered",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed(_))
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapters keyed by the institution type they serve.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<InstitutionType, Arc<dyn InstitutionAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for its own institution type, replacing any previous one.
    pub fn register(mut self, adapter: impl InstitutionAdapter + 'static) -> Self {
        self.adapters
            .insert(adapter.institution_type(), Arc::new(adapter));
        self
    }

    pub fn get(&self, institution_type: InstitutionType) -> Option<Arc<dyn InstitutionAdapter>> {
        self.adapters.get(&institution_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Drives jobs through the gate, the adapter and the outcome routing.
///
/// One circuit breaker is kept per engine type. Engine crashes or pool
/// exhaustion open it for every institution routed to that engine.
pub struct ScraperOrchestrator<B, S, M>
where
    B: Broker,
    S: ResultStore,
    M: MetricsSink,
{
    broker: B,
    store: S,
    metrics: M,
    adapters: AdapterRegistry,
    context: AdapterContext,
    breakers: BTreeMap<EngineType, CircuitBreaker>,
    retry: RetryPolicy,
    load: LoadGauge,
}

impl<B, S, M> ScraperOrchestrator<B, S, M>
where
    B: Broker,
    S: ResultStore,
    M: MetricsSink,
{
    pub fn new(
        broker: B,
        store: S,
        metrics: M,
        adapters: AdapterRegistry,
        pool: EnginePool,
        limiter: Arc<RateLimiter>,
        circuit_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            broker,
            store,
            metrics,
            adapters,
            context: AdapterContext::new(pool, limiter),
            breakers: EngineType::ALL
                .into_iter()
                .map(|engine| (engine, CircuitBreaker::new(engine.as_str(), circuit_config.clone())))
                .collect(),
            retry: RetryPolicy::new(),
            load: LoadGauge::new(1),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load gauge shared with the consumer; its capacity is the worker count.
    pub fn with_load_gauge(mut self, load: LoadGauge) -> Self {
        self.load = load;
        self
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn pool(&self) -> &EnginePool {
        &self.context.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.context.limiter
    }

    pub fn load(&self) -> &LoadGauge {
        &self.load
    }

    /// Breaker guarding jobs that run on `engine`.
    pub fn breaker(&self, engine: EngineType) -> &CircuitBreaker {
        &self.breakers[&engine]
    }

    /// Run one job to an outcome.
    ///
    /// `Err` means the outcome could not be routed (broker publish failed);
    /// the caller should leave the delivery for redelivery.
    pub async fn process(&self, mut job: Job) -> Result<JobOutcome, AppError> {
        if job.status != JobStatus::Pending {
            debug!(job_id = %job.id, status = %job.status, "Resetting inbound job status to pending");
            job.status = JobStatus::Pending;
        }

        if let Err(e) = job.validate() {
            return self.dead_letter(job, e).await;
        }

        let Some(adapter) = self.adapters.get(job.institution_type) else {
            let e = ScrapeError::internal(format!(
                "No adapter registered for {}",
                job.institution_type
            ));
            return self.dead_letter(job, e).await;
        };

        if let Err(e) = adapter.preflight(&job) {
            return self.dead_letter(job, e).await;
        }

        let key = adapter.rate_limit_key(&job);
        let limit = adapter.rate_limit_config(&job);
        let class = job.institution_type.class();

        let permit = self.context.limiter.try_acquire(&key, &limit);
        if !permit.allowed {
            job.transition(JobStatus::RateLimited)?;
            job.transition(JobStatus::Pending)?;
            self.broker.publish(&job, permit.wait, job.priority()).await?;
            self.metrics.increment(JOBS_RATE_LIMITED, class);
            debug!(
                job_id = %job.id,
                institution = %key,
                wait_ms = permit.wait_ms(),
                "Rate limited, requeued"
            );
            return Ok(JobOutcome::RateLimited { wait: permit.wait });
        }

        job.transition(JobStatus::Running)?;
        let started = Instant::now();
        let result = {
            let _guard = self.load.enter();
            let breaker = self.breaker(job.engine());
            let ctx = &self.context;
            let job_ref = &job;
            let adapter = &adapter;
            breaker.call(move || adapter.scrape(job_ref, ctx)).await
        };
        let elapsed = started.elapsed();

        match result {
            Ok(result) => {
                self.context.limiter.report_outcome(&key, false);
                job.transition(JobStatus::Completed)?;
                self.complete(&job, adapter.as_ref(), result, elapsed).await
            }
            Err(breaker_err) => {
                let e = breaker_err.into_scrape_error();
                let rate_limited = e.kind == ErrorKind::RateLimited;
                self.context.limiter.report_outcome(&key, rate_limited);
                let e = e
                    .for_job(&job.id, &job.url, job.retry_count)
                    .with_rate_limit_snapshot(self.context.limiter.snapshot(&key));
                self.fail(job, e, &key).await
            }
        }
    }

    async fn complete(
        &self,
        job: &Job,
        adapter: &dyn InstitutionAdapter,
        result: ScrapeResult,
        elapsed: Duration,
    ) -> Result<JobOutcome, AppError> {
        let class = job.institution_type.class();
        if let Err(e) = self.store.log_success(&result).await {
            error!(job_id = %job.id, error = %e, "Failed to store scrape result");
        }
        self.metrics.increment(JOBS_PROCESSED, class);
        self.metrics.observe(SCRAPE_DURATION, class, elapsed);

        let continuations = adapter.continuation_jobs(job, &result);
        if !continuations.is_empty() {
            let spacing = Duration::try_from_secs_f64(1.0 / job.rate_limit_config.requests_per_second)
                .unwrap_or(MAX_CONTINUATION_SPACING)
                .min(MAX_CONTINUATION_SPACING);
            for (i, next) in continuations.iter().enumerate() {
                let delay = spacing.saturating_mul(i as u32 + 1);
                self.broker.publish(next, delay, next.priority()).await?;
            }
            info!(
                job_id = %job.id,
                deferred = continuations.len(),
                "Published continuation jobs for deferred pages"
            );
        }

        if result.success {
            info!(
                job_id = %job.id,
                url = %job.url,
                pages = result.performance_metrics.pages,
                duration_ms = elapsed.as_millis() as u64,
                "Job completed"
            );
        } else {
            warn!(
                job_id = %job.id,
                errors = ?result.validation.errors,
                "Job completed with validation errors"
            );
        }
        Ok(JobOutcome::Completed(result))
    }

    async fn fail(&self, mut job: Job, e: ScrapeError, key: &str) -> Result<JobOutcome, AppError> {
        match self.retry.decide(&job, &e, self.load.factor()) {
            RetryDecision::Retry {
                delay,
                next_retry_count,
            } => {
                // Institution-wide cooldown wins over per-job backoff.
                let delay = match e.kind {
                    ErrorKind::RateLimited => e
                        .rate_limit_snapshot
                        .as_ref()
                        .map(|s| Duration::from_millis(s.cooldown_remaining_ms))
                        .map_or(delay, |cooldown| cooldown.max(delay)),
                    _ => delay,
                };
                job.transition(JobStatus::Retrying)?;
                job.retry_count = next_retry_count;
                job.transition(JobStatus::Pending)?;
                self.broker.publish(&job, delay, job.priority()).await?;
                self.metrics
                    .increment(JOBS_RETRIED, job.institution_type.class());
                warn!(
                    job_id = %job.id,
                    institution = %key,
                    kind = %e.kind,
                    retry_count = next_retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Job failed, retry scheduled: {}",
                    e.message
                );
                Ok(JobOutcome::Retrying {
                    delay,
                    retry_count: next_retry_count,
                })
            }
            RetryDecision::DeadLetter { reason } => {
                debug!(job_id = %job.id, %reason, "Routing to dead letter");
                self.dead_letter(job, e).await
            }
        }
    }

    async fn dead_letter(&self, mut job: Job, e: ScrapeError) -> Result<JobOutcome, AppError> {
        let e = if e.job_id.is_none() {
            e.for_job(&job.id, &job.url, job.retry_count)
        } else {
            e
        };
        job.transition(JobStatus::Failed)?;
        job.transition(JobStatus::DeadLettered)?;

        if let Err(store_err) = self.store.log_error(&e).await {
            error!(job_id = %job.id, error = %store_err, "Failed to store scrape error");
        }
        let class = job.institution_type.class();
        let letter = DeadLetter::new(job, e.clone());
        self.broker.publish_dead_letter(&letter).await?;
        self.metrics.increment(JOBS_FAILED, class);
        warn!(
            job_id = letter.job_id().unwrap_or("-"),
            kind = %e.kind,
            severity = e.kind.status_code(),
            "Job dead-lettered: {}",
            e.message
        );
        Ok(JobOutcome::DeadLettered(e))
    }
}
