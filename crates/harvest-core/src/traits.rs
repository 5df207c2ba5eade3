use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::{AppError, ScrapeError};
use crate::job::{EngineType, InstitutionType, Job, RateLimitConfig};
use crate::models::{DeadLetter, RawScrape, ScrapeResult};
use crate::pool::EnginePool;
use crate::rate_limiter::RateLimiter;

/// A scraping backend. One instance serves one job at a time.
#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// Bring up backend resources (HTTP client, browser process).
    async fn initialize(&mut self, config: &EngineConfig) -> Result<(), ScrapeError>;

    /// Fetch and extract. Backend failures come back classified.
    async fn scrape(&mut self, job: &Job) -> Result<RawScrape, ScrapeError>;

    /// Lightweight liveness check used by the pool's health sweep.
    async fn health_check(&self) -> bool;

    /// True when the engine should be retired instead of returned to idle.
    fn needs_recycle(&self) -> bool {
        false
    }

    async fn cleanup(&mut self) -> Result<(), ScrapeError>;
}

/// Builds uninitialized engines for the pool.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, engine_type: EngineType) -> Result<Box<dyn ScrapeEngine>, ScrapeError>;
}

/// What an adapter may use while scraping.
#[derive(Clone)]
pub struct AdapterContext {
    pub pool: EnginePool,
    pub limiter: Arc<RateLimiter>,
}

impl AdapterContext {
    pub fn new(pool: EnginePool, limiter: Arc<RateLimiter>) -> Self {
        Self { pool, limiter }
    }

    /// Run `job` on a pooled engine of the job's engine type.
    ///
    /// The handle goes back to the pool whether the scrape succeeded or not.
    pub async fn run_engine(&self, job: &Job) -> Result<RawScrape, ScrapeError> {
        let mut handle = self.pool.acquire(job.engine(), job).await?;
        let result = handle.scrape(job).await;
        self.pool.release(handle).await;
        result
    }
}

/// Institution-type policy wrapped around an engine.
#[async_trait]
pub trait InstitutionAdapter: Send + Sync {
    fn institution_type(&self) -> InstitutionType;

    fn rate_limit_key(&self, job: &Job) -> String {
        job.rate_limit_key()
    }

    /// Effective limiter config for this job, including any regional scaling.
    fn rate_limit_config(&self, job: &Job) -> RateLimitConfig {
        job.rate_limit_config.clone()
    }

    /// Headers the engine must send, job headers included.
    fn headers(&self, job: &Job) -> BTreeMap<String, String> {
        job.config.headers.clone()
    }

    /// Gates checked before the limiter or any network call.
    fn preflight(&self, _job: &Job) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn scrape(&self, job: &Job, ctx: &AdapterContext) -> Result<ScrapeResult, ScrapeError>;

    /// Follow-up jobs for pages the scrape deferred. By default each
    /// deferred URL becomes a single-page job.
    fn continuation_jobs(&self, job: &Job, result: &ScrapeResult) -> Vec<Job> {
        result
            .deferred_pages
            .iter()
            .map(|url| {
                let mut next = job.continuation(url.as_str());
                next.config.pagination = None;
                next
            })
            .collect()
    }
}

/// A message pulled from the broker, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Job transport. Deliveries stay unacked until `ack` or `nack`.
pub trait Broker: Send + Sync + Clone + 'static {
    /// Wait for the next delivery. `None` means the broker is closed.
    fn receive(&self) -> impl Future<Output = Result<Option<Delivery>, AppError>> + Send;

    fn ack(&self, tag: u64) -> impl Future<Output = Result<(), AppError>> + Send;

    fn nack(&self, tag: u64, requeue: bool) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Publish `job`, visible to consumers after `delay`.
    fn publish(
        &self,
        job: &Job,
        delay: Duration,
        priority: u8,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn publish_dead_letter(
        &self,
        letter: &DeadLetter,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Requeue every unacknowledged delivery for redelivery.
    fn recover(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persistence collaborator. Write-only from the core's point of view.
pub trait ResultStore: Send + Sync + Clone + 'static {
    fn log_success(
        &self,
        result: &ScrapeResult,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn log_error(&self, error: &ScrapeError) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Push-based metrics. Calls never fail and never block.
pub trait MetricsSink: Send + Sync + Clone + 'static {
    fn increment(&self, metric: &str, class: &str);

    fn observe(&self, metric: &str, class: &str, value: Duration);
}

/// A no-op ResultStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl ResultStore for NullStore {
    async fn log_success(&self, _result: &ScrapeResult) -> Result<(), AppError> {
        Ok(())
    }

    async fn log_error(&self, _error: &ScrapeError) -> Result<(), AppError> {
        Ok(())
    }
}

/// ResultStore that writes each outcome to the log.
#[derive(Debug, Clone)]
pub struct TracingStore;

impl ResultStore for TracingStore {
    async fn log_success(&self, result: &ScrapeResult) -> Result<(), AppError> {
        tracing::info!(
            job_id = %result.job_id,
            url = %result.url,
            success = result.success,
            fields = result.extracted_fields.len(),
            pages = result.performance_metrics.pages,
            snapshot = %result.raw_snapshot_ref,
            "Scrape result"
        );
        Ok(())
    }

    async fn log_error(&self, error: &ScrapeError) -> Result<(), AppError> {
        tracing::warn!(
            job_id = error.job_id.as_deref().unwrap_or("-"),
            url = error.url.as_deref().unwrap_or("-"),
            kind = %error.kind,
            severity = error.kind.status_code(),
            retry_attempt = error.retry_attempt,
            "Scrape failed: {}",
            error.message
        );
        Ok(())
    }
}
