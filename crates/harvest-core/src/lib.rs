pub mod broker;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod consumer;
pub mod error;
pub mod job;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod pool;
pub mod rate_limiter;
pub mod retry;
pub mod traits;
pub mod validation;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use broker::MemoryBroker;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classify::{ErrorClassifier, RawFailure};
pub use config::{ConsumerConfig, EngineConfig, HarvestConfig, PoolConfig};
pub use consumer::{JobQueueConsumer, TracingWorkerReporter, WorkerEvent, WorkerReporter};
pub use error::{AppError, ErrorKind, ScrapeError};
pub use job::{EngineType, InstitutionType, Job, JobStatus};
pub use models::{DeadLetter, FieldValue, Fields, ScrapeResult, compute_hash};
pub use orchestrator::{AdapterRegistry, JobOutcome, ScraperOrchestrator};
pub use pool::{EngineHandle, EnginePool};
pub use rate_limiter::{Permit, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use traits::{
    AdapterContext, Broker, EngineFactory, InstitutionAdapter, MetricsSink, ResultStore,
    ScrapeEngine,
};
