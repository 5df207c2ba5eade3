use std::sync::Arc;

use harvest_core::circuit_breaker::CircuitBreakerConfig;
use harvest_core::config::PoolConfig;
use harvest_core::job::{InstitutionType, Job, RateLimitConfig};
use harvest_core::orchestrator::{AdapterRegistry, ScraperOrchestrator};
use harvest_core::pool::EnginePool;
use harvest_core::rate_limiter::RateLimiter;
use harvest_core::testutil::{MockMetrics, MockStore};
use harvest_core::traits::EngineFactory;
use harvest_core::MemoryBroker;

pub type TestOrchestrator = ScraperOrchestrator<MemoryBroker, MockStore, MockMetrics>;

pub const TECH_LISTING: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><title>Available Technologies</title></head>
<body>
  <div class="tech">
    <h2 class="tech-title">  Solid-state   battery electrolyte </h2>
    <p class="tech-description">A ceramic electrolyte for safer lithium cells.</p>
    <span class="tech-docket">S23-041</span>
  </div>
</body>
</html>"#;

pub const GERMAN_LISTING: &str = r#"<!DOCTYPE html>
<html lang="de">
<head><meta charset="utf-8"><title>Technologieangebote</title></head>
<body>
  <h1 class="title">Verfahren zur Wasserstoffspeicherung</h1>
  <span class="date">12. Oktober 2023</span>
</body>
</html>"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Limits loose enough that a test never waits on the limiter.
pub fn fast_limits() -> RateLimitConfig {
    RateLimitConfig {
        requests_per_second: 50.0,
        burst_limit: 10,
        ..RateLimitConfig::default()
    }
}

pub fn university_job(url: impl Into<String>) -> Job {
    Job::new(url, InstitutionType::UsUniversity)
        .with_selector("title", ".tech-title")
        .with_selector("description", ".tech-description")
        .with_rate_limit(fast_limits())
}

/// Pool whose engines may reach the loopback mock server.
pub fn local_pool(factory: Arc<dyn EngineFactory>) -> EnginePool {
    let mut config = PoolConfig::default();
    config.engine.allow_private_urls = true;
    EnginePool::new(factory, config)
}

pub struct Pipeline {
    pub broker: MemoryBroker,
    pub store: MockStore,
    pub metrics: MockMetrics,
    pub orchestrator: TestOrchestrator,
}

pub fn pipeline(factory: Arc<dyn EngineFactory>, adapters: AdapterRegistry) -> Pipeline {
    init_tracing();
    let broker = MemoryBroker::new();
    let store = MockStore::new();
    let metrics = MockMetrics::new();
    let orchestrator = ScraperOrchestrator::new(
        broker.clone(),
        store.clone(),
        metrics.clone(),
        adapters,
        local_pool(factory),
        Arc::new(RateLimiter::new()),
        CircuitBreakerConfig::default(),
    );
    Pipeline {
        broker,
        store,
        metrics,
        orchestrator,
    }
}
