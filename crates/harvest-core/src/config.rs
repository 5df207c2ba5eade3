use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::job::EngineType;

pub const DEFAULT_USER_AGENT: &str = concat!("HarvestBot/", env!("CARGO_PKG_VERSION"));

/// Settings every engine receives at `initialize`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default per-call timeout; a job's own `timeout` overrides it.
    pub timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Skip the public-address check; only for tests against local servers.
    pub allow_private_urls: bool,
    /// Concurrent page fetches inside one crawl.
    pub crawl_concurrency: usize,
    /// Minimum spacing between request starts to one origin during a crawl.
    pub politeness_delay: Duration,
    /// JS heap size above which a render engine asks to be recycled.
    pub heap_threshold_bytes: u64,
    pub headless: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_redirects: 10,
            allow_private_urls: false,
            crawl_concurrency: 4,
            politeness_delay: Duration::from_millis(250),
            heap_threshold_bytes: 512 * 1024 * 1024,
            headless: true,
        }
    }
}

/// Bounds and lifecycle policy for the engine pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub caps: BTreeMap<EngineType, usize>,
    /// How long `acquire` waits for a slot before failing.
    pub acquire_timeout: Duration,
    /// Retire an engine after this many scrapes.
    pub max_uses: u32,
    pub health_check_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let caps = BTreeMap::from([
            (EngineType::Static, 8),
            (EngineType::Render, 2),
            (EngineType::Crawl, 4),
        ]);
        Self {
            caps,
            acquire_timeout: Duration::from_secs(30),
            max_uses: 200,
            health_check_interval: Duration::from_secs(60),
            engine: EngineConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn cap(&self, engine_type: EngineType) -> usize {
        self.caps.get(&engine_type).copied().unwrap_or(1).max(1)
    }

    pub fn with_cap(mut self, engine_type: EngineType, cap: usize) -> Self {
        self.caps.insert(engine_type, cap.max(1));
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub consumer_id: String,
    /// Worker tasks pulling from the broker.
    pub concurrency: usize,
    /// Unacked deliveries the broker may push ahead of processing.
    pub prefetch: u16,
    /// How long in-flight jobs may run after shutdown is requested.
    pub grace_period: Duration,
    /// Back-off after a broker error.
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("consumer-{}", &Uuid::new_v4().to_string()[..8]),
            concurrency: 2,
            prefetch: 2,
            grace_period: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.clamp(1, 16);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub queue: String,
    pub consumer: ConsumerConfig,
    pub pool: PoolConfig,
    pub circuit: CircuitBreakerConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            queue: "scrape.us_university".to_string(),
            consumer: ConsumerConfig::default(),
            pool: PoolConfig::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Read configuration from environment variables.
    ///
    /// Every variable is optional:
    /// - `HARVEST_QUEUE` (default `scrape.us_university`)
    /// - `HARVEST_CONCURRENCY` (2), `HARVEST_PREFETCH` (2, clamped to 1..=16)
    /// - `HARVEST_GRACE_SECS` (30)
    /// - `HARVEST_STATIC_POOL` (8), `HARVEST_RENDER_POOL` (2), `HARVEST_CRAWL_POOL` (4)
    /// - `HARVEST_CIRCUIT_THRESHOLD` (0.5), `HARVEST_CIRCUIT_WINDOW` (20),
    ///   `HARVEST_CIRCUIT_RESET_SECS` (30)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(queue) = lookup("HARVEST_QUEUE").filter(|q| !q.trim().is_empty()) {
            config.queue = queue;
        }

        let concurrency: usize = parse_var(&lookup, "HARVEST_CONCURRENCY", 2)?;
        if concurrency == 0 {
            return Err(AppError::ConfigError(
                "HARVEST_CONCURRENCY must be at least 1".into(),
            ));
        }
        config.consumer.concurrency = concurrency;

        let prefetch: u16 = parse_var(&lookup, "HARVEST_PREFETCH", 2)?;
        config.consumer.prefetch = prefetch.clamp(1, 16);

        let grace: u64 = parse_var(&lookup, "HARVEST_GRACE_SECS", 30)?;
        config.consumer.grace_period = Duration::from_secs(grace);

        for (engine, var, default) in [
            (EngineType::Static, "HARVEST_STATIC_POOL", 8usize),
            (EngineType::Render, "HARVEST_RENDER_POOL", 2),
            (EngineType::Crawl, "HARVEST_CRAWL_POOL", 4),
        ] {
            let cap: usize = parse_var(&lookup, var, default)?;
            if cap == 0 {
                return Err(AppError::ConfigError(format!("{var} must be at least 1")));
            }
            config.pool.caps.insert(engine, cap);
        }

        let threshold: f64 = parse_var(&lookup, "HARVEST_CIRCUIT_THRESHOLD", 0.5)?;
        if !(0.0..1.0).contains(&threshold) {
            return Err(AppError::ConfigError(format!(
                "HARVEST_CIRCUIT_THRESHOLD {threshold} must be in [0.0, 1.0)"
            )));
        }
        config.circuit.failure_threshold = threshold;

        let window: usize = parse_var(&lookup, "HARVEST_CIRCUIT_WINDOW", 20)?;
        if window == 0 {
            return Err(AppError::ConfigError(
                "HARVEST_CIRCUIT_WINDOW must be at least 1".into(),
            ));
        }
        config.circuit.window_size = window;
        config.circuit.minimum_calls = config.circuit.minimum_calls.min(window);

        let reset: u64 = parse_var(&lookup, "HARVEST_CIRCUIT_RESET_SECS", 30)?;
        config.circuit.reset_timeout = Duration::from_secs(reset);

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': expected a number"))
        }),
    }
}
