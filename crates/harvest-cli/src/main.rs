use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use harvest_client::{DefaultEngineFactory, default_adapters};
use harvest_core::config::HarvestConfig;
use harvest_core::job::{Job, MIN_REQUESTS_PER_SECOND, RateLimitConfig};
use harvest_core::metrics::TracingMetrics;
use harvest_core::orchestrator::{JobOutcome, ScraperOrchestrator};
use harvest_core::pool::EnginePool;
use harvest_core::rate_limiter::RateLimiter;
use harvest_core::traits::TracingStore;
use harvest_core::MemoryBroker;

#[derive(Parser)]
#[command(
    name = "harvest",
    version,
    about = "Distributed scraping orchestrator for tech-transfer portals"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume scrape jobs from a RabbitMQ queue until interrupted
    Consume {
        /// AMQP connection URL
        #[arg(long, env = "HARVEST_BROKER_URL", default_value = "amqp://127.0.0.1:5672/%2f")]
        broker_url: String,

        /// Queue to consume (defaults to HARVEST_QUEUE or scrape.us_university)
        #[arg(short, long)]
        queue: Option<String>,

        /// Worker tasks (overrides HARVEST_CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Unacked deliveries to prefetch (overrides HARVEST_PREFETCH)
        #[arg(long)]
        prefetch: Option<u16>,

        /// API key for federal portals whose jobs carry none
        #[arg(long, env = "HARVEST_FEDERAL_API_KEY")]
        federal_api_key: Option<String>,
    },

    /// Run a single job from a JSON file and print the result
    Scrape {
        /// Path to the job JSON
        #[arg(short, long)]
        job: PathBuf,

        /// API key for federal portals whose jobs carry none
        #[arg(long, env = "HARVEST_FEDERAL_API_KEY")]
        federal_api_key: Option<String>,

        /// Allow loopback and private network targets
        #[arg(long, default_value_t = false)]
        allow_private: bool,
    },

    /// Print when a burst of requests would be admitted by the rate limiter
    CheckRate {
        /// Sustained requests per second
        #[arg(long, default_value_t = 1.0)]
        rps: f64,

        /// Token bucket size
        #[arg(long, default_value_t = 3)]
        burst: u32,

        /// Requests arriving at once
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Consume {
            broker_url,
            queue,
            concurrency,
            prefetch,
            federal_api_key,
        } => {
            let mut config = HarvestConfig::from_env().context("Invalid HARVEST_* configuration")?;
            if let Some(queue) = queue {
                config.queue = queue;
            }
            if let Some(concurrency) = concurrency {
                config.consumer = config.consumer.with_concurrency(concurrency);
            }
            if let Some(prefetch) = prefetch {
                config.consumer = config.consumer.with_prefetch(prefetch);
            }
            cmd_consume(&broker_url, config, federal_api_key).await?;
        }
        Commands::Scrape {
            job,
            federal_api_key,
            allow_private,
        } => {
            cmd_scrape(&job, federal_api_key, allow_private).await?;
        }
        Commands::CheckRate {
            rps,
            burst,
            requests,
        } => {
            cmd_check_rate(rps, burst, requests)?;
        }
    }

    Ok(())
}

#[cfg(feature = "amqp")]
async fn cmd_consume(
    broker_url: &str,
    config: HarvestConfig,
    federal_api_key: Option<String>,
) -> Result<()> {
    use harvest_client::{AmqpBroker, AmqpConfig};
    use harvest_core::consumer::{JobQueueConsumer, TracingWorkerReporter};
    use tokio_util::sync::CancellationToken;

    let mut amqp = AmqpConfig::new(broker_url, config.queue.clone());
    amqp.prefetch = config.consumer.prefetch;
    let broker = AmqpBroker::connect(&amqp)
        .await
        .context("Failed to connect to the job queue")?;

    let pool = EnginePool::new(Arc::new(DefaultEngineFactory::new()), config.pool.clone());
    let orchestrator = ScraperOrchestrator::new(
        broker.clone(),
        TracingStore,
        TracingMetrics,
        default_adapters(federal_api_key),
        pool,
        Arc::new(RateLimiter::new()),
        config.circuit.clone(),
    );
    let consumer = JobQueueConsumer::new(orchestrator, config.consumer.clone());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    let outcome = consumer.run(cancel, Arc::new(TracingWorkerReporter)).await;
    broker.close().await.ok();
    outcome.context("Consumer stopped with an error")
}

#[cfg(not(feature = "amqp"))]
async fn cmd_consume(
    _broker_url: &str,
    _config: HarvestConfig,
    _federal_api_key: Option<String>,
) -> Result<()> {
    anyhow::bail!("harvest was built without the `amqp` feature; rebuild with --features amqp")
}

fn load_job(path: &Path) -> Result<Job> {
    let body = std::fs::read(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    Job::from_message(&body).with_context(|| format!("Invalid job JSON in {}", path.display()))
}

async fn cmd_scrape(path: &Path, federal_api_key: Option<String>, allow_private: bool) -> Result<()> {
    let job = load_job(path)?;
    let mut config = HarvestConfig::from_env().context("Invalid HARVEST_* configuration")?;
    config.pool.engine.allow_private_urls = allow_private;

    tracing::info!(job_id = %job.id, url = %job.url, institution = %job.institution_type, "Running job");

    let pool = EnginePool::new(Arc::new(DefaultEngineFactory::new()), config.pool);
    let orchestrator = ScraperOrchestrator::new(
        MemoryBroker::new(),
        TracingStore,
        TracingMetrics,
        default_adapters(federal_api_key),
        pool,
        Arc::new(RateLimiter::new()),
        config.circuit,
    );

    let outcome = orchestrator.process(job).await;
    orchestrator.pool().cleanup_all().await;

    match outcome.context("Job could not be processed")? {
        JobOutcome::Completed(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        JobOutcome::DeadLettered(error) => {
            println!("{}", serde_json::to_string_pretty(&error)?);
            anyhow::bail!("Job failed: {} ({})", error.message, error.kind);
        }
        JobOutcome::Retrying { delay, retry_count } => {
            anyhow::bail!(
                "Job failed retryably; attempt {retry_count} would run after {}ms",
                delay.as_millis()
            );
        }
        JobOutcome::RateLimited { wait } => {
            anyhow::bail!("Rate limited; retry after {}ms", wait.as_millis());
        }
    }

    Ok(())
}

/// Offsets, from the first request, at which each of `requests` simultaneous
/// requests is admitted.
fn admission_schedule(config: &RateLimitConfig, requests: usize) -> Vec<Duration> {
    let limiter = RateLimiter::new();
    let start = tokio::time::Instant::now();
    let mut now = start;
    let mut schedule = Vec::with_capacity(requests);
    while schedule.len() < requests {
        let permit = limiter.try_acquire_at("check-rate", config, now);
        if permit.allowed {
            schedule.push(now - start);
        } else {
            now += permit.wait.max(Duration::from_millis(1));
        }
    }
    schedule
}

fn cmd_check_rate(rps: f64, burst: u32, requests: usize) -> Result<()> {
    if !rps.is_finite() || rps < MIN_REQUESTS_PER_SECOND || burst == 0 {
        anyhow::bail!("--rps must be at least {MIN_REQUESTS_PER_SECOND} and --burst at least 1");
    }
    let config = RateLimitConfig {
        requests_per_second: rps,
        burst_limit: burst,
        ..RateLimitConfig::default()
    };

    println!("rps={rps} burst={burst}");
    for (i, offset) in admission_schedule(&config, requests).iter().enumerate() {
        println!("request {:>3}  +{:>6}ms", i + 1, offset.as_millis());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_admitted_immediately() {
        let config = RateLimitConfig {
            requests_per_second: 2.0,
            burst_limit: 3,
            ..RateLimitConfig::default()
        };
        let schedule = admission_schedule(&config, 5);
        assert_eq!(schedule.len(), 5);
        assert!(schedule[..3].iter().all(|d| d.is_zero()));
        assert!(schedule[3] > Duration::ZERO);
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_cli_parses_check_rate() {
        let cli = Cli::try_parse_from(["harvest", "check-rate", "--rps", "0.5", "-n", "4"]).unwrap();
        match cli.command {
            Commands::CheckRate { rps, burst, requests } => {
                assert_eq!(rps, 0.5);
                assert_eq!(burst, 3);
                assert_eq!(requests, 4);
            }
            _ => panic!("expected check-rate"),
        }
    }
}
