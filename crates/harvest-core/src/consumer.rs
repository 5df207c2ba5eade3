use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::ConsumerConfig;
use crate::error::{AppError, ScrapeError};
use crate::job::Job;
use crate::models::DeadLetter;
use crate::orchestrator::{JobOutcome, ScraperOrchestrator};
use crate::retry::LoadGauge;
use crate::traits::{Broker, Delivery, MetricsSink, ResultStore};

/// Events emitted by the consumer for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        consumer_id: &'a str,
        concurrency: usize,
    },
    JobReceived {
        job: &'a Job,
        redelivered: bool,
    },
    JobFinished {
        job_id: &'a str,
        outcome: &'a JobOutcome,
    },
    MalformedMessage {
        error: &'a ScrapeError,
    },
    ShuttingDown {
        consumer_id: &'a str,
        in_flight: usize,
    },
    Stopped {
        consumer_id: &'a str,
        aborted: usize,
    },
}

/// Trait for receiving consumer events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started {
                consumer_id,
                concurrency,
            } => {
                tracing::info!(%consumer_id, concurrency, "Consumer started");
            }
            WorkerEvent::JobReceived { job, redelivered } => {
                tracing::debug!(
                    job_id = %job.id,
                    url = %job.url,
                    institution = %job.institution_type,
                    retry_count = job.retry_count,
                    redelivered,
                    "Job received"
                );
            }
            WorkerEvent::JobFinished { job_id, outcome } => {
                tracing::info!(%job_id, %outcome, "Job finished");
            }
            WorkerEvent::MalformedMessage { error } => {
                tracing::warn!(%error, "Malformed job message dead-lettered");
            }
            WorkerEvent::ShuttingDown {
                consumer_id,
                in_flight,
            } => {
                tracing::info!(%consumer_id, in_flight, "Consumer shutting down");
            }
            WorkerEvent::Stopped {
                consumer_id,
                aborted,
            } => {
                tracing::info!(%consumer_id, aborted, "Consumer stopped");
            }
        }
    }
}

/// Pulls job messages from the broker and runs them through the orchestrator
/// on `concurrency` worker tasks.
pub struct JobQueueConsumer<B, S, M>
where
    B: Broker,
    S: ResultStore,
    M: MetricsSink,
{
    orchestrator: Arc<ScraperOrchestrator<B, S, M>>,
    config: ConsumerConfig,
}

impl<B, S, M> JobQueueConsumer<B, S, M>
where
    B: Broker,
    S: ResultStore,
    M: MetricsSink,
{
    pub fn new(orchestrator: ScraperOrchestrator<B, S, M>, config: ConsumerConfig) -> Self {
        let orchestrator = orchestrator.with_load_gauge(LoadGauge::new(config.concurrency));
        Self {
            orchestrator: Arc::new(orchestrator),
            config,
        }
    }

    pub fn orchestrator(&self) -> &ScraperOrchestrator<B, S, M> {
        &self.orchestrator
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Run until `cancel` fires or the broker closes.
    ///
    /// On shutdown no new deliveries are pulled, in-flight jobs get the grace
    /// period to finish, and the rest are aborted. Aborted deliveries stay
    /// unacknowledged and are recovered for redelivery. The engine pool is
    /// cleaned up last.
    pub async fn run<R: WorkerReporter + 'static>(
        &self,
        cancel: CancellationToken,
        reporter: Arc<R>,
    ) -> Result<(), AppError> {
        let consumer_id = self.config.consumer_id.as_str();
        reporter.report(WorkerEvent::Started {
            consumer_id,
            concurrency: self.config.concurrency,
        });

        let pool = self.orchestrator.pool().clone();
        let sweep_cancel = cancel.child_token();
        let sweep = pool.spawn_health_sweep(pool.config().health_check_interval, sweep_cancel.clone());

        let mut workers = JoinSet::new();
        let spawn_worker = |workers: &mut JoinSet<()>, worker: usize| {
            workers.spawn(worker_loop(
                worker,
                Arc::clone(&self.orchestrator),
                Arc::clone(&reporter),
                cancel.clone(),
                self.config.error_backoff,
            ));
        };
        for worker in 0..self.config.concurrency {
            spawn_worker(&mut workers, worker);
        }
        let mut next_worker = self.config.concurrency;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                joined = workers.join_next() => match joined {
                    Some(result) => {
                        if log_join(result) && !cancel.is_cancelled() {
                            warn!(worker = next_worker, "Replacing crashed worker");
                            spawn_worker(&mut workers, next_worker);
                            next_worker += 1;
                        }
                    }
                    None => break,
                },
            }
        }

        reporter.report(WorkerEvent::ShuttingDown {
            consumer_id,
            in_flight: self.orchestrator.load().in_flight(),
        });

        let deadline = Instant::now() + self.config.grace_period;
        let mut aborted = 0;
        while !workers.is_empty() {
            tokio::select! {
                joined = workers.join_next() => {
                    if let Some(result) = joined {
                        log_join(result);
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    aborted = workers.len();
                    warn!(aborted, "Grace period elapsed, aborting in-flight jobs");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                }
            }
        }

        if let Err(e) = self.orchestrator.broker().recover().await {
            error!(error = %e, "Failed to recover unacknowledged deliveries");
        }

        sweep_cancel.cancel();
        if let Err(e) = sweep.await {
            warn!(error = %e, "Health sweep task ended abnormally");
        }
        pool.cleanup_all().await;

        reporter.report(WorkerEvent::Stopped {
            consumer_id,
            aborted,
        });
        Ok(())
    }
}

/// Logs a finished worker; true when it panicked.
fn log_join(result: Result<(), tokio::task::JoinError>) -> bool {
    match result {
        Err(e) if e.is_panic() => {
            error!(error = %e, "Worker task panicked");
            true
        }
        _ => false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

async fn worker_loop<B, S, M, R>(
    worker: usize,
    orchestrator: Arc<ScraperOrchestrator<B, S, M>>,
    reporter: Arc<R>,
    cancel: CancellationToken,
    error_backoff: std::time::Duration,
) where
    B: Broker,
    S: ResultStore,
    M: MetricsSink,
    R: WorkerReporter,
{
    debug!(worker, "Worker started");
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = orchestrator.broker().receive() => received,
        };

        match received {
            Ok(Some(delivery)) => handle_delivery(&orchestrator, reporter.as_ref(), delivery).await,
            Ok(None) => {
                debug!(worker, "Broker closed");
                break;
            }
            Err(e) => {
                error!(worker, error = %e, "Failed to receive from broker");
                tokio::select! {
                    () = tokio::time::sleep(error_backoff) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
    }
    debug!(worker, "Worker stopped");
}

async fn handle_delivery<B, S, M, R>(
    orchestrator: &ScraperOrchestrator<B, S, M>,
    reporter: &R,
    delivery: Delivery,
) where
    B: Broker,
    S: ResultStore,
    M: MetricsSink,
    R: WorkerReporter,
{
    let broker = orchestrator.broker();

    let job = match Job::from_message(&delivery.body) {
        Ok(job) => job,
        Err(e) => {
            let error = ScrapeError::validation(format!("Malformed job message: {e}"));
            reporter.report(WorkerEvent::MalformedMessage { error: &error });
            let letter = DeadLetter::malformed(&delivery.body, error);
            let settled = match broker.publish_dead_letter(&letter).await {
                Ok(()) => broker.ack(delivery.tag).await,
                Err(publish_err) => {
                    error!(error = %publish_err, "Failed to dead-letter malformed message, rejecting");
                    broker.nack(delivery.tag, false).await
                }
            };
            if let Err(e) = settled {
                error!(tag = delivery.tag, error = %e, "Failed to settle malformed delivery");
            }
            return;
        }
    };

    reporter.report(WorkerEvent::JobReceived {
        job: &job,
        redelivered: delivery.redelivered,
    });
    let job_id = job.id.clone();
    let snapshot = job.clone();

    let processed = AssertUnwindSafe(orchestrator.process(job)).catch_unwind().await;
    let processed = match processed {
        Ok(processed) => processed,
        Err(payload) => {
            // Redelivering would crash the next worker the same way.
            let message = panic_message(payload.as_ref());
            error!(%job_id, panic = message, "Job processing panicked, dead-lettering");
            let error = ScrapeError::internal(format!("Job processing panicked: {message}"))
                .for_job(&snapshot.id, &snapshot.url, snapshot.retry_count);
            let outcome = JobOutcome::DeadLettered(error.clone());
            reporter.report(WorkerEvent::JobFinished {
                job_id: &job_id,
                outcome: &outcome,
            });
            let settled = match broker.publish_dead_letter(&DeadLetter::new(snapshot, error)).await {
                Ok(()) => broker.ack(delivery.tag).await,
                Err(publish_err) => {
                    error!(%job_id, error = %publish_err, "Failed to dead-letter crashed job, rejecting");
                    broker.nack(delivery.tag, false).await
                }
            };
            if let Err(e) = settled {
                error!(%job_id, error = %e, "Failed to settle crashed delivery");
            }
            return;
        }
    };

    match processed {
        Ok(outcome) => {
            reporter.report(WorkerEvent::JobFinished {
                job_id: &job_id,
                outcome: &outcome,
            });
            if let Err(e) = broker.ack(delivery.tag).await {
                error!(%job_id, error = %e, "Failed to ack delivery");
            }
        }
        Err(e) => {
            error!(%job_id, error = %e, "Failed to route job outcome, requeueing delivery");
            if let Err(e) = broker.nack(delivery.tag, true).await {
                error!(%job_id, error = %e, "Failed to nack delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::config::PoolConfig;
    use crate::job::{InstitutionType, RateLimitConfig};
    use crate::orchestrator::AdapterRegistry;
    use crate::pool::EnginePool;
    use crate::rate_limiter::RateLimiter;
    use crate::testutil::{
        MockAdapter, MockEngineFactory, MockMetrics, MockReporter, MockStore, make_test_job,
    };

    struct Fixture {
        broker: MemoryBroker,
        store: MockStore,
        metrics: MockMetrics,
        factory: MockEngineFactory,
        consumer: Arc<JobQueueConsumer<MemoryBroker, MockStore, MockMetrics>>,
    }

    fn fixture(factory: MockEngineFactory, config: ConsumerConfig) -> Fixture {
        fixture_with_adapter(factory, config, MockAdapter::new(InstitutionType::UsUniversity))
    }

    fn fixture_with_adapter(
        factory: MockEngineFactory,
        config: ConsumerConfig,
        adapter: MockAdapter,
    ) -> Fixture {
        let broker = MemoryBroker::new();
        let store = MockStore::new();
        let metrics = MockMetrics::new();
        let orchestrator = ScraperOrchestrator::new(
            broker.clone(),
            store.clone(),
            metrics.clone(),
            AdapterRegistry::new().register(adapter),
            EnginePool::new(Arc::new(factory.clone()), PoolConfig::default()),
            Arc::new(RateLimiter::new()),
            CircuitBreakerConfig::default(),
        );
        Fixture {
            broker,
            store,
            metrics,
            factory,
            consumer: Arc::new(JobQueueConsumer::new(orchestrator, config)),
        }
    }

    fn spawn_run(
        fx: &Fixture,
        cancel: &CancellationToken,
        reporter: &MockReporter,
    ) -> tokio::task::JoinHandle<Result<(), AppError>> {
        let consumer = Arc::clone(&fx.consumer);
        let cancel = cancel.clone();
        let reporter = Arc::new(reporter.clone());
        tokio::spawn(async move { consumer.run(cancel, reporter).await })
    }

    #[tokio::test]
    async fn test_processes_and_acks_jobs() {
        let fx = fixture(MockEngineFactory::new(), ConsumerConfig::default());
        for _ in 0..3 {
            fx.broker
                .publish(&make_test_job(), Duration::ZERO, 5)
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = spawn_run(&fx, &cancel, &reporter);

        fx.broker.wait_idle().await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(fx.store.success_count(), 3);
        assert_eq!(fx.broker.acked(), 3);
        assert_eq!(reporter.count("finished"), 3);
        assert_eq!(reporter.count("stopped aborted=0"), 1);
        assert_eq!(fx.factory.alive(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered_and_acked() {
        let fx = fixture(MockEngineFactory::new(), ConsumerConfig::default());
        fx.broker.publish_raw(b"{not json".to_vec(), 5);
        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = spawn_run(&fx, &cancel, &reporter);

        fx.broker.wait_idle().await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let letters = fx.broker.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].job.is_none());
        assert_eq!(letters[0].raw_message.as_deref(), Some("{not json"));
        assert_eq!(letters[0].error.kind, crate::error::ErrorKind::ValidationError);
        assert_eq!(fx.broker.acked(), 1);
        assert_eq!(reporter.count("malformed"), 1);
    }

    #[tokio::test]
    async fn test_crashing_job_does_not_stop_other_jobs() {
        const CRASH_URL: &str = "https://crash.stanford.edu/technologies";
        let adapter = MockAdapter::new(InstitutionType::UsUniversity);
        adapter.crash_on(CRASH_URL);
        let fx = fixture_with_adapter(
            MockEngineFactory::new(),
            ConsumerConfig::default().with_concurrency(1),
            adapter,
        );
        for _ in 0..2 {
            let mut job = make_test_job();
            job.url = CRASH_URL.to_string();
            fx.broker.publish(&job, Duration::ZERO, 9).await.unwrap();
        }
        for _ in 0..3 {
            fx.broker
                .publish(&make_test_job(), Duration::ZERO, 5)
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = spawn_run(&fx, &cancel, &reporter);

        fx.broker.wait_idle().await;
        assert!(!run.is_finished());
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(fx.store.success_count(), 3);
        assert_eq!(fx.broker.acked(), 5);
        let letters = fx.broker.dead_letters();
        assert_eq!(letters.len(), 2);
        assert!(letters.iter().all(|l| l.error.kind == crate::error::ErrorKind::InternalError));
        assert!(letters[0].error.message.contains("adapter crashed"));
        assert_eq!(letters[0].job.as_ref().map(|j| j.url.as_str()), Some(CRASH_URL));
        assert_eq!(reporter.count("finished"), 5);
    }

    #[tokio::test]
    async fn test_shutdown_requeues_in_flight_job() {
        let factory = MockEngineFactory::new().with_delay(Duration::from_secs(30));
        let config = ConsumerConfig::default()
            .with_concurrency(1)
            .with_grace_period(Duration::from_millis(50));
        let fx = fixture(factory, config);
        fx.broker
            .publish(&make_test_job(), Duration::ZERO, 5)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = spawn_run(&fx, &cancel, &reporter);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.factory.scrape_calls(), 1);
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(fx.broker.ready_len(), 1);
        assert_eq!(fx.broker.unacked_len(), 0);
        assert!(fx.broker.dead_letters().is_empty());
        assert_eq!(fx.store.success_count(), 0);
        assert_eq!(reporter.count("stopped aborted=1"), 1);
        assert_eq!(fx.factory.alive(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_throttled_across_workers() {
        let fx = fixture(
            MockEngineFactory::new(),
            ConsumerConfig::default().with_concurrency(2),
        );
        let limit = RateLimitConfig {
            requests_per_second: 2.0,
            burst_limit: 5,
            cooldown_period: 60.0,
        };
        for _ in 0..10 {
            let job = make_test_job().with_rate_limit(limit.clone());
            fx.broker.publish(&job, Duration::ZERO, 5).await.unwrap();
        }

        let start = Instant::now();
        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = spawn_run(&fx, &cancel, &reporter);

        fx.broker.wait_idle().await;
        let elapsed = start.elapsed();
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(fx.store.success_count(), 10);
        assert!(elapsed >= Duration::from_millis(2500), "drained in {elapsed:?}");
        assert!(fx.metrics.count(crate::metrics::JOBS_RATE_LIMITED, "us_university") >= 5);
    }

    #[tokio::test]
    async fn test_broker_close_stops_consumer() {
        let fx = fixture(MockEngineFactory::new(), ConsumerConfig::default());
        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = spawn_run(&fx, &cancel, &reporter);

        tokio::task::yield_now().await;
        fx.broker.close();
        run.await.unwrap().unwrap();
        assert_eq!(reporter.count("started"), 1);
        assert_eq!(reporter.count("stopped"), 1);
    }
}
