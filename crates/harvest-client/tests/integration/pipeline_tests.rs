use std::sync::Arc;
use std::time::Duration;

use harvest_client::{DefaultEngineFactory, InternationalAdapter, UniversityAdapter, default_adapters};
use harvest_core::config::ConsumerConfig;
use harvest_core::consumer::JobQueueConsumer;
use harvest_core::error::ErrorKind;
use harvest_core::job::{InstitutionType, Job};
use harvest_core::metrics::{JOBS_FAILED, JOBS_PROCESSED};
use harvest_core::models::FieldValue;
use harvest_core::orchestrator::{AdapterRegistry, JobOutcome};
use harvest_core::testutil::{MockEngineFactory, MockReporter};
use harvest_core::traits::Broker;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{
    GERMAN_LISTING, TECH_LISTING, fast_limits, pipeline, university_job,
};

fn university_adapters() -> AdapterRegistry {
    AdapterRegistry::new().register(UniversityAdapter::new().allow_any_host())
}

async fn serve(server: &MockServer, route: &str, template: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_university_listing_completes() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/technologies",
        ResponseTemplate::new(200).set_body_string(TECH_LISTING),
    )
    .await;

    let p = pipeline(Arc::new(DefaultEngineFactory::new()), university_adapters());
    let job = university_job(format!("{}/technologies", server.uri()));
    let class = job.institution_type.class();

    let outcome = p.orchestrator.process(job).await.unwrap();
    let JobOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {}", outcome.as_str());
    };

    assert!(result.success);
    assert_eq!(
        result.field("title"),
        Some(&FieldValue::Text("Solid-state battery electrolyte".into()))
    );
    assert_eq!(
        result.field("description"),
        Some(&FieldValue::Text("A ceramic electrolyte for safer lithium cells.".into()))
    );
    assert_eq!(result.performance_metrics.pages, 1);
    assert_eq!(p.store.success_count(), 1);
    assert_eq!(p.metrics.count(JOBS_PROCESSED, class), 1);
    assert!(p.broker.dead_letters().is_empty());
}

#[tokio::test]
async fn test_missing_selector_is_dead_lettered() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/technologies",
        ResponseTemplate::new(200).set_body_string(TECH_LISTING),
    )
    .await;

    let p = pipeline(Arc::new(DefaultEngineFactory::new()), university_adapters());
    let job = university_job(format!("{}/technologies", server.uri()))
        .with_selector("inventor", ".tech-inventor");
    let class = job.institution_type.class();

    let outcome = p.orchestrator.process(job).await.unwrap();
    let JobOutcome::DeadLettered(err) = outcome else {
        panic!("expected dead letter, got {}", outcome.as_str());
    };

    assert_eq!(err.kind, ErrorKind::ParseError);
    assert!(err.message.contains(".tech-inventor"));
    assert_eq!(p.broker.dead_letters().len(), 1);
    assert_eq!(p.store.error_count(), 1);
    assert_eq!(p.metrics.count(JOBS_FAILED, class), 1);
}

#[tokio::test]
async fn test_service_errors_retry_until_dead_letter() {
    let server = MockServer::start().await;
    serve(&server, "/technologies", ResponseTemplate::new(503)).await;

    let p = pipeline(Arc::new(DefaultEngineFactory::new()), university_adapters());
    let mut job = university_job(format!("{}/technologies", server.uri()));
    let max_retries = job.retry_config.max_retries;

    let mut attempts = Vec::new();
    let err = loop {
        match p.orchestrator.process(job.clone()).await.unwrap() {
            JobOutcome::Retrying { retry_count, .. } => {
                attempts.push(retry_count);
                job.retry_count = retry_count;
            }
            JobOutcome::DeadLettered(err) => break err,
            other => panic!("unexpected outcome {}", other.as_str()),
        }
    };

    assert_eq!(attempts, (1..=max_retries).collect::<Vec<_>>());
    assert_eq!(err.kind, ErrorKind::ServiceError);
    assert_eq!(err.retry_attempt, max_retries);
    let published = p.broker.published();
    assert_eq!(published.len(), max_retries as usize);
    assert!(published.iter().all(|r| r.delay > Duration::ZERO));
    assert_eq!(p.broker.dead_letters().len(), 1);
}

#[tokio::test]
async fn test_federal_job_without_key_never_reaches_engine() {
    let factory = MockEngineFactory::new();
    let p = pipeline(Arc::new(factory.clone()), default_adapters(None));
    let job = Job::new("https://www.nrel.gov/technologies", InstitutionType::FederalLab)
        .with_selector("title", "h1")
        .with_rate_limit(fast_limits());

    let outcome = p.orchestrator.process(job).await.unwrap();
    let JobOutcome::DeadLettered(err) = outcome else {
        panic!("expected dead letter, got {}", outcome.as_str());
    };

    assert_eq!(err.kind, ErrorKind::AuthenticationError);
    assert_eq!(factory.created(), 0);
    assert_eq!(factory.scrape_calls(), 0);
    assert_eq!(p.orchestrator.limiter().tracked_institutions(), 0);
}

#[tokio::test]
async fn test_international_listing_is_localized() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/angebote",
        ResponseTemplate::new(200).set_body_string(GERMAN_LISTING),
    )
    .await;

    let p = pipeline(
        Arc::new(DefaultEngineFactory::new()),
        AdapterRegistry::new().register(InternationalAdapter::new()),
    );
    let job = Job::new(
        format!("{}/angebote", server.uri()),
        InstitutionType::InternationalUniversity,
    )
    .with_selector("title", ".title")
    .with_selector("published_date", ".date")
    .with_rate_limit(fast_limits());

    let outcome = p.orchestrator.process(job).await.unwrap();
    let JobOutcome::Completed(result) = outcome else {
        panic!("expected completion, got {}", outcome.as_str());
    };

    assert_eq!(
        result.field("published_date"),
        Some(&FieldValue::Text("2023-10-12".into()))
    );
    assert_eq!(result.metadata["language"], "de");
    assert_eq!(result.metadata["language_source"], "html_lang");
    assert_eq!(result.metadata["charset"], "UTF-8");
}

#[tokio::test]
async fn test_consumer_drains_published_jobs() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/technologies",
        ResponseTemplate::new(200).set_body_string(TECH_LISTING),
    )
    .await;

    let p = pipeline(Arc::new(DefaultEngineFactory::new()), university_adapters());
    let broker = p.broker.clone();
    let store = p.store.clone();
    for _ in 0..2 {
        let job = university_job(format!("{}/technologies", server.uri()));
        broker.publish(&job, Duration::ZERO, job.priority()).await.unwrap();
    }

    let consumer = Arc::new(JobQueueConsumer::new(
        p.orchestrator,
        ConsumerConfig::default().with_consumer_id("it-consumer"),
    ));
    let cancel = CancellationToken::new();
    let reporter = MockReporter::new();
    let run = {
        let consumer = Arc::clone(&consumer);
        let cancel = cancel.clone();
        let reporter = Arc::new(reporter.clone());
        tokio::spawn(async move { consumer.run(cancel, reporter).await })
    };

    broker.wait_idle().await;
    cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(store.success_count(), 2);
    assert_eq!(broker.acked(), 2);
    assert_eq!(reporter.count("finished"), 2);
}
