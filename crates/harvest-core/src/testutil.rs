//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks share their state through `Arc`s so clones handed to the code
//! under test and the copy kept by the test observe the same calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::consumer::{WorkerEvent, WorkerReporter};
use crate::error::{AppError, ScrapeError};
use crate::job::{EngineType, InstitutionType, Job};
use crate::models::{FieldValue, Fields, RawScrape, ScrapeResult};
use crate::traits::{
    AdapterContext, EngineFactory, InstitutionAdapter, MetricsSink, ResultStore, ScrapeEngine,
};

/// A Stanford listing job with `title` and `description` selectors.
pub fn make_test_job() -> Job {
    Job::new(
        "https://tech.stanford.edu/technologies",
        InstitutionType::UsUniversity,
    )
    .with_selector("title", ".tech-title")
    .with_selector("description", ".tech-description")
}

// ---------------------------------------------------------------------------
// MockEngine / MockEngineFactory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineScript {
    responses: VecDeque<Result<RawScrape, ScrapeError>>,
    fields: Option<Fields>,
    fail_create: Option<ScrapeError>,
    last_job: Option<Job>,
}

struct EngineShared {
    script: Mutex<EngineScript>,
    created: AtomicUsize,
    cleaned: AtomicUsize,
    alive: AtomicUsize,
    max_alive: AtomicUsize,
    scrape_calls: AtomicUsize,
    recycle: AtomicBool,
    healthy: AtomicBool,
}

impl Default for EngineShared {
    fn default() -> Self {
        Self {
            script: Mutex::new(EngineScript::default()),
            created: AtomicUsize::new(0),
            cleaned: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            max_alive: AtomicUsize::new(0),
            scrape_calls: AtomicUsize::new(0),
            recycle: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }
}

/// Builds a successful raw scrape with one text value per selector.
pub fn mock_raw_scrape(job: &Job, fields: Option<&Fields>) -> RawScrape {
    let fields = fields.cloned().unwrap_or_else(|| {
        job.config
            .selectors
            .keys()
            .map(|name| (name.clone(), FieldValue::Text(format!("Mock {name}"))))
            .collect()
    });
    let body = format!("<html><body>{}</body></html>", job.url);
    RawScrape {
        url: job.url.clone(),
        final_url: job.url.clone(),
        status: 200,
        bytes: body.len() as u64,
        body,
        fields,
        next_page: None,
        pages: Vec::new(),
        duration: Duration::from_millis(5),
    }
}

/// Engine whose scrapes are served from the factory's shared script.
pub struct MockEngine {
    engine_type: EngineType,
    delay: Duration,
    shared: Arc<EngineShared>,
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.shared.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ScrapeEngine for MockEngine {
    fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    async fn initialize(&mut self, _config: &EngineConfig) -> Result<(), ScrapeError> {
        Ok(())
    }

    async fn scrape(&mut self, job: &Job) -> Result<RawScrape, ScrapeError> {
        self.shared.scrape_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut script = self.shared.script.lock().unwrap();
        script.last_job = Some(job.clone());
        match script.responses.pop_front() {
            Some(response) => response,
            None => Ok(mock_raw_scrape(job, script.fields.as_ref())),
        }
    }

    async fn health_check(&self) -> bool {
        self.shared.healthy.load(Ordering::SeqCst)
    }

    fn needs_recycle(&self) -> bool {
        self.shared.recycle.load(Ordering::SeqCst)
    }

    async fn cleanup(&mut self) -> Result<(), ScrapeError> {
        self.shared.cleaned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for [`MockEngine`]s. Clones share counters and the response script.
#[derive(Clone, Default)]
pub struct MockEngineFactory {
    delay: Duration,
    shared: Arc<EngineShared>,
}

impl MockEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every scrape sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fields returned by default scrapes instead of the generated ones.
    pub fn with_fields(self, fields: Fields) -> Self {
        self.shared.script.lock().unwrap().fields = Some(fields);
        self
    }

    /// Queue one scripted response; drained in order, then defaults resume.
    pub fn push_response(&self, response: Result<RawScrape, ScrapeError>) {
        self.shared.script.lock().unwrap().responses.push_back(response);
    }

    /// Queue `times` copies of the same error.
    pub fn fail_with(&self, error: ScrapeError, times: usize) {
        let mut script = self.shared.script.lock().unwrap();
        for _ in 0..times {
            script.responses.push_back(Err(error.clone()));
        }
    }

    /// The next `create` call fails with `error`.
    pub fn fail_create(&self, error: ScrapeError) {
        self.shared.script.lock().unwrap().fail_create = Some(error);
    }

    pub fn set_recycle(&self, recycle: bool) {
        self.shared.recycle.store(recycle, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.shared.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn cleaned(&self) -> usize {
        self.shared.cleaned.load(Ordering::SeqCst)
    }

    pub fn alive(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn max_alive(&self) -> usize {
        self.shared.max_alive.load(Ordering::SeqCst)
    }

    pub fn scrape_calls(&self) -> usize {
        self.shared.scrape_calls.load(Ordering::SeqCst)
    }

    pub fn last_job(&self) -> Option<Job> {
        self.shared.script.lock().unwrap().last_job.clone()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self, engine_type: EngineType) -> Result<Box<dyn ScrapeEngine>, ScrapeError> {
        if let Some(e) = self.shared.script.lock().unwrap().fail_create.take() {
            return Err(e);
        }
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        let alive = self.shared.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_alive.fetch_max(alive, Ordering::SeqCst);
        Ok(Box::new(MockEngine {
            engine_type,
            delay: self.delay,
            shared: Arc::clone(&self.shared),
        }))
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Adapter that either runs the job on a pooled engine or serves scripted
/// outcomes, counting calls either way.
#[derive(Clone)]
pub struct MockAdapter {
    institution_type: InstitutionType,
    calls: Arc<AtomicUsize>,
    outcomes: Arc<Mutex<VecDeque<Result<ScrapeResult, ScrapeError>>>>,
    preflight_error: Arc<Mutex<Option<ScrapeError>>>,
    crash_url: Arc<Mutex<Option<String>>>,
}

impl MockAdapter {
    pub fn new(institution_type: InstitutionType) -> Self {
        Self {
            institution_type,
            calls: Arc::new(AtomicUsize::new(0)),
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            preflight_error: Arc::new(Mutex::new(None)),
            crash_url: Arc::new(Mutex::new(None)),
        }
    }

    /// Panic inside `scrape` for jobs targeting `url`.
    pub fn crash_on(&self, url: impl Into<String>) {
        *self.crash_url.lock().unwrap() = Some(url.into());
    }

    pub fn push_outcome(&self, outcome: Result<ScrapeResult, ScrapeError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Every preflight fails with `error` until cleared.
    pub fn reject_preflight(&self, error: Option<ScrapeError>) {
        *self.preflight_error.lock().unwrap() = error;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstitutionAdapter for MockAdapter {
    fn institution_type(&self) -> InstitutionType {
        self.institution_type
    }

    fn preflight(&self, _job: &Job) -> Result<(), ScrapeError> {
        match self.preflight_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn scrape(&self, job: &Job, ctx: &AdapterContext) -> Result<ScrapeResult, ScrapeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let crash = self.crash_url.lock().unwrap().clone();
        if crash.as_deref() == Some(job.url.as_str()) {
            panic!("adapter crashed on {}", job.url);
        }
        let scripted = self.outcomes.lock().unwrap().pop_front();
        if let Some(outcome) = scripted {
            return outcome;
        }
        let raw = ctx.run_engine(job).await?;
        Ok(ScrapeResult::from_raw(job, &raw, job.engine()))
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// Store that records every write.
#[derive(Clone, Default)]
pub struct MockStore {
    pub successes: Arc<Mutex<Vec<ScrapeResult>>>,
    pub errors: Arc<Mutex<Vec<ScrapeError>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose writes all fail.
    pub fn failing() -> Self {
        let store = Self::default();
        store.fail_writes.store(true, Ordering::SeqCst);
        store
    }

    pub fn success_count(&self) -> usize {
        self.successes.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::BrokerError("store unavailable".into()));
        }
        Ok(())
    }
}

impl ResultStore for MockStore {
    async fn log_success(&self, result: &ScrapeResult) -> Result<(), AppError> {
        self.check()?;
        self.successes.lock().unwrap().push(result.clone());
        Ok(())
    }

    async fn log_error(&self, error: &ScrapeError) -> Result<(), AppError> {
        self.check()?;
        self.errors.lock().unwrap().push(error.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockMetrics
// ---------------------------------------------------------------------------

/// Metrics sink keeping counters and observations per `(metric, class)`.
#[derive(Clone, Default)]
pub struct MockMetrics {
    counters: Arc<Mutex<HashMap<(String, String), u64>>>,
    observations: Arc<Mutex<Vec<(String, String, Duration)>>>,
}

impl MockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, metric: &str, class: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&(metric.to_string(), class.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn observations(&self, metric: &str) -> usize {
        self.observations
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _, _)| m == metric)
            .count()
    }
}

impl MetricsSink for MockMetrics {
    fn increment(&self, metric: &str, class: &str) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry((metric.to_string(), class.to_string()))
            .or_insert(0) += 1;
    }

    fn observe(&self, metric: &str, class: &str, value: Duration) {
        self.observations
            .lock()
            .unwrap()
            .push((metric.to_string(), class.to_string(), value));
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that keeps a one-line summary of each event.
#[derive(Clone, Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let line = match event {
            WorkerEvent::Started { consumer_id, .. } => format!("started {consumer_id}"),
            WorkerEvent::JobReceived { job, redelivered } => {
                format!("received {} redelivered={redelivered}", job.id)
            }
            WorkerEvent::JobFinished { job_id, outcome } => format!("finished {job_id} {outcome}"),
            WorkerEvent::MalformedMessage { error } => format!("malformed {error}"),
            WorkerEvent::ShuttingDown { in_flight, .. } => format!("shutting_down {in_flight}"),
            WorkerEvent::Stopped { aborted, .. } => format!("stopped aborted={aborted}"),
        };
        self.events.lock().unwrap().push(line);
    }
}

/// Fields map from `(name, text)` pairs.
pub fn text_fields(pairs: &[(&str, &str)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), FieldValue::Text((*v).to_string())))
        .collect::<BTreeMap<_, _>>()
}
