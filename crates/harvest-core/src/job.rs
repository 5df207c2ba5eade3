use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, ScrapeError};

/// Kind of institution whose listings a job scrapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstitutionType {
    UsUniversity,
    InternationalUniversity,
    FederalLab,
}

impl InstitutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstitutionType::UsUniversity => "US_UNIVERSITY",
            InstitutionType::InternationalUniversity => "INTERNATIONAL_UNIVERSITY",
            InstitutionType::FederalLab => "FEDERAL_LAB",
        }
    }

    /// Lower-case class name used for queue names and metric labels.
    pub fn class(&self) -> &'static str {
        match self {
            InstitutionType::UsUniversity => "us_university",
            InstitutionType::InternationalUniversity => "international_university",
            InstitutionType::FederalLab => "federal_lab",
        }
    }

    /// Engine used when a job carries no explicit hint.
    pub fn default_engine(&self) -> EngineType {
        match self {
            InstitutionType::UsUniversity | InstitutionType::InternationalUniversity => {
                EngineType::Static
            }
            InstitutionType::FederalLab => EngineType::Crawl,
        }
    }

    /// Broker priority when a job carries none. Higher drains first.
    pub fn default_priority(&self) -> u8 {
        match self {
            InstitutionType::FederalLab => 7,
            InstitutionType::UsUniversity => 5,
            InstitutionType::InternationalUniversity => 3,
        }
    }
}

impl fmt::Display for InstitutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstitutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "US_UNIVERSITY" => Ok(InstitutionType::UsUniversity),
            "INTERNATIONAL_UNIVERSITY" => Ok(InstitutionType::InternationalUniversity),
            "FEDERAL_LAB" => Ok(InstitutionType::FederalLab),
            _ => Err(format!("Unknown institution type: {s}")),
        }
    }
}

/// Scraping backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Static,
    Render,
    Crawl,
}

impl EngineType {
    pub const ALL: [EngineType; 3] = [EngineType::Static, EngineType::Render, EngineType::Crawl];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Static => "static",
            EngineType::Render => "render",
            EngineType::Crawl => "crawl",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(EngineType::Static),
            "render" | "browser" => Ok(EngineType::Render),
            "crawl" => Ok(EngineType::Crawl),
            _ => Err(format!("Unknown engine type: {s}")),
        }
    }
}

/// Status of a job inside the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    RateLimited,
    Retrying,
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::RateLimited => "rate_limited",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLettered
        )
    }

    /// Legal edges of the job state machine.
    ///
    /// ```text
    /// pending -> running -> completed
    ///    ^          |-----> rate_limited -> pending
    ///    |          |-----> retrying ------> pending
    ///    |          `-----> failed -> dead_lettered
    ///    `-- (pending may also move to rate_limited before it ever runs)
    /// ```
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, RateLimited)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, RateLimited)
                | (Running, Retrying)
                | (Running, Failed)
                | (RateLimited, Pending)
                | (Retrying, Pending)
                | (Failed, DeadLettered)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "rate_limited" => Ok(JobStatus::RateLimited),
            "retrying" => Ok(JobStatus::Retrying),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Pagination settings for multi-page listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    /// CSS selector of the "next page" link; its `href` is followed.
    #[serde(default)]
    pub next_selector: Option<String>,
    /// Query parameter carrying the page number (`?page=2`), fetched concurrently.
    #[serde(default)]
    pub page_param: Option<String>,
    /// Upper bound on pages fetched, including the first.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_max_pages() -> u32 {
    10
}

/// Extraction and request settings carried by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeConfig {
    /// Field name to CSS selector.
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            selectors: BTreeMap::new(),
            timeout: default_timeout_ms(),
            user_agent: None,
            headers: BTreeMap::new(),
            pagination: None,
        }
    }
}

impl ScrapeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Slowest accepted rate: one request every 1000 seconds.
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

/// Longest accepted cooldown, one day.
pub const MAX_COOLDOWN_SECS: f64 = 86_400.0;

/// Per-institution token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst_limit: u32,
    /// Cooldown after a rate-limit signal, in seconds.
    pub cooldown_period: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst_limit: 3,
            cooldown_period: 60.0,
        }
    }
}

impl RateLimitConfig {
    /// Cooldown as a duration, clamped to `0..=MAX_COOLDOWN_SECS`.
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_period.clamp(0.0, MAX_COOLDOWN_SECS))
            .unwrap_or(Duration::ZERO)
    }

    /// Same config with the cooldown scaled by `multiplier`.
    pub fn with_cooldown_multiplier(&self, multiplier: f64) -> Self {
        Self {
            cooldown_period: self.cooldown_period * multiplier,
            ..self.clone()
        }
    }
}

/// Retry configuration with exponential backoff.
///
/// Delays are in milliseconds: `initialDelay * backoffFactor^retryCount`,
/// capped at `maxDelay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: u64,
    pub max_delay: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: 1_000,
            max_delay: 60_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay)
    }
}

/// Data-quality rules applied to extracted fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRules {
    #[serde(default)]
    pub required: Vec<String>,
    /// Field name to regular expression the (each) value must match.
    #[serde(default)]
    pub patterns: BTreeMap<String, String>,
}

/// A scrape job as carried on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub url: String,
    pub institution_type: InstitutionType,
    #[serde(default)]
    pub engine_hint: Option<EngineType>,
    #[serde(default)]
    pub config: ScrapeConfig,
    #[serde(default)]
    pub rate_limit_config: RateLimitConfig,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub validation_rules: ValidationRules,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Rate-limit key override; the URL host is used when absent.
    #[serde(default)]
    pub institution_key: Option<String>,
}

impl Job {
    pub fn new(url: impl Into<String>, institution_type: InstitutionType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            institution_type,
            engine_hint: None,
            config: ScrapeConfig::default(),
            rate_limit_config: RateLimitConfig::default(),
            retry_config: RetryConfig::default(),
            retry_count: 0,
            validation_rules: ValidationRules::default(),
            status: JobStatus::Pending,
            priority: None,
            institution_key: None,
        }
    }

    pub fn with_selector(mut self, field: impl Into<String>, selector: impl Into<String>) -> Self {
        self.config.selectors.insert(field.into(), selector.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_engine(mut self, engine: EngineType) -> Self {
        self.engine_hint = Some(engine);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit_config = config;
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.config.pagination = Some(pagination);
        self
    }

    pub fn with_validation(mut self, rules: ValidationRules) -> Self {
        self.validation_rules = rules;
        self
    }

    /// Decode a broker message body.
    pub fn from_message(body: &[u8]) -> Result<Self, AppError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Encode as a broker message body.
    pub fn to_message(&self) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn engine(&self) -> EngineType {
        self.engine_hint
            .unwrap_or_else(|| self.institution_type.default_engine())
    }

    pub fn priority(&self) -> u8 {
        self.priority
            .unwrap_or_else(|| self.institution_type.default_priority())
            .min(9)
    }

    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    /// Key under which the rate limiter accounts for this job's institution.
    pub fn rate_limit_key(&self) -> String {
        self.institution_key
            .clone()
            .or_else(|| self.host())
            .unwrap_or_else(|| self.url.clone())
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.retry_config.max_retries
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), ScrapeError> {
        if !self.status.can_transition_to(next) {
            return Err(ScrapeError::internal(format!(
                "Illegal job transition {} -> {} for job {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Structural checks performed before any rate-limit or network work.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ScrapeError::validation(format!("Invalid URL '{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ScrapeError::validation(format!(
                "URL scheme '{}' is not allowed (only http/https)",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ScrapeError::validation("URL has no host"));
        }
        if self.config.selectors.is_empty() {
            return Err(ScrapeError::validation("Job has no field selectors"));
        }
        if let Some((field, _)) = self
            .config
            .selectors
            .iter()
            .find(|(_, sel)| sel.trim().is_empty())
        {
            return Err(ScrapeError::validation(format!(
                "Selector for field '{field}' is empty"
            )));
        }
        let rl = &self.rate_limit_config;
        if !rl.requests_per_second.is_finite() || rl.requests_per_second < MIN_REQUESTS_PER_SECOND {
            return Err(ScrapeError::validation(format!(
                "rateLimitConfig.requestsPerSecond must be at least {MIN_REQUESTS_PER_SECOND}"
            )));
        }
        if !(0.0..=MAX_COOLDOWN_SECS).contains(&rl.cooldown_period) {
            return Err(ScrapeError::validation(format!(
                "rateLimitConfig.cooldownPeriod must be between 0 and {MAX_COOLDOWN_SECS} seconds"
            )));
        }
        if rl.burst_limit == 0 {
            return Err(ScrapeError::validation(
                "rateLimitConfig.burstLimit must be at least 1",
            ));
        }
        if self.retry_count > self.retry_config.max_retries {
            return Err(ScrapeError::validation(format!(
                "retryCount {} exceeds maxRetries {}",
                self.retry_count, self.retry_config.max_retries
            )));
        }
        Ok(())
    }

    /// Copy of this job targeting another page of the same listing.
    pub fn for_page(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: JobStatus::Pending,
            institution_key: Some(self.rate_limit_key()),
            ..self.clone()
        }
    }

    /// Continuation job for pages deferred by rate limiting.
    ///
    /// Gets a fresh id and zero retries; the original job already completed.
    pub fn continuation(&self, url: impl Into<String>) -> Self {
        Self {
            id: format!("{}-cont-{}", self.id, &Uuid::new_v4().to_string()[..8]),
            retry_count: 0,
            ..self.for_page(url)
        }
    }
}
