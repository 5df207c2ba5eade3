use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, ScrapeError};
use crate::job::{EngineType, Job};

/// Extracted value of one field: scalar text for a single match, an ordered
/// list when the selector matched several elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Build from matched texts in document order. `None` when empty.
    pub fn from_matches(mut matches: Vec<String>) -> Option<Self> {
        match matches.len() {
            0 => None,
            1 => matches.pop().map(FieldValue::Text),
            _ => Some(FieldValue::List(matches)),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::List(_) => None,
        }
    }

    /// All values, one for `Text`.
    pub fn values(&self) -> Vec<&str> {
        match self {
            FieldValue::Text(s) => vec![s.as_str()],
            FieldValue::List(items) => items.iter().map(String::as_str).collect(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        self.values().into_iter().next()
    }

    pub fn is_blank(&self) -> bool {
        self.values().iter().all(|v| v.trim().is_empty())
    }

    /// Apply `f` to every value, keeping the shape.
    pub fn map(&self, f: impl Fn(&str) -> String) -> Self {
        match self {
            FieldValue::Text(s) => FieldValue::Text(f(s)),
            FieldValue::List(items) => FieldValue::List(items.iter().map(|s| f(s)).collect()),
        }
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub duration_ms: u64,
    pub bytes: u64,
    pub pages: u32,
    pub engine: EngineType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.valid &= other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self
    }
}

/// One fetched page of a multi-page job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub url: String,
    pub status: u16,
    pub fields: Fields,
    pub bytes: u64,
}

/// What an engine hands back before any adapter post-processing.
#[derive(Debug, Clone)]
pub struct RawScrape {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub fields: Fields,
    /// Absolute URL of the next page, when the job has a `nextSelector`.
    pub next_page: Option<String>,
    /// Every page fetched for this call, the first one included. Empty for
    /// single-page engines.
    pub pages: Vec<PageResult>,
    pub duration: Duration,
    pub bytes: u64,
}

impl RawScrape {
    pub fn page(&self) -> PageResult {
        PageResult {
            url: self.final_url.clone(),
            status: self.status,
            fields: self.fields.clone(),
            bytes: self.bytes,
        }
    }
}

/// Final outcome of a successful scrape.
///
/// Never mutated once built; enrichment consumes the value and returns a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub job_id: String,
    pub url: String,
    pub extracted_fields: Fields,
    /// SHA-256 of the first page body.
    pub raw_snapshot_ref: String,
    pub performance_metrics: PerformanceMetrics,
    pub validation: ValidationResult,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<PageResult>,
    /// Pages not fetched because the institution's limiter denied them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deferred_pages: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub scraped_at: DateTime<Utc>,
}

impl ScrapeResult {
    pub fn from_raw(job: &Job, raw: &RawScrape, engine: EngineType) -> Self {
        let pages = if raw.pages.is_empty() { 1 } else { raw.pages.len() };
        Self {
            job_id: job.id.clone(),
            url: job.url.clone(),
            extracted_fields: raw.fields.clone(),
            raw_snapshot_ref: compute_hash(&raw.body),
            performance_metrics: PerformanceMetrics {
                duration_ms: raw.duration.as_millis() as u64,
                bytes: raw.bytes,
                pages: pages as u32,
                engine,
            },
            validation: ValidationResult::ok(),
            success: true,
            pages: raw.pages.clone(),
            deferred_pages: Vec::new(),
            metadata: BTreeMap::new(),
            scraped_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace validation; `success` follows `validation.valid`.
    pub fn with_validation(mut self, validation: ValidationResult) -> Self {
        self.success = validation.valid;
        self.validation = validation;
        self
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.extracted_fields = fields;
        self
    }

    /// Replace the page list, keeping the page count metric in step.
    pub fn with_pages(mut self, pages: Vec<PageResult>) -> Self {
        self.performance_metrics.pages = pages.len().max(1) as u32;
        self.performance_metrics.bytes = pages.iter().map(|p| p.bytes).sum();
        self.pages = pages;
        self
    }

    pub fn with_deferred_pages(mut self, deferred: Vec<String>) -> Self {
        self.deferred_pages = deferred;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.performance_metrics.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.extracted_fields.get(name)
    }

    /// Per-page field sets; the single extracted set when there is one page.
    pub fn records(&self) -> Vec<&Fields> {
        if self.pages.is_empty() {
            vec![&self.extracted_fields]
        } else {
            self.pages.iter().map(|p| &p.fields).collect()
        }
    }
}

/// Payload published to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Job snapshot at failure time. Absent when the message never decoded.
    pub job: Option<Job>,
    /// Original body of a message that could not be decoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    pub error: ScrapeError,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(job: Job, error: ScrapeError) -> Self {
        Self {
            job: Some(job),
            raw_message: None,
            error,
            failed_at: Utc::now(),
        }
    }

    pub fn malformed(body: &[u8], error: ScrapeError) -> Self {
        Self {
            job: None,
            raw_message: Some(String::from_utf8_lossy(body).into_owned()),
            error,
            failed_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job.as_ref().map(|j| j.id.as_str())
    }

    pub fn to_message(&self) -> Result<Vec<u8>, AppError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
