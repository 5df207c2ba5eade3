use std::collections::BTreeMap;

use async_trait::async_trait;
use harvest_core::error::ScrapeError;
use harvest_core::job::{InstitutionType, Job};
use harvest_core::models::{Fields, PageResult, ScrapeResult};
use harvest_core::traits::{AdapterContext, InstitutionAdapter};
use harvest_core::validation::{apply_rules, require_selectors};
use tracing::debug;
use url::Url;

use crate::extract::collapse_whitespace;

const REQUIRED_FIELDS: [&str; 2] = ["title", "description"];
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Tech-transfer listings of US universities, or any university when
/// configured with a local `Accept-Language`.
#[derive(Debug, Clone)]
pub struct UniversityAdapter {
    accept_language: String,
    any_host: bool,
}

impl Default for UniversityAdapter {
    fn default() -> Self {
        Self {
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            any_host: false,
        }
    }
}

impl UniversityAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Language preference sent when the job sets none, e.g. `"de-DE,de;q=0.9,en;q=0.5"`.
    pub fn with_accept_language(mut self, value: impl Into<String>) -> Self {
        self.accept_language = value.into();
        self
    }

    /// Skip the academic-domain check. For mirrors and local fixtures.
    pub fn allow_any_host(mut self) -> Self {
        self.any_host = true;
        self
    }
}

/// Whether `host` looks like a university domain.
///
/// Accepts `.edu`, country-coded academic zones (`ox.ac.uk`, `unsw.edu.au`)
/// and hosts naming themselves a university (`uni-heidelberg.de`).
pub fn is_academic_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.ends_with(".edu") {
        return true;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 {
        let zone = &labels[..labels.len() - 1];
        if zone.iter().skip(1).any(|l| *l == "ac" || *l == "edu") {
            return true;
        }
    }
    labels.iter().any(|l| {
        l.starts_with("uni-") || l.starts_with("univ") || l.contains("university")
    })
}

fn normalize(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), value.map(collapse_whitespace)))
        .collect()
}

#[async_trait]
impl InstitutionAdapter for UniversityAdapter {
    fn institution_type(&self) -> InstitutionType {
        InstitutionType::UsUniversity
    }

    fn headers(&self, job: &Job) -> BTreeMap<String, String> {
        let mut headers = job.config.headers.clone();
        if job.config.header("accept-language").is_none() {
            headers.insert("Accept-Language".to_string(), self.accept_language.clone());
        }
        headers
    }

    fn preflight(&self, job: &Job) -> Result<(), ScrapeError> {
        for field in REQUIRED_FIELDS {
            let present = job
                .config
                .selectors
                .get(field)
                .is_some_and(|css| !css.trim().is_empty());
            if !present {
                return Err(ScrapeError::validation(format!(
                    "University jobs need a '{field}' selector"
                )));
            }
        }

        if self.any_host {
            return Ok(());
        }
        let host = Url::parse(&job.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| ScrapeError::validation(format!("Job URL '{}' has no host", job.url)))?;
        if !is_academic_host(&host) {
            return Err(ScrapeError::validation(format!(
                "'{host}' does not look like an academic domain"
            )));
        }
        Ok(())
    }

    async fn scrape(&self, job: &Job, ctx: &AdapterContext) -> Result<ScrapeResult, ScrapeError> {
        self.preflight(job)?;

        let mut engine_job = job.clone();
        engine_job.config.headers = self.headers(job);
        let raw = ctx.run_engine(&engine_job).await?;

        let fields = normalize(&raw.fields);
        let pages: Vec<PageResult> = raw
            .pages
            .iter()
            .map(|p| PageResult {
                fields: normalize(&p.fields),
                ..p.clone()
            })
            .collect();

        let rules = require_selectors(&REQUIRED_FIELDS, &job.validation_rules);
        let validation = apply_rules(&fields, &rules);
        if !validation.valid {
            debug!(job_id = %job.id, errors = ?validation.errors, "University listing failed validation");
        }

        let mut result = ScrapeResult::from_raw(job, &raw, job.engine()).with_fields(fields);
        if !pages.is_empty() {
            result = result.with_pages(pages);
        }
        Ok(result
            .with_metadata("accept_language", engine_job.config.header("accept-language").unwrap_or_default())
            .with_validation(validation))
    }
}
