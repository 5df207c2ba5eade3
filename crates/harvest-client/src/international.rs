use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use harvest_core::error::ScrapeError;
use harvest_core::job::{InstitutionType, Job, RateLimitConfig};
use harvest_core::models::{FieldValue, Fields, PageResult, ScrapeResult};
use harvest_core::traits::{AdapterContext, InstitutionAdapter};
use harvest_core::validation::{apply_rules, require_selectors};
use scraper::{Html, Selector};
use tracing::debug;

use crate::dates::normalize_date;
use crate::extract::collapse_whitespace;
use crate::language::detect_language;
use crate::region::{RegionProfile, profile_for_url};

static META_CHARSET: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[charset]").expect("meta[charset] selector is valid"));

/// Universities outside the US: locale-aware headers, regional cooldowns,
/// language detection and date normalization.
#[derive(Debug, Clone, Default)]
pub struct InternationalAdapter;

impl InternationalAdapter {
    pub fn new() -> Self {
        Self
    }

    pub fn profile(job: &Job) -> RegionProfile {
        profile_for_url(&job.url)
    }
}

fn is_date_field(name: &str) -> bool {
    name.to_ascii_lowercase().contains("date")
}

fn normalize_value(name: &str, value: &FieldValue) -> FieldValue {
    let value = value.map(collapse_whitespace);
    if !is_date_field(name) {
        return value;
    }
    value.map(|v| normalize_date(v).unwrap_or_else(|| v.to_string()))
}

fn normalize(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), normalize_value(name, value)))
        .collect()
}

/// Character set declared by the page itself.
fn declared_charset(html: &str) -> Option<String> {
    Html::parse_document(html)
        .select(&META_CHARSET)
        .find_map(|el| el.value().attr("charset"))
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty())
}

#[async_trait]
impl InstitutionAdapter for InternationalAdapter {
    fn institution_type(&self) -> InstitutionType {
        InstitutionType::InternationalUniversity
    }

    fn rate_limit_config(&self, job: &Job) -> RateLimitConfig {
        job.rate_limit_config
            .with_cooldown_multiplier(Self::profile(job).cooldown_multiplier())
    }

    fn headers(&self, job: &Job) -> BTreeMap<String, String> {
        let mut headers = job.config.headers.clone();
        if job.config.header("accept-language").is_none() {
            headers.insert(
                "Accept-Language".to_string(),
                Self::profile(job).accept_language(),
            );
        }
        headers
    }

    fn preflight(&self, job: &Job) -> Result<(), ScrapeError> {
        let has_title = job
            .config
            .selectors
            .get("title")
            .is_some_and(|css| !css.trim().is_empty());
        if has_title {
            Ok(())
        } else {
            Err(ScrapeError::validation(
                "International university jobs need a 'title' selector",
            ))
        }
    }

    async fn scrape(&self, job: &Job, ctx: &AdapterContext) -> Result<ScrapeResult, ScrapeError> {
        self.preflight(job)?;
        let profile = Self::profile(job);

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

        let language = detect_language(&raw.body);
        let charset = declared_charset(&raw.body).unwrap_or_else(|| profile.charset.to_string());
        debug!(
            job_id = %job.id,
            region = %profile.region,
            language = language.as_ref().map(|l| l.code.as_str()).unwrap_or("unknown"),
            "International listing localized"
        );

        let rules = require_selectors(&["title"], &job.validation_rules);
        let validation = apply_rules(&fields, &rules);

        let mut result = ScrapeResult::from_raw(job, &raw, job.engine()).with_fields(fields);
        if !pages.is_empty() {
            result = result.with_pages(pages);
        }
        let (code, source) = match &language {
            Some(l) => (l.code.clone(), l.source.as_str()),
            None => ("unknown".to_string(), "none"),
        };
        Ok(result
            .with_metadata("language", code)
            .with_metadata("language_source", source)
            .with_metadata("region", profile.region.as_str())
            .with_metadata("timezone", profile.timezone)
            .with_metadata("charset", charset)
            .with_validation(validation))
    }
}
