//! Federal laboratory listings (`.gov` / `.mil`).
//!
//! Federal portals sit behind an API gateway that wants a key header on every
//! request. Listings are paginated; the adapter walks pages itself so the
//! institution's limiter is consulted before each one, and pages the limiter
//! refuses are handed back as `deferred_pages` rather than failing the job.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::error::{ErrorKind, ScrapeError};
use harvest_core::job::{InstitutionType, Job, PaginationConfig};
use harvest_core::models::{PageResult, RawScrape, ScrapeResult, ValidationResult};
use harvest_core::traits::{AdapterContext, InstitutionAdapter};
use harvest_core::validation::apply_rules;
use tracing::{debug, info};
use url::Url;

use crate::extract::{merge_page_fields, page_number, page_url};

pub const DEFAULT_API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Clone)]
pub struct FederalAdapter {
    api_key: Option<String>,
    header_name: String,
    allowed_domains: Vec<String>,
}

impl Default for FederalAdapter {
    fn default() -> Self {
        Self::new(None)
    }
}

/// How the remaining pages of a listing are reached.
enum PageWalk {
    Linked { selector: String },
    Numbered { param: String, start: u32 },
}

/// Pages fetched by one adapter call.
struct Walk {
    first: RawScrape,
    pages: Vec<PageResult>,
    deferred: Vec<String>,
    notes: ValidationResult,
    elapsed: Duration,
}

impl FederalAdapter {
    /// `api_key` is sent when the job does not carry the header itself.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            header_name: DEFAULT_API_KEY_HEADER.to_string(),
            allowed_domains: vec!["gov".to_string(), "mil".to_string()],
        }
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    /// Also accept `domain` and its subdomains, e.g. a lab on a `.org` host.
    pub fn with_allowed_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_domains
            .push(domain.into().trim_start_matches('.').to_ascii_lowercase());
        self
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    fn is_allowed_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains
            .iter()
            .any(|d| (host == *d && d.contains('.')) || host.ends_with(&format!(".{d}")))
    }

    fn api_key<'a>(&'a self, job: &'a Job) -> Option<&'a str> {
        job.config
            .header(&self.header_name)
            .filter(|v| !v.trim().is_empty())
            .or(self.api_key.as_deref())
    }

    fn page_job(base: &Job, url: &str, walk: &PageWalk) -> Job {
        let mut page = base.for_page(url);
        page.config.pagination = match walk {
            PageWalk::Linked { selector } => Some(PaginationConfig {
                next_selector: Some(selector.clone()),
                page_param: None,
                max_pages: 1,
            }),
            PageWalk::Numbered { .. } => None,
        };
        page
    }

    async fn walk_pages(
        &self,
        job: &Job,
        base: &Job,
        ctx: &AdapterContext,
        walk: PageWalk,
        max_pages: u32,
    ) -> Result<Walk, ScrapeError> {
        let key = self.rate_limit_key(job);
        let limit = self.rate_limit_config(job);
        let started = tokio::time::Instant::now();

        // The orchestrator already holds a grant for the first page.
        let first = ctx.run_engine(&Self::page_job(base, &job.url, &walk)).await?;
        let mut pages = vec![first.page()];
        let mut deferred = Vec::new();
        let mut notes = ValidationResult::ok();
        let mut visited = HashSet::from([job.url.clone(), first.final_url.clone()]);
        let mut next_link = first.next_page.clone();

        for offset in 1..max_pages {
            let url = match &walk {
                PageWalk::Linked { .. } => match next_link.take() {
                    Some(url) if visited.insert(url.clone()) => url,
                    _ => break,
                },
                PageWalk::Numbered { param, start } => page_url(&job.url, param, start + offset)?,
            };

            let permit = ctx.limiter.try_acquire(&key, &limit);
            if !permit.allowed {
                info!(job_id = %job.id, %url, wait_ms = permit.wait_ms(), "Page deferred by rate limit");
                deferred.push(url);
                break;
            }

            match ctx.run_engine(&Self::page_job(base, &url, &walk)).await {
                Ok(raw) => {
                    next_link = raw.next_page.clone();
                    pages.push(raw.page());
                }
                Err(e) if e.kind == ErrorKind::RateLimited => {
                    ctx.limiter.report_outcome(&key, true);
                    info!(job_id = %job.id, %url, "Portal throttled mid-listing, deferring");
                    deferred.push(url);
                    break;
                }
                Err(e) if matches!(e.kind, ErrorKind::NotFound | ErrorKind::ParseError) => {
                    debug!(job_id = %job.id, %url, kind = %e.kind, "Listing ended");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    notes.warn(format!("Page {url} deferred after {}: {}", e.kind, e.message));
                    deferred.push(url);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Walk {
            first,
            pages,
            deferred,
            notes,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl InstitutionAdapter for FederalAdapter {
    fn institution_type(&self) -> InstitutionType {
        InstitutionType::FederalLab
    }

    fn headers(&self, job: &Job) -> BTreeMap<String, String> {
        let mut headers = job.config.headers.clone();
        if job.config.header(&self.header_name).is_none() {
            if let Some(key) = self.api_key.as_deref() {
                headers.insert(self.header_name.clone(), key.to_string());
            }
        }
        headers
    }

    fn preflight(&self, job: &Job) -> Result<(), ScrapeError> {
        let host = Url::parse(&job.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| ScrapeError::validation(format!("Job URL '{}' has no host", job.url)))?;
        if !self.is_allowed_host(&host) {
            return Err(ScrapeError::validation(format!(
                "'{host}' is not on the federal domain allow-list"
            )));
        }
        if self.api_key(job).is_none() {
            return Err(ScrapeError::authentication(format!(
                "Federal portal requires the '{}' header",
                self.header_name
            )));
        }
        Ok(())
    }

    async fn scrape(&self, job: &Job, ctx: &AdapterContext) -> Result<ScrapeResult, ScrapeError> {
        self.preflight(job)?;

        let mut base = job.clone();
        base.config.headers = self.headers(job);

        let walk = job.config.pagination.as_ref().filter(|p| p.max_pages > 1).and_then(|p| {
            match (&p.page_param, &p.next_selector) {
                (Some(param), _) => Some((
                    PageWalk::Numbered {
                        param: param.clone(),
                        start: page_number(&job.url, param),
                    },
                    p.max_pages,
                )),
                (None, Some(selector)) => Some((
                    PageWalk::Linked {
                        selector: selector.clone(),
                    },
                    p.max_pages,
                )),
                (None, None) => None,
            }
        });

        let Some((walk, max_pages)) = walk else {
            base.config.pagination = None;
            let raw = ctx.run_engine(&base).await?;
            let validation = apply_rules(&raw.fields, &job.validation_rules);
            return Ok(ScrapeResult::from_raw(job, &raw, job.engine()).with_validation(validation));
        };

        let Walk {
            first,
            pages,
            deferred,
            notes,
            elapsed,
        } = self.walk_pages(job, &base, ctx, walk, max_pages).await?;

        let fields = merge_page_fields(&pages);
        let validation = apply_rules(&fields, &job.validation_rules).merge(notes);
        info!(
            job_id = %job.id,
            pages = pages.len(),
            deferred = deferred.len(),
            "Federal listing scraped"
        );

        Ok(ScrapeResult::from_raw(job, &first, job.engine())
            .with_fields(fields)
            .with_pages(pages)
            .with_deferred_pages(deferred)
            .with_duration(elapsed)
            .with_validation(validation))
    }

    /// A deferred page resumes the walk with the page budget that is left.
    fn continuation_jobs(&self, job: &Job, result: &ScrapeResult) -> Vec<Job> {
        let remaining = job
            .config
            .pagination
            .as_ref()
            .map(|p| p.max_pages.saturating_sub(result.pages.len() as u32).max(1));

        result
            .deferred_pages
            .iter()
            .map(|url| {
                let mut next = job.continuation(url.as_str());
                if let (Some(p), Some(left)) = (next.config.pagination.as_mut(), remaining) {
                    p.max_pages = left;
                }
                next
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use harvest_core::config::PoolConfig;
    use harvest_core::job::RateLimitConfig;
    use harvest_core::pool::EnginePool;
    use harvest_core::rate_limiter::RateLimiter;
    use harvest_core::testutil::{MockEngineFactory, mock_raw_scrape, text_fields};

    use super::*;

    fn context(factory: &MockEngineFactory, limiter: Arc<RateLimiter>) -> AdapterContext {
        let pool = EnginePool::new(Arc::new(factory.clone()), PoolConfig::default());
        AdapterContext::new(pool, limiter)
    }

    fn nrel_job() -> Job {
        Job::new("https://www.nrel.gov/technologies", InstitutionType::FederalLab)
            .with_selector("title", ".t")
    }

    fn linked_page(job: &Job, title: &str, next: Option<&str>) -> RawScrape {
        let mut raw = mock_raw_scrape(job, Some(&text_fields(&[("title", title)])));
        raw.next_page = next.map(String::from);
        raw
    }

    #[test]
    fn test_allow_list() {
        let adapter = FederalAdapter::new(Some("k".into()));
        assert!(adapter.is_allowed_host("www.nrel.gov"));
        assert!(adapter.is_allowed_host("techportal.army.mil"));
        assert!(!adapter.is_allowed_host("nrel.gov.evil.com"));
        assert!(!adapter.is_allowed_host("gov"));
        assert!(adapter.clone().with_allowed_domain("mitre.org").is_allowed_host("labs.mitre.org"));
    }

    #[tokio::test]
    async fn test_missing_key_rejected_before_any_engine_call() {
        let factory = MockEngineFactory::new();
        let ctx = context(&factory, Arc::new(RateLimiter::new()));

        let err = FederalAdapter::new(None).scrape(&nrel_job(), &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationError);
        assert_eq!(factory.created(), 0);
        assert_eq!(factory.scrape_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_federal_domain_rejected() {
        let factory = MockEngineFactory::new();
        let ctx = context(&factory, Arc::new(RateLimiter::new()));
        let job = Job::new("https://tech.stanford.edu/x", InstitutionType::FederalLab)
            .with_header("X-Api-Key", "k");

        let err = FederalAdapter::new(None).scrape(&job, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert_eq!(factory.scrape_calls(), 0);
    }

    #[tokio::test]
    async fn test_key_from_job_header_is_accepted() {
        let factory = MockEngineFactory::new();
        let ctx = context(&factory, Arc::new(RateLimiter::new()));
        let job = nrel_job().with_header("x-api-key", "from-job");

        let result = FederalAdapter::new(Some("configured".into()))
            .scrape(&job, &ctx)
            .await
            .unwrap();
        assert!(result.success);
        let sent = factory.last_job().unwrap();
        assert_eq!(sent.config.header("X-Api-Key"), Some("from-job"));
    }

    #[tokio::test]
    async fn test_configured_key_injected_under_custom_header() {
        let factory = MockEngineFactory::new();
        let ctx = context(&factory, Arc::new(RateLimiter::new()));
        let adapter = FederalAdapter::new(Some("secret".into())).with_header_name("Api-Token");

        adapter.scrape(&nrel_job(), &ctx).await.unwrap();
        let sent = factory.last_job().unwrap();
        assert_eq!(sent.config.header("api-token"), Some("secret"));
    }

    #[tokio::test]
    async fn test_linked_pages_aggregated() {
        let factory = MockEngineFactory::new();
        let job = nrel_job().with_pagination(PaginationConfig {
            next_selector: Some("a.next".into()),
            page_param: None,
            max_pages: 5,
        });
        factory.push_response(Ok(linked_page(&job, "One", Some("https://www.nrel.gov/t?p=2"))));
        factory.push_response(Ok(linked_page(&job, "Two", None)));
        let ctx = context(&factory, Arc::new(RateLimiter::new()));

        let result = FederalAdapter::new(Some("k".into())).scrape(&job, &ctx).await.unwrap();
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.performance_metrics.pages, 2);
        assert!(result.deferred_pages.is_empty());
        assert_eq!(factory.scrape_calls(), 2);
    }

    #[tokio::test]
    async fn test_limiter_denial_defers_remaining_pages() {
        let factory = MockEngineFactory::new();
        let limit = RateLimitConfig {
            requests_per_second: 1.0,
            burst_limit: 2,
            cooldown_period: 60.0,
        };
        let job = nrel_job()
            .with_rate_limit(limit.clone())
            .with_pagination(PaginationConfig {
                next_selector: None,
                page_param: Some("page".into()),
                max_pages: 5,
            });
        let limiter = Arc::new(RateLimiter::new());
        let adapter = FederalAdapter::new(Some("k".into()));
        // The orchestrator's grant for page one.
        assert!(limiter.try_acquire(&adapter.rate_limit_key(&job), &limit).allowed);
        let ctx = context(&factory, Arc::clone(&limiter));

        let result = adapter.scrape(&job, &ctx).await.unwrap();
        assert_eq!(result.pages.len(), 2);
        assert_eq!(
            result.deferred_pages,
            vec!["https://www.nrel.gov/technologies?page=3".to_string()]
        );

        let continuations = adapter.continuation_jobs(&job, &result);
        assert_eq!(continuations.len(), 1);
        let next = &continuations[0];
        assert_eq!(next.url, "https://www.nrel.gov/technologies?page=3");
        assert_eq!(next.config.pagination.as_ref().unwrap().max_pages, 3);
        assert_ne!(next.id, job.id);
    }

    #[tokio::test]
    async fn test_throttled_page_is_deferred_and_cools_down() {
        let factory = MockEngineFactory::new();
        let job = nrel_job().with_pagination(PaginationConfig {
            next_selector: Some("a.next".into()),
            page_param: None,
            max_pages: 4,
        });
        factory.push_response(Ok(linked_page(&job, "One", Some("https://www.nrel.gov/t?p=2"))));
        factory.push_response(Err(ScrapeError::new(ErrorKind::RateLimited, "HTTP 429")));
        let limiter = Arc::new(RateLimiter::new());
        let ctx = context(&factory, Arc::clone(&limiter));
        let adapter = FederalAdapter::new(Some("k".into()));

        let result = adapter.scrape(&job, &ctx).await.unwrap();
        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.deferred_pages, vec!["https://www.nrel.gov/t?p=2".to_string()]);
        assert!(limiter.in_cooldown(&adapter.rate_limit_key(&job)));
    }

    #[tokio::test]
    async fn test_missing_later_page_ends_listing() {
        let factory = MockEngineFactory::new();
        let job = nrel_job().with_pagination(PaginationConfig {
            next_selector: None,
            page_param: Some("page".into()),
            max_pages: 5,
        });
        factory.push_response(Ok(linked_page(&job, "One", None)));
        factory.push_response(Err(ScrapeError::new(ErrorKind::NotFound, "HTTP 404")));
        let ctx = context(&factory, Arc::new(RateLimiter::new()));

        let result = FederalAdapter::new(Some("k".into())).scrape(&job, &ctx).await.unwrap();
        assert_eq!(result.pages.len(), 1);
        assert!(result.deferred_pages.is_empty());
        assert_eq!(factory.scrape_calls(), 2);
    }
}
