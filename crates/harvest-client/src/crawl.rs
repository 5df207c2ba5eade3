//! Polite multi-page crawling.
//!
//! Pages are discovered either by a `page_param` counter, fetched with
//! bounded concurrency, or by following a `next_selector` link chain one
//! page at a time. Every request start to the origin is spaced by the
//! larger of the configured politeness delay and the robots.txt
//! `Crawl-delay`.
//!
//! The orchestrator takes one rate-limiter grant per job, which covers the
//! whole crawl. Follow-up page requests go through the pacer only, never
//! the limiter.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use harvest_core::classify::RawFailure;
use harvest_core::config::EngineConfig;
use harvest_core::error::{ErrorKind, ScrapeError};
use harvest_core::job::{EngineType, Job, PaginationConfig};
use harvest_core::models::{PageResult, RawScrape};
use harvest_core::traits::ScrapeEngine;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::extract::{extract_fields, merge_page_fields, next_page_url, page_number, page_url};
use crate::net::{FetchedPage, fetch_page};
use crate::robots::{RobotsCache, RobotsRules};

/// Serializes request starts so consecutive ones are at least `spacing` apart.
struct Pacer {
    next_start: Mutex<Instant>,
    spacing: Duration,
}

impl Pacer {
    fn new(spacing: Duration) -> Self {
        Self {
            next_start: Mutex::new(Instant::now()),
            spacing,
        }
    }

    async fn wait_turn(&self) {
        let mut next = self.next_start.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = (*next).max(now) + self.spacing;
    }
}

/// One fetched and extracted page.
struct Fetched {
    page: FetchedPage,
    result: PageResult,
    next_page: Option<String>,
}

pub struct CrawlEngine {
    client: Option<Client>,
    config: EngineConfig,
    robots: RobotsCache,
}

impl CrawlEngine {
    pub fn new(robots: RobotsCache) -> Self {
        Self {
            client: None,
            config: EngineConfig::default(),
            robots,
        }
    }

    fn user_agent<'a>(&'a self, job: &'a Job) -> &'a str {
        job.config
            .user_agent
            .as_deref()
            .unwrap_or(self.config.user_agent.as_str())
    }

    async fn fetch_one(
        &self,
        client: &Client,
        rules: &RobotsRules,
        pacer: &Pacer,
        job: &Job,
        url: &str,
    ) -> Result<Fetched, ScrapeError> {
        let agent = self.user_agent(job);
        if !rules.is_allowed(agent, url) {
            return Err(RawFailure::Forbidden(format!("robots.txt disallows {url}")).into());
        }

        pacer.wait_turn().await;
        let page = fetch_page(
            client,
            &self.config,
            url,
            &job.config.headers,
            Some(agent),
            job.config.timeout(),
        )
        .await?;
        let fields = extract_fields(&page.body, &job.config.selectors)?;
        let next_page = job
            .config
            .pagination
            .as_ref()
            .and_then(|p| p.next_selector.as_deref())
            .and_then(|sel| next_page_url(&page.body, sel, &page.final_url));

        let result = PageResult {
            url: page.final_url.clone(),
            status: page.status,
            fields,
            bytes: page.bytes(),
        };
        Ok(Fetched {
            page,
            result,
            next_page,
        })
    }

    async fn crawl_numbered(
        &self,
        client: &Client,
        rules: &RobotsRules,
        pacer: &Pacer,
        job: &Job,
        param: &str,
        max_pages: u32,
    ) -> Result<Vec<Fetched>, ScrapeError> {
        let start = page_number(&job.url, param);
        let mut urls = vec![job.url.clone()];
        for offset in 1..max_pages.max(1) {
            urls.push(page_url(&job.url, param, start + offset)?);
        }

        let mut fetches = Vec::with_capacity(urls.len());
        for (index, url) in urls.into_iter().enumerate() {
            fetches.push(async move {
                (index, self.fetch_one(client, rules, pacer, job, &url).await)
            });
        }
        let mut outcomes: Vec<(usize, Result<Fetched, ScrapeError>)> =
            futures::stream::iter(fetches)
                .buffer_unordered(self.config.crawl_concurrency.max(1))
                .collect()
                .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut pages = Vec::new();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(fetched) => pages.push(fetched),
                Err(e) if index > 0 && ends_listing(&e) => {
                    debug!(job_id = %job.id, page = index + 1, kind = %e.kind, "Listing ended");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(pages)
    }

    async fn crawl_linked(
        &self,
        client: &Client,
        rules: &RobotsRules,
        pacer: &Pacer,
        job: &Job,
        max_pages: u32,
    ) -> Result<Vec<Fetched>, ScrapeError> {
        let mut pages: Vec<Fetched> = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(job.url.clone());

        while let Some(url) = next.take() {
            if pages.len() >= max_pages.max(1) as usize || !visited.insert(url.clone()) {
                break;
            }
            match self.fetch_one(client, rules, pacer, job, &url).await {
                Ok(fetched) => {
                    next = fetched.next_page.clone();
                    pages.push(fetched);
                }
                Err(e) if !pages.is_empty() && ends_listing(&e) => {
                    debug!(job_id = %job.id, %url, kind = %e.kind, "Link chain ended");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(pages)
    }
}

/// A later page that is missing or empty marks the end of a listing.
fn ends_listing(e: &ScrapeError) -> bool {
    matches!(e.kind, ErrorKind::NotFound | ErrorKind::ParseError)
}

#[async_trait]
impl ScrapeEngine for CrawlEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Crawl
    }

    async fn initialize(&mut self, config: &EngineConfig) -> Result<(), ScrapeError> {
        self.client = Some(crate::net::build_client(config)?);
        self.config = config.clone();
        Ok(())
    }

    async fn scrape(&mut self, job: &Job) -> Result<RawScrape, ScrapeError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ScrapeError::internal("Crawl engine used before initialize"))?;

        let started = Instant::now();
        let rules = self
            .robots
            .rules_for(client, &job.url, self.user_agent(job))
            .await;
        let spacing = rules
            .crawl_delay()
            .map_or(self.config.politeness_delay, |d| d.max(self.config.politeness_delay));
        let pacer = Pacer::new(spacing);

        let pagination = job.config.pagination.clone().unwrap_or(PaginationConfig {
            next_selector: None,
            page_param: None,
            max_pages: 1,
        });
        let pages = match pagination.page_param.as_deref() {
            Some(param) => {
                self.crawl_numbered(client, &rules, &pacer, job, param, pagination.max_pages)
                    .await?
            }
            None => {
                self.crawl_linked(client, &rules, &pacer, job, pagination.max_pages)
                    .await?
            }
        };

        let Some(first) = pages.first() else {
            return Err(ScrapeError::internal(format!("Crawl of {} fetched no pages", job.url)));
        };
        let next_page = pages.last().and_then(|f| f.next_page.clone());
        let results: Vec<PageResult> = pages.iter().map(|f| f.result.clone()).collect();
        let bytes = results.iter().map(|p| p.bytes).sum();

        info!(
            job_id = %job.id,
            pages = results.len(),
            bytes,
            delay_ms = spacing.as_millis() as u64,
            "Crawl complete"
        );

        Ok(RawScrape {
            url: job.url.clone(),
            final_url: first.page.final_url.clone(),
            status: first.page.status,
            body: first.page.body.clone(),
            fields: merge_page_fields(&results),
            next_page,
            pages: results,
            duration: started.elapsed(),
            bytes,
        })
    }

    async fn health_check(&self) -> bool {
        self.client.is_some()
    }

    async fn cleanup(&mut self) -> Result<(), ScrapeError> {
        self.client = None;
        Ok(())
    }
}
