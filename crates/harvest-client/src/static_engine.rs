use async_trait::async_trait;
use harvest_core::config::EngineConfig;
use harvest_core::error::ScrapeError;
use harvest_core::job::{EngineType, Job};
use harvest_core::models::RawScrape;
use harvest_core::traits::ScrapeEngine;
use reqwest::Client;

use crate::extract::{extract_fields, next_page_url};
use crate::net::fetch_page;

/// Plain HTTP GET plus selector extraction. No JavaScript.
///
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are blocked unless the engine config allows private URLs.
#[derive(Default)]
pub struct StaticEngine {
    client: Option<Client>,
    config: EngineConfig,
}

impl StaticEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScrapeEngine for StaticEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Static
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
            .ok_or_else(|| ScrapeError::internal("Static engine used before initialize"))?;

        let page = fetch_page(
            client,
            &self.config,
            &job.url,
            &job.config.headers,
            job.config.user_agent.as_deref(),
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

        tracing::debug!(
            job_id = %job.id,
            url = %page.final_url,
            status = page.status,
            bytes = page.bytes(),
            "Static fetch complete"
        );

        Ok(RawScrape {
            url: page.url.clone(),
            final_url: page.final_url.clone(),
            status: page.status,
            bytes: page.bytes(),
            duration: page.duration,
            body: page.body,
            fields,
            next_page,
            pages: Vec::new(),
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

#[cfg(test)]
mod tests {
    use harvest_core::error::ErrorKind;
    use harvest_core::job::InstitutionType;
    use harvest_core::models::FieldValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn local_config() -> EngineConfig {
        EngineConfig {
            allow_private_urls: true,
            ..Default::default()
        }
    }

    async fn engine() -> StaticEngine {
        let mut engine = StaticEngine::new();
        engine.initialize(&local_config()).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_extracts_fixture_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .and(header("accept", "text/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<div class="tech-title">Widget</div><div class="tech-description">A gadget</div>"#,
            ))
            .mount(&server)
            .await;

        let job = Job::new(format!("{}/x", server.uri()), InstitutionType::UsUniversity)
            .with_selector("title", ".tech-title")
            .with_selector("description", ".tech-description")
            .with_header("Accept", "text/html");
        let raw = engine().await.scrape(&job).await.unwrap();

        assert_eq!(raw.status, 200);
        assert_eq!(raw.fields["title"], FieldValue::Text("Widget".into()));
        assert_eq!(raw.fields["description"], FieldValue::Text("A gadget".into()));
        assert!(raw.next_page.is_none());
    }

    #[tokio::test]
    async fn test_not_found_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let job = Job::new(format!("{}/gone", server.uri()), InstitutionType::UsUniversity)
            .with_selector("title", "h1");
        let err = engine().await.scrape(&job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_rate_limit_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let job = Job::new(server.uri(), InstitutionType::UsUniversity).with_selector("title", "h1");
        let err = engine().await.scrape(&job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_uninitialized_engine_fails() {
        let mut engine = StaticEngine::new();
        let job = Job::new("https://mit.edu", InstitutionType::UsUniversity).with_selector("t", "h1");
        let err = engine.scrape(&job).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(!engine.health_check().await);
    }
}
