//! JavaScript-rendering engine backed by headless Chromium.
//!
//! Each engine owns one browser process. Every scrape opens a fresh tab,
//! waits for `document.readyState == "complete"`, extracts from the
//! rendered DOM and closes the tab. When the page's JS heap exceeds the
//! configured threshold, or a step overruns the job timeout, the engine asks
//! the pool to recycle it.
//!
//! Built without the `browser` feature, the engine fails to initialize.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::config::EngineConfig;
use harvest_core::error::ScrapeError;
use harvest_core::job::{EngineType, Job};
use harvest_core::models::RawScrape;
use harvest_core::traits::ScrapeEngine;
use tokio::time::Instant;

/// Run one browser step until `deadline`.
///
/// An overrun leaves the tab mid-navigation with CDP commands in flight, so
/// `recycle` is raised and the pool tears the browser down.
#[cfg_attr(not(feature = "browser"), allow(dead_code))]
async fn bounded<T>(
    deadline: Instant,
    timeout: Duration,
    recycle: &mut bool,
    step: impl Future<Output = Result<T, ScrapeError>>,
) -> Result<T, ScrapeError> {
    match tokio::time::timeout_at(deadline, step).await {
        Ok(result) => result,
        Err(_) => {
            *recycle = true;
            Err(ScrapeError::timeout(timeout))
        }
    }
}

#[cfg(feature = "browser")]
pub use chromium::RenderEngine;

#[cfg(not(feature = "browser"))]
#[derive(Default)]
pub struct RenderEngine;

#[cfg(not(feature = "browser"))]
impl RenderEngine {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl ScrapeEngine for RenderEngine {
    fn engine_type(&self) -> EngineType {
        EngineType::Render
    }

    async fn initialize(&mut self, _config: &EngineConfig) -> Result<(), ScrapeError> {
        Err(ScrapeError::internal(
            "Render engine unavailable: built without the `browser` feature",
        ))
    }

    async fn scrape(&mut self, _job: &Job) -> Result<RawScrape, ScrapeError> {
        Err(ScrapeError::internal("Render engine is not initialized"))
    }

    async fn health_check(&self) -> bool {
        false
    }

    async fn cleanup(&mut self) -> Result<(), ScrapeError> {
        Ok(())
    }
}

#[cfg(feature = "browser")]
mod chromium {
    use std::path::PathBuf;

    use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use harvest_core::classify::RawFailure;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::extract::{extract_fields, next_page_url};

    const READY_POLL: Duration = Duration::from_millis(100);
    const CLOSE_BUDGET: Duration = Duration::from_secs(5);

    fn crash(context: &str, e: impl std::fmt::Display) -> ScrapeError {
        RawFailure::BrowserCrash(format!("{context}: {e}")).into()
    }

    #[derive(Default)]
    pub struct RenderEngine {
        browser: Option<Browser>,
        handler: Option<JoinHandle<()>>,
        config: EngineConfig,
        recycle: bool,
    }

    impl RenderEngine {
        pub fn new() -> Self {
            Self::default()
        }

        /// Locate a Chrome/Chromium binary, `CHROME_BIN` first.
        ///
        /// The snap wrapper at `/snap/bin/chromium` drops unknown flags and
        /// breaks headless mode, so the real binary inside the snap is tried
        /// before the system paths. `None` leaves the lookup to chromiumoxide.
        fn find_chrome_binary() -> Option<PathBuf> {
            if let Ok(p) = std::env::var("CHROME_BIN") {
                let path = PathBuf::from(p);
                if path.exists() {
                    return Some(path);
                }
            }
            [
                "/snap/chromium/current/usr/lib/chromium-browser/chrome",
                "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
                "/usr/bin/google-chrome-stable",
                "/usr/bin/google-chrome",
                "/usr/bin/chromium",
                "/usr/bin/chromium-browser",
            ]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
        }

        async fn render(&mut self, job: &Job) -> Result<RawScrape, ScrapeError> {
            let browser = self
                .browser
                .as_ref()
                .ok_or_else(|| ScrapeError::internal("Render engine used before initialize"))?;
            let timeout = job.config.timeout();
            let started = Instant::now();
            let deadline = started + timeout;

            let page = bounded(deadline, timeout, &mut self.recycle, async {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| crash("Failed to open tab", e))
            })
            .await?;
            let outcome = bounded(
                deadline,
                timeout,
                &mut self.recycle,
                Self::render_in(&page, job, &self.config, started),
            )
            .await;

            match tokio::time::timeout(CLOSE_BUDGET, page.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(job_id = %job.id, error = %e, "Tab close failed");
                    self.recycle = true;
                }
                Err(_) => {
                    tracing::warn!(job_id = %job.id, "Tab close hung, recycling browser");
                    self.recycle = true;
                }
            }

            let (raw, heap) = outcome?;
            if heap > self.config.heap_threshold_bytes {
                tracing::info!(
                    job_id = %job.id,
                    heap_bytes = heap,
                    threshold = self.config.heap_threshold_bytes,
                    "JS heap over threshold, recycling browser"
                );
                self.recycle = true;
            }
            Ok(raw)
        }

        /// Navigate, wait for the DOM and extract. Also returns the JS heap
        /// size in bytes.
        async fn render_in(
            page: &Page,
            job: &Job,
            config: &EngineConfig,
            started: Instant,
        ) -> Result<(RawScrape, u64), ScrapeError> {
            let agent = job
                .config
                .user_agent
                .as_deref()
                .unwrap_or(config.user_agent.as_str());
            page.set_user_agent(agent)
                .await
                .map_err(|e| crash("Failed to set user agent", e))?;

            if !job.config.headers.is_empty() {
                let headers = serde_json::to_value(&job.config.headers)
                    .map_err(|e| ScrapeError::internal(format!("Header encoding failed: {e}")))?;
                page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
                    .await
                    .map_err(|e| crash("Failed to set headers", e))?;
            }

            page.goto(job.url.as_str())
                .await
                .map_err(|e| crash(&format!("Failed to navigate to {}", job.url), e))?;

            loop {
                let state: String = page
                    .evaluate("document.readyState")
                    .await
                    .map_err(|e| crash("readyState check failed", e))?
                    .into_value()
                    .map_err(|e| crash("readyState check returned garbage", e))?;
                if state == "complete" {
                    break;
                }
                tokio::time::sleep(READY_POLL).await;
            }

            let body = page
                .content()
                .await
                .map_err(|e| crash("Failed to read page content", e))?;
            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| job.url.clone());

            let heap: f64 = page
                .evaluate("performance.memory ? performance.memory.usedJSHeapSize : 0")
                .await
                .ok()
                .and_then(|v| v.into_value().ok())
                .unwrap_or(0.0);
            let fields = extract_fields(&body, &job.config.selectors)?;
            let next_page = job
                .config
                .pagination
                .as_ref()
                .and_then(|p| p.next_selector.as_deref())
                .and_then(|sel| next_page_url(&body, sel, &final_url));
            let bytes = body.len() as u64;

            let raw = RawScrape {
                url: job.url.clone(),
                final_url,
                status: 200,
                body,
                fields,
                next_page,
                pages: Vec::new(),
                duration: started.elapsed(),
                bytes,
            };
            Ok((raw, heap as u64))
        }
    }

    #[async_trait]
    impl ScrapeEngine for RenderEngine {
        fn engine_type(&self) -> EngineType {
            EngineType::Render
        }

        async fn initialize(&mut self, config: &EngineConfig) -> Result<(), ScrapeError> {
            let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
            if let Some(bin) = Self::find_chrome_binary() {
                tracing::info!("Using Chrome binary: {}", bin.display());
                builder = builder.chrome_executable(bin);
            }
            if config.headless {
                builder = builder.arg("--headless=new");
            } else {
                builder = builder.with_head();
            }
            let browser_config = builder
                .arg("--disable-gpu")
                .arg("--disable-dev-shm-usage")
                .arg("--disable-extensions")
                .arg("--no-first-run")
                .build()
                .map_err(|e| ScrapeError::internal(format!("Browser config error: {e}")))?;

            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .map_err(|e| crash("Failed to launch browser", e))?;

            // The CDP handler must be polled for the connection to make progress.
            let handle = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        tracing::warn!(error = %e, "Browser CDP handler error");
                        break;
                    }
                }
            });

            self.browser = Some(browser);
            self.handler = Some(handle);
            self.config = config.clone();
            self.recycle = false;
            Ok(())
        }

        async fn scrape(&mut self, job: &Job) -> Result<RawScrape, ScrapeError> {
            self.render(job).await
        }

        async fn health_check(&self) -> bool {
            let Some(browser) = self.browser.as_ref() else {
                return false;
            };
            let alive = self.handler.as_ref().is_some_and(|h| !h.is_finished());
            alive && browser.version().await.is_ok()
        }

        fn needs_recycle(&self) -> bool {
            self.recycle
        }

        async fn cleanup(&mut self) -> Result<(), ScrapeError> {
            if let Some(mut browser) = self.browser.take() {
                if let Err(e) = browser.close().await {
                    tracing::debug!(error = %e, "Browser close failed");
                }
                let _ = browser.wait().await;
            }
            if let Some(handle) = self.handler.take() {
                handle.abort();
            }
            Ok(())
        }
    }
}


#[cfg(test)]
mod deadline_tests {
    use harvest_core::error::ErrorKind;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_overrun_step_raises_recycle() {
        let mut recycle = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = bounded(deadline, Duration::from_secs(2), &mut recycle, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, ScrapeError>(())
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::NetworkTimeout);
        assert!(err.message.contains("2000 ms"));
        assert!(recycle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_within_deadline_keeps_engine() {
        let mut recycle = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        let value = bounded(deadline, Duration::from_secs(2), &mut recycle, async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, ScrapeError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert!(!recycle);

        let err = bounded(deadline, Duration::from_secs(2), &mut recycle, async {
            Err::<(), _>(ScrapeError::internal("tab crashed"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(!recycle);
    }
}
