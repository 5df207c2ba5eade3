use async_trait::async_trait;
use harvest_core::error::ScrapeError;
use harvest_core::job::EngineType;
use harvest_core::traits::{EngineFactory, ScrapeEngine};

use crate::crawl::CrawlEngine;
use crate::render::RenderEngine;
use crate::robots::RobotsCache;
use crate::static_engine::StaticEngine;

/// Builds the real engines. Crawl engines share one robots.txt cache.
#[derive(Clone, Default)]
pub struct DefaultEngineFactory {
    robots: RobotsCache,
}

impl DefaultEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_robots_cache(robots: RobotsCache) -> Self {
        Self { robots }
    }
}

#[async_trait]
impl EngineFactory for DefaultEngineFactory {
    async fn create(&self, engine_type: EngineType) -> Result<Box<dyn ScrapeEngine>, ScrapeError> {
        Ok(match engine_type {
            EngineType::Static => Box::new(StaticEngine::new()),
            EngineType::Render => Box::new(RenderEngine::new()),
            EngineType::Crawl => Box::new(CrawlEngine::new(self.robots.clone())),
        })
    }
}
