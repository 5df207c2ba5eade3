pub mod crawl;
pub mod dates;
pub mod extract;
pub mod factory;
pub mod federal;
pub mod international;
pub mod language;
pub mod net;
pub mod region;
pub mod render;
pub mod robots;
pub mod static_engine;
pub mod university;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig, QueueTopology};
pub use crawl::CrawlEngine;
pub use factory::DefaultEngineFactory;
pub use federal::FederalAdapter;
pub use international::InternationalAdapter;
pub use render::RenderEngine;
pub use robots::RobotsCache;
pub use static_engine::StaticEngine;
pub use university::UniversityAdapter;

use harvest_core::orchestrator::AdapterRegistry;

/// Registry with one adapter per institution type.
///
/// `federal_api_key` is sent to federal portals whose jobs carry no key header.
pub fn default_adapters(federal_api_key: Option<String>) -> AdapterRegistry {
    AdapterRegistry::new()
        .register(UniversityAdapter::new())
        .register(FederalAdapter::new(federal_api_key))
        .register(InternationalAdapter::new())
}
