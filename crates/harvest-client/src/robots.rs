//! robots.txt fetching and matching for the crawl engine.
//!
//! Rules are cached per origin for an hour. A missing or unreadable
//! robots.txt allows everything.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use reqwest::Client;
use robotstxt::DefaultMatcher;
use tracing::{debug, warn};
use url::Url;

const ROBOTS_TTL: Duration = Duration::from_secs(3600);
const ROBOTS_CAPACITY: u64 = 10_000;

/// Parsed robots.txt for one origin.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    body: String,
    crawl_delay: Option<Duration>,
}

impl RobotsRules {
    pub fn parse(body: &str, user_agent: &str) -> Self {
        Self {
            body: body.to_string(),
            crawl_delay: parse_crawl_delay(body, &product_token(user_agent)),
        }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_allowed(&self, user_agent: &str, url: &str) -> bool {
        if self.body.trim().is_empty() {
            return true;
        }
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.body, &product_token(user_agent), url)
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay
    }
}

/// `HarvestBot/0.1 (+info)` -> `HarvestBot`.
fn product_token(user_agent: &str) -> String {
    user_agent
        .split(['/', ' '])
        .next()
        .unwrap_or(user_agent)
        .to_string()
}

/// `Crawl-delay` from the group naming our agent, else from `*`.
fn parse_crawl_delay(body: &str, agent: &str) -> Option<Duration> {
    let agent = agent.to_ascii_lowercase();
    let mut groups_match = (false, false);
    let mut in_agent_lines = false;
    let mut specific = None;
    let mut wildcard = None;

    for line in body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        if key == "user-agent" {
            if !in_agent_lines {
                groups_match = (false, false);
            }
            in_agent_lines = true;
            let ua = value.to_ascii_lowercase();
            if ua == "*" {
                groups_match.1 = true;
            } else if !ua.is_empty() && agent.starts_with(&ua) {
                groups_match.0 = true;
            }
            continue;
        }
        in_agent_lines = false;

        if key == "crawl-delay" {
            let Ok(secs) = value.parse::<f64>() else {
                continue;
            };
            if !secs.is_finite() || secs < 0.0 {
                continue;
            }
            let delay = Duration::from_secs_f64(secs.min(60.0));
            if groups_match.0 && specific.is_none() {
                specific = Some(delay);
            } else if groups_match.1 && wildcard.is_none() {
                wildcard = Some(delay);
            }
        }
    }

    specific.or(wildcard)
}

/// `scheme://host[:port]` of `url`.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    })
}

/// Per-origin robots.txt cache, shared by every crawl engine of a process.
#[derive(Clone)]
pub struct RobotsCache {
    cache: Cache<String, Arc<RobotsRules>>,
}

impl Default for RobotsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotsCache {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(ROBOTS_CAPACITY)
                .time_to_live(ROBOTS_TTL)
                .build(),
        }
    }

    /// Rules for the origin of `url`, fetched on first use.
    pub async fn rules_for(&self, client: &Client, url: &str, user_agent: &str) -> Arc<RobotsRules> {
        let Some(origin) = origin_of(url) else {
            return Arc::new(RobotsRules::allow_all());
        };
        if let Some(rules) = self.cache.get(&origin).await {
            return rules;
        }
        let rules = Arc::new(fetch_rules(client, &origin, user_agent).await);
        self.cache.insert(origin, Arc::clone(&rules)).await;
        rules
    }
}

async fn fetch_rules(client: &Client, origin: &str, user_agent: &str) -> RobotsRules {
    let robots_url = format!("{origin}/robots.txt");
    let response = match client.get(&robots_url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(%origin, error = %e, "robots.txt fetch failed, allowing all");
            return RobotsRules::allow_all();
        }
    };
    if !response.status().is_success() {
        debug!(%origin, status = response.status().as_u16(), "No robots.txt");
        return RobotsRules::allow_all();
    }
    match response.text().await {
        Ok(body) => RobotsRules::parse(&body, user_agent),
        Err(e) => {
            warn!(%origin, error = %e, "robots.txt body unreadable, allowing all");
            RobotsRules::allow_all()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
User-agent: *
Disallow: /private
Crawl-delay: 2

User-agent: HarvestBot
Disallow: /internal
Crawl-delay: 0.5
";

    #[test]
    fn test_disallow_rules() {
        let rules = RobotsRules::parse(ROBOTS, "HarvestBot/0.1");
        assert!(rules.is_allowed("HarvestBot/0.1", "https://ornl.gov/technologies"));
        assert!(!rules.is_allowed("HarvestBot/0.1", "https://ornl.gov/internal/x"));
        assert!(!rules.is_allowed("OtherBot", "https://ornl.gov/private/x"));
    }

    #[test]
    fn test_agent_specific_crawl_delay_wins() {
        let rules = RobotsRules::parse(ROBOTS, "HarvestBot/0.1");
        assert_eq!(rules.crawl_delay(), Some(Duration::from_millis(500)));
        let other = RobotsRules::parse(ROBOTS, "OtherBot/1.0");
        assert_eq!(other.crawl_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_empty_allows_all() {
        let rules = RobotsRules::allow_all();
        assert!(rules.is_allowed("HarvestBot", "https://ornl.gov/anything"));
        assert!(rules.crawl_delay().is_none());
    }

    #[test]
    fn test_origin_keeps_port() {
        assert_eq!(
            origin_of("http://127.0.0.1:8080/a/b?c").as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(origin_of("https://www.nrel.gov/x").as_deref(), Some("https://www.nrel.gov"));
    }
}
