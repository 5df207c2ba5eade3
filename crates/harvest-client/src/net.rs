use std::collections::BTreeMap;
use std::error::Error as _;
use std::net::IpAddr;
use std::time::Duration;

use harvest_core::classify::{ErrorClassifier, RawFailure};
use harvest_core::config::EngineConfig;
use harvest_core::error::ScrapeError;
use reqwest::Client;
use reqwest::redirect::Policy;
use tokio::time::Instant;
use url::Url;

/// One HTTP response body, already checked for a success status.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub duration: Duration,
}

impl FetchedPage {
    pub fn bytes(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Build the shared reqwest client for an engine.
pub fn build_client(config: &EngineConfig) -> Result<Client, ScrapeError> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(config.timeout)
        .redirect(Policy::limited(config.max_redirects))
        .build()
        .map_err(|e| ScrapeError::internal(format!("Failed to build HTTP client: {e}")))
}

/// GET `url` with the job's headers and timeout.
///
/// Unless `config.allow_private_urls` is set, the target must resolve to a
/// public address. Non-2xx statuses come back classified.
pub async fn fetch_page(
    client: &Client,
    config: &EngineConfig,
    url: &str,
    headers: &BTreeMap<String, String>,
    user_agent: Option<&str>,
    timeout: Duration,
) -> Result<FetchedPage, ScrapeError> {
    if !config.allow_private_urls {
        validate_url(url).await?;
    }

    let started = Instant::now();
    let mut request = client.get(url).timeout(timeout);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(ua) = user_agent {
        request = request.header(reqwest::header::USER_AGENT, ua);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ErrorClassifier::to_error(failure_from_reqwest(&e)))?;

    let status = response.status();
    let final_url = response.url().to_string();
    if !status.is_success() {
        let e = ErrorClassifier::to_error(RawFailure::HttpStatus(status.as_u16()));
        return Err(ScrapeError {
            message: format!("HTTP {} for {url}", status.as_u16()),
            ..e
        });
    }

    let body = response
        .text()
        .await
        .map_err(|e| ErrorClassifier::to_error(failure_from_reqwest(&e)))?;

    Ok(FetchedPage {
        url: url.to_string(),
        final_url,
        status: status.as_u16(),
        body,
        duration: started.elapsed(),
    })
}

/// Describe a reqwest failure for the classifier.
pub fn failure_from_reqwest(e: &reqwest::Error) -> RawFailure {
    let chain = error_chain(e);
    if e.is_timeout() {
        RawFailure::Timeout
    } else if let Some(status) = e.status() {
        RawFailure::HttpStatus(status.as_u16())
    } else if e.is_connect() {
        let lowered = chain.to_ascii_lowercase();
        if lowered.contains("dns") || lowered.contains("resolve") {
            RawFailure::Dns(chain)
        } else {
            RawFailure::Connect(chain)
        }
    } else if e.is_redirect() {
        RawFailure::Validation(format!("Redirect limit exceeded: {chain}"))
    } else if e.is_decode() || e.is_body() {
        RawFailure::Decode(chain)
    } else if e.is_builder() {
        RawFailure::Validation(format!("Invalid request: {chain}"))
    } else {
        RawFailure::Other(chain)
    }
}

fn error_chain(e: &reqwest::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
pub async fn validate_url(url: &str) -> Result<(), ScrapeError> {
    let parsed = Url::parse(url)
        .map_err(|e| RawFailure::Validation(format!("Invalid URL '{url}': {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RawFailure::Validation(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            ))
            .into());
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| RawFailure::Validation("URL has no host".to_string()))?;

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(RawFailure::Forbidden(format!(
                "SSRF blocked: {host} is a private/reserved IP"
            ))
            .into());
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RawFailure::Dns(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(RawFailure::Dns(format!("DNS resolution returned no addresses for {host}")).into());
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(RawFailure::Forbidden(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        ))
        .into());
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254.0.0/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xFFC0) == 0xFE80 // fe80::/10
                || (v6.segments()[0] & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use harvest_core::error::ErrorKind;

    use super::*;

    #[test]
    fn test_private_ranges() {
        for ip in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fc00::1",
            "::ffff:169.254.169.254",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip} should be private");
        }
    }

    #[test]
    fn test_public_ranges() {
        for ip in ["8.8.8.8", "1.1.1.1", "2001:4860:4860::8888"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[tokio::test]
    async fn test_private_target_is_authorization_error() {
        let err = validate_url("http://127.0.0.1/admin").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthorizationError);
        assert!(err.message.contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_bad_scheme_is_validation_error() {
        let err = validate_url("file:///etc/passwd").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_non_success_status_is_classified() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::any())
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = EngineConfig {
            allow_private_urls: true,
            ..Default::default()
        };
        let client = build_client(&config).unwrap();
        let err = fetch_page(
            &client,
            &config,
            &server.uri(),
            &BTreeMap::new(),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceError);
        assert!(err.message.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::any())
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let config = EngineConfig {
            allow_private_urls: true,
            ..Default::default()
        };
        let client = build_client(&config).unwrap();
        let err = fetch_page(
            &client,
            &config,
            &server.uri(),
            &BTreeMap::new(),
            None,
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkTimeout);
    }
}
