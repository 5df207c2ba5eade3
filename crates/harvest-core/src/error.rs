use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate_limiter::RateLimitSnapshot;

/// Failure taxonomy shared by every engine, adapter and the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NetworkTimeout,
    NetworkError,
    RateLimited,
    ParseError,
    ValidationError,
    AuthenticationError,
    AuthorizationError,
    NotFound,
    ServiceError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorKind::AuthorizationError => "AUTHORIZATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ServiceError => "SERVICE_ERROR",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Returns true if a job failing with this kind is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout
                | ErrorKind::NetworkError
                | ErrorKind::RateLimited
                | ErrorKind::ServiceError
        )
    }

    /// Returns true if this kind counts as a failure for the circuit breaker.
    ///
    /// Data-quality and credential problems are per-job and say nothing about
    /// the health of the system, so they never trip the circuit.
    pub fn trips_circuit(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout
                | ErrorKind::NetworkError
                | ErrorKind::RateLimited
                | ErrorKind::ServiceError
                | ErrorKind::InternalError
        )
    }

    /// HTTP-like severity, used for logging only.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NetworkTimeout => 504,
            ErrorKind::NetworkError => 502,
            ErrorKind::RateLimited => 429,
            ErrorKind::ParseError => 422,
            ErrorKind::ValidationError => 400,
            ErrorKind::AuthenticationError => 401,
            ErrorKind::AuthorizationError => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::ServiceError => 503,
            ErrorKind::InternalError => 500,
        }
    }

    /// Canned remediation hints attached to every error of this kind.
    pub fn recovery_suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            ErrorKind::NetworkTimeout => &[
                "Increase the job timeout",
                "Check whether the institution site is slow or unreachable",
            ],
            ErrorKind::NetworkError => &[
                "Verify DNS resolution and connectivity to the host",
                "Retry later; the failure is usually transient",
            ],
            ErrorKind::RateLimited => &[
                "Lower requestsPerSecond or burstLimit for this institution",
                "Increase cooldownPeriod",
            ],
            ErrorKind::ParseError => &[
                "Check that the selectors still match the page markup",
                "Consider the render engine if the content is injected by JavaScript",
            ],
            ErrorKind::ValidationError => &[
                "Fix the job configuration or the URL",
                "Review validationRules for this institution",
            ],
            ErrorKind::AuthenticationError => &["Provide a valid API key for this institution"],
            ErrorKind::AuthorizationError => &[
                "Confirm the crawler is permitted to access this resource",
                "Check robots.txt for the target path",
            ],
            ErrorKind::NotFound => &["Update the listing URL; the page no longer exists"],
            ErrorKind::ServiceError => &["The remote service is failing; retry later"],
            ErrorKind::InternalError => &["Inspect worker logs for the underlying cause"],
        };
        hints.iter().map(|h| (*h).to_string()).collect()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable failure value produced at the point a scrape fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct ScrapeError {
    pub kind: ErrorKind,
    pub message: String,
    pub job_id: Option<String>,
    pub url: Option<String>,
    pub retry_attempt: u32,
    pub rate_limit_snapshot: Option<RateLimitSnapshot>,
    pub recovery_suggestions: Vec<String>,
}

impl ScrapeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            job_id: None,
            url: None,
            retry_attempt: 0,
            rate_limit_snapshot: None,
            recovery_suggestions: kind.recovery_suggestions(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::NetworkTimeout,
            format!("Request timed out after {} ms", after.as_millis()),
        )
    }

    /// Attach job context. Returns a new value; the original is consumed.
    pub fn for_job(mut self, job_id: &str, url: &str, retry_attempt: u32) -> Self {
        self.job_id = Some(job_id.to_string());
        self.url = Some(url.to_string());
        self.retry_attempt = retry_attempt;
        self
    }

    pub fn with_rate_limit_snapshot(mut self, snapshot: Option<RateLimitSnapshot>) -> Self {
        self.rate_limit_snapshot = snapshot;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn should_trip_circuit(&self) -> bool {
        self.kind.trips_circuit()
    }
}

/// Infrastructure errors outside a single scrape.
#[derive(Error, Debug)]
pub enum AppError {
    /// A scrape failed; carries the typed value.
    #[error(transparent)]
    Scrape(#[from] ScrapeError),

    /// Message broker operation failed.
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The component has been shut down.
    #[error("Shutting down")]
    ShuttingDown,
}
