//! Mapping backend-specific failures onto [`ErrorKind`].
//!
//! Engines describe what went wrong as a [`RawFailure`] (they know whether
//! reqwest timed out or the browser target crashed); the classifier owns the
//! single decision of which kind that is.

use std::fmt;

use crate::error::{ErrorKind, ScrapeError};

/// Backend-neutral description of a failure, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// The call did not finish within its deadline.
    Timeout,
    /// Host name could not be resolved.
    Dns(String),
    /// TCP/TLS connection could not be established or was reset.
    Connect(String),
    /// The server answered with a non-success status.
    HttpStatus(u16),
    /// The headless browser or one of its targets died.
    BrowserCrash(String),
    /// A selector matched nothing.
    SelectorMissing(String),
    /// The body could not be decoded or parsed.
    Decode(String),
    /// The job or its data failed a precondition.
    Validation(String),
    /// A required credential is absent.
    MissingCredential(String),
    /// Access refused by policy (robots.txt, allow-list).
    Forbidden(String),
    /// Anything else, classified from its text.
    Other(String),
}

impl fmt::Display for RawFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawFailure::Timeout => write!(f, "request timed out"),
            RawFailure::Dns(m) => write!(f, "DNS resolution failed: {m}"),
            RawFailure::Connect(m) => write!(f, "connection failed: {m}"),
            RawFailure::HttpStatus(code) => write!(f, "HTTP {code}"),
            RawFailure::BrowserCrash(m) => write!(f, "browser failure: {m}"),
            RawFailure::SelectorMissing(sel) => write!(f, "selector '{sel}' matched no elements"),
            RawFailure::Decode(m) => write!(f, "could not decode response: {m}"),
            RawFailure::Validation(m) => write!(f, "{m}"),
            RawFailure::MissingCredential(m) => write!(f, "missing credential: {m}"),
            RawFailure::Forbidden(m) => write!(f, "access denied: {m}"),
            RawFailure::Other(m) => write!(f, "{m}"),
        }
    }
}

/// Stateless classifier from [`RawFailure`] to [`ErrorKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(failure: &RawFailure) -> ErrorKind {
        match failure {
            RawFailure::Timeout => ErrorKind::NetworkTimeout,
            RawFailure::Dns(_) | RawFailure::Connect(_) => ErrorKind::NetworkError,
            RawFailure::HttpStatus(code) => Self::classify_status(*code),
            RawFailure::BrowserCrash(msg) => match Self::classify_message(msg) {
                ErrorKind::InternalError => ErrorKind::ServiceError,
                kind => kind,
            },
            // Terminal: the same markup fails the same way on every retry.
            RawFailure::SelectorMissing(_) | RawFailure::Decode(_) => ErrorKind::ParseError,
            RawFailure::Validation(_) => ErrorKind::ValidationError,
            RawFailure::MissingCredential(_) => ErrorKind::AuthenticationError,
            RawFailure::Forbidden(_) => ErrorKind::AuthorizationError,
            RawFailure::Other(msg) => Self::classify_message(msg),
        }
    }

    pub fn classify_status(code: u16) -> ErrorKind {
        match code {
            401 => ErrorKind::AuthenticationError,
            403 => ErrorKind::AuthorizationError,
            404 | 410 => ErrorKind::NotFound,
            408 => ErrorKind::NetworkTimeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServiceError,
            400..=499 => ErrorKind::ValidationError,
            _ => ErrorKind::InternalError,
        }
    }

    /// Best-effort classification of free-form backend text.
    pub fn classify_message(message: &str) -> ErrorKind {
        let msg = message.to_ascii_lowercase();
        if msg.contains("timed out") || msg.contains("timeout") || msg.contains("deadline") {
            ErrorKind::NetworkTimeout
        } else if msg.contains("429") || msg.contains("too many requests") || msg.contains("rate limit")
        {
            ErrorKind::RateLimited
        } else if msg.contains("err_name_not_resolved")
            || msg.contains("dns")
            || msg.contains("connection refused")
            || msg.contains("connection reset")
            || msg.contains("err_connection")
            || msg.contains("err_internet_disconnected")
            || msg.contains("connect")
        {
            ErrorKind::NetworkError
        } else if msg.contains("target closed")
            || msg.contains("browser closed")
            || msg.contains("crash")
            || msg.contains("websocket")
        {
            ErrorKind::ServiceError
        } else if msg.contains("unauthorized") || msg.contains("api key") {
            ErrorKind::AuthenticationError
        } else if msg.contains("forbidden") || msg.contains("disallowed") {
            ErrorKind::AuthorizationError
        } else if msg.contains("not found") || msg.contains("404") {
            ErrorKind::NotFound
        } else {
            ErrorKind::InternalError
        }
    }

    /// Classify and wrap in a [`ScrapeError`].
    pub fn to_error(failure: RawFailure) -> ScrapeError {
        let kind = Self::classify(&failure);
        ScrapeError::new(kind, failure.to_string())
    }
}

impl From<RawFailure> for ScrapeError {
    fn from(failure: RawFailure) -> Self {
        ErrorClassifier::to_error(failure)
    }
}
