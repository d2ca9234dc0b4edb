use std::time::Duration;

use thiserror::Error;

use crate::http::HttpError;

/// Errors that can occur when fetching pages from the upstream auction API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// DNS or connect failure: the endpoint is not reachable at all.
    #[error("Upstream unreachable: {message}")]
    Unreachable { message: String },

    /// The API root or listing endpoint returned 404 (typically a bad deployment).
    #[error("Upstream endpoint not found: {url}")]
    NotFound { url: String },

    /// Credentials rejected.
    #[error("Upstream rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// HTTP 429.
    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("Upstream server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// No response within the per-request timeout.
    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    /// Connection reset, truncated body and similar mid-flight failures.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Any other non-success status.
    #[error("Unexpected upstream response (HTTP {status}): {message}")]
    Status { status: u16, message: String },

    /// The page body could not be decoded.
    #[error("Malformed upstream payload: {message}")]
    Decode { message: String },

    /// The fetch task itself panicked or was cancelled.
    #[error("Fetch worker failed: {message}")]
    Worker { message: String },
}

/// Longest error body excerpt kept in messages.
const BODY_EXCERPT_LEN: usize = 200;

impl UpstreamError {
    /// Create a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Whether the upstream answered 404.
    ///
    /// On the first page this means a bad base URL or deployment. Some APIs
    /// also answer 404 for pages past the end, so the coordinator treats a 404
    /// after earlier pages as an empty page.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, url: &str, body: &[u8], retry_after: Option<Duration>) -> Self {
        let message: String = String::from_utf8_lossy(body)
            .chars()
            .take(BODY_EXCERPT_LEN)
            .collect();

        match status {
            401 | 403 => Self::Unauthorized { status },
            404 => Self::NotFound {
                url: url.to_string(),
            },
            408 => Self::Timeout {
                after: Duration::ZERO,
            },
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Server { status, message },
            _ => Self::Status { status, message },
        }
    }
}

impl From<HttpError> for UpstreamError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Connect(message) => Self::Unreachable { message },
            HttpError::Timeout(_) => Self::Timeout {
                after: Duration::ZERO,
            },
            HttpError::Transport(message) => Self::Transport { message },
            HttpError::NoMockResponse { url } => Self::Unreachable {
                message: format!("no route for {url}"),
            },
        }
    }
}

/// Result type for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;
