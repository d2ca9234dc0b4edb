//! HTTP client for the auction listing API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::{Result, UpstreamError};
use super::types::{Page, UpstreamSource};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};

/// Connection settings for the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Listing endpoint, e.g. `https://api.example.com/v1/listings`.
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Query parameter carrying the page number.
    pub page_param: String,
    /// Query parameter carrying the page size.
    pub page_size_param: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/listings".to_string(),
            token: None,
            page_param: "page".to_string(),
            page_size_param: "page_size".to_string(),
        }
    }
}

/// Response envelope; the record array goes by several names in the wild.
#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(alias = "items", alias = "results")]
    data: Vec<serde_json::Value>,
    #[serde(default, alias = "hasMore")]
    has_more: Option<bool>,
    #[serde(default, alias = "total_count", alias = "totalCount")]
    total: Option<u64>,
}

/// [`UpstreamSource`] backed by the auction HTTP API.
#[derive(Clone)]
pub struct HttpAuctionSource {
    transport: Arc<dyn HttpTransport>,
    config: UpstreamConfig,
}

impl HttpAuctionSource {
    /// Create a source using reqwest with the given per-request timeout.
    #[cfg(feature = "http")]
    pub fn new(config: UpstreamConfig, timeout: Duration) -> Result<Self> {
        let transport = crate::http::reqwest_transport::ReqwestTransport::with_timeout(timeout)?;
        Ok(Self::new_with_transport(config, Arc::new(transport)))
    }

    pub fn new_with_transport(config: UpstreamConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let config = UpstreamConfig {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ..config
        };
        Self { transport, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn page_url(&self, page: u32, page_size: u32) -> String {
        let separator = if self.config.base_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}{}={}&{}={}",
            self.config.base_url,
            separator,
            self.config.page_param,
            page,
            self.config.page_size_param,
            page_size
        )
    }

    fn request(&self, url: String) -> HttpRequest {
        let request = HttpRequest::get(url).header("Accept", "application/json");
        match self.config.token.as_deref() {
            Some(token) if !token.is_empty() => {
                request.header("Authorization", format!("Bearer {token}"))
            }
            _ => request,
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Decode a page body.
///
/// Accepts either an envelope object or a bare array. When the upstream omits
/// `has_more`, a full page implies more may follow.
pub(crate) fn parse_page(body: &[u8], page: u32, page_size: u32) -> Result<Page> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| UpstreamError::decode(format!("page {page}: {e}")))?;

    let (records, has_more, total) = match value {
        serde_json::Value::Array(records) => (records, None, None),
        other => {
            let envelope: PageEnvelope = serde_json::from_value(other)
                .map_err(|e| UpstreamError::decode(format!("page {page}: {e}")))?;
            (envelope.data, envelope.has_more, envelope.total)
        }
    };

    let has_more = has_more.unwrap_or(records.len() >= page_size as usize && !records.is_empty());

    Ok(Page {
        number: page,
        records,
        has_more,
        total,
    })
}

#[async_trait]
impl UpstreamSource for HttpAuctionSource {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<Page> {
        let url = self.page_url(page, page_size);
        let response = self.transport.send(self.request(url.clone())).await?;

        if !(200..300).contains(&response.status) {
            return Err(UpstreamError::from_status(
                response.status,
                &url,
                &response.body,
                retry_after(&response),
            ));
        }

        let parsed = parse_page(&response.body, page, page_size)?;
        tracing::trace!(
            page,
            count = parsed.records.len(),
            has_more = parsed.has_more,
            "Fetched upstream page"
        );
        Ok(parsed)
    }
}
