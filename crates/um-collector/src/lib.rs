//! HTTP client for the remote usage collector.
//!
//! Delivers delta batches to the collector's bulk endpoint:
//!
//! ```text
//! POST {collector_url}/log_usage_bulk
//! Authorization: Bearer <api key>
//! {"user_id": "u1", "entries": [{"site": "example.com", "duration": 15}]}
//! ```
//!
//! A batch counts as delivered only when the collector answers 2xx with
//! `{"status": "ok"}`. Everything else, including an unparseable body, is a
//! failure and the batch is retried on the next flush.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use um_core::{Batch, Transport, UserId};

/// Default request timeout for collector calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const BULK_PATH: &str = "log_usage_bulk";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Collector client errors.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The provided API key was invalid.
    #[error("invalid API key: {reason}")]
    InvalidApiKey { reason: &'static str },
    /// The collector URL could not be used.
    #[error("invalid collector URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Collector returned a non-success status.
    #[error("collector returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// Collector answered, but not with an acknowledgement.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Remote collector client.
///
/// # Thread Safety
///
/// The client is safe to clone and share across threads. Each clone shares
/// the underlying HTTP connection pool.
#[derive(Clone)]
pub struct CollectorClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    user_id: UserId,
}

impl fmt::Debug for CollectorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("user_id", &self.user_id)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl CollectorClient {
    /// Creates a client for the collector at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is empty or whitespace-only, if the
    /// URL is not an absolute http(s) URL, or if the HTTP client fails to build.
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        user_id: UserId,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let api_key = api_key.into();

        if api_key.is_empty() {
            return Err(CollectorError::InvalidApiKey {
                reason: "API key cannot be empty",
            });
        }
        if api_key.trim().is_empty() {
            return Err(CollectorError::InvalidApiKey {
                reason: "API key cannot be whitespace-only",
            });
        }

        let endpoint = bulk_endpoint(base_url)?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CollectorError::ClientBuild)?;

        Ok(Self {
            http,
            endpoint,
            api_key,
            user_id,
        })
    }

    /// The bulk usage endpoint requests are sent to.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Sends every entry of `batch` in one request.
    pub async fn log_usage_bulk(&self, batch: &Batch) -> Result<(), CollectorError> {
        let request = build_request(&self.user_id, batch);
        tracing::debug!(
            endpoint = %self.endpoint,
            batch = %batch.id,
            entries = request.entries.len(),
            "posting usage batch"
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .header(REQUEST_ID_HEADER, batch.id.to_string())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CollectorError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }
        parse_acknowledgement(&body, request.entries.len())
    }
}

impl Transport for CollectorClient {
    type Error = CollectorError;

    async fn send(&self, batch: &Batch) -> Result<(), CollectorError> {
        self.log_usage_bulk(batch).await
    }
}

#[derive(Debug, Serialize)]
struct BulkUsageRequest<'a> {
    user_id: &'a str,
    entries: Vec<BulkUsageEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct BulkUsageEntry<'a> {
    site: &'a str,
    duration: u64,
}

#[derive(Debug, Deserialize)]
struct BulkUsageResponse {
    status: String,
    #[serde(default)]
    count: Option<usize>,
}

fn bulk_endpoint(base_url: &str) -> Result<Url, CollectorError> {
    let invalid = |reason: String| CollectorError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };
    let trimmed = base_url.trim().trim_end_matches('/');
    let url = Url::parse(&format!("{trimmed}/{BULK_PATH}")).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

fn build_request<'a>(user_id: &'a UserId, batch: &'a Batch) -> BulkUsageRequest<'a> {
    BulkUsageRequest {
        user_id: user_id.as_str(),
        entries: batch
            .entries
            .iter()
            .map(|entry| BulkUsageEntry {
                site: entry.key.as_str(),
                duration: entry.seconds,
            })
            .collect(),
    }
}

fn parse_acknowledgement(body: &str, sent: usize) -> Result<(), CollectorError> {
    let payload: BulkUsageResponse = serde_json::from_str(body)
        .map_err(|err| CollectorError::InvalidResponse(err.to_string()))?;
    if payload.status != "ok" {
        return Err(CollectorError::InvalidResponse(format!(
            "unexpected status {:?}",
            payload.status
        )));
    }
    match payload.count {
        Some(count) if count != sent => Err(CollectorError::InvalidResponse(format!(
            "collector accepted {count} of {sent} entries"
        ))),
        _ => Ok(()),
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
