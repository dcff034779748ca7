//! Upstream HTTP client for ingestion, probing and logo fetching.
//!
//! Wraps `reqwest` with the behavior every upstream access shares: request
//! timeouts, bounded response bodies (streamed, never buffered past the
//! limit), bounded retry with exponential backoff and jitter, and per-host
//! circuit breaking. Errors are classified into the transient/permanent
//! split the job layer keys its retry policy on.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::utils::circuit_breaker::CircuitBreakerManager;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_body_bytes: u64,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_body_bytes: 256 * 1024 * 1024,
            user_agent: concat!("tvarr/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// A fetched response body with the metadata callers care about.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub final_url: String,
}

#[derive(Clone)]
pub struct UpstreamHttpClient {
    client: reqwest::Client,
    config: HttpClientConfig,
    breakers: Arc<CircuitBreakerManager>,
}

impl UpstreamHttpClient {
    pub fn new(config: HttpClientConfig, breakers: Arc<CircuitBreakerManager>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            config,
            breakers,
        })
    }

    /// GET a URL as text, streaming up to the configured body limit.
    pub async fn get_text(&self, url: &str, cancel: &CancellationToken) -> AppResult<String> {
        let body = self.get_bytes(url, cancel).await?;
        String::from_utf8(body.bytes.to_vec()).map_err(|_| {
            AppError::upstream_permanent(host_of(url), "response body is not valid UTF-8")
        })
    }

    /// GET a URL as bytes with retry, backoff and circuit breaking.
    pub async fn get_bytes(&self, url: &str, cancel: &CancellationToken) -> AppResult<FetchedBody> {
        let host = host_of(url);
        let breaker = self.breakers.for_host(&host);

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if !breaker.allow_request() {
                return Err(AppError::CircuitOpen { host });
            }

            match self.fetch_once(url, cancel).await {
                Ok(body) => {
                    breaker.record_success();
                    return Ok(body);
                }
                Err(err @ AppError::Cancelled) => return Err(err),
                Err(err @ AppError::UpstreamPermanent { .. }) => {
                    breaker.record_failure();
                    return Err(err);
                }
                Err(err) => {
                    breaker.record_failure();
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(err);
                    }
                    let backoff = self.backoff_with_jitter(attempt);
                    warn!(
                        url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "upstream request failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    }
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str, cancel: &CancellationToken) -> AppResult<FetchedBody> {
        let host = host_of(url);

        let send = self.client.get(url).send();
        let response = tokio::select! {
            r = send => r.map_err(|e| classify_reqwest(&host, e))?,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(&host, status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let final_url = response.url().to_string();

        let mut buffer = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = tokio::select! {
            c = stream.next() => c,
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
        } {
            let chunk = chunk.map_err(|e| classify_reqwest(&host, e))?;
            if buffer.len() as u64 + chunk.len() as u64 > self.config.max_body_bytes {
                return Err(AppError::upstream_permanent(
                    &host,
                    format!("response exceeds {} byte limit", self.config.max_body_bytes),
                ));
            }
            buffer.extend_from_slice(&chunk);
        }

        debug!(url, bytes = buffer.len(), "fetched upstream body");
        Ok(FetchedBody {
            bytes: buffer.freeze(),
            content_type,
            etag,
            final_url,
        })
    }

    /// Open a streaming GET without buffering; callers consume the byte
    /// stream directly (relay upstream pulls, proxy passthrough).
    pub async fn get_stream(&self, url: &str) -> AppResult<reqwest::Response> {
        let host = host_of(url);
        let breaker = self.breakers.for_host(&host);
        if !breaker.allow_request() {
            return Err(AppError::CircuitOpen { host });
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&host, e))?;
        let status = response.status();
        if !status.is_success() {
            breaker.record_failure();
            return Err(classify_status(&host, status));
        }
        breaker.record_success();
        Ok(response)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(10));
        let jitter = rand::rng().random_range(0..=exp / 4 + 1);
        Duration::from_millis(exp + jitter)
    }
}

pub fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn classify_status(host: &str, status: StatusCode) -> AppError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AppError::upstream_transient(host, format!("http status {status}"))
    } else {
        AppError::upstream_permanent(host, format!("http status {status}"))
    }
}

fn classify_reqwest(host: &str, err: reqwest::Error) -> AppError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AppError::upstream_transient(host, err.to_string())
    } else if err.is_decode() {
        AppError::upstream_permanent(host, err.to_string())
    } else {
        AppError::upstream_transient(host, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("http://example.com:8080/a/b"), "example.com");
        assert_eq!(host_of("not a url"), "unknown");
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(classify_status("h", StatusCode::BAD_GATEWAY).is_retryable());
        assert!(classify_status("h", StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!classify_status("h", StatusCode::NOT_FOUND).is_retryable());
        assert!(!classify_status("h", StatusCode::UNAUTHORIZED).is_retryable());
    }
}
