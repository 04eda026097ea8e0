use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Exponential backoff settings for origin fetch retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based):
    /// `min(initial * multiplier^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }
}

/// Headers learned from an origin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub content_type: Option<String>,
    pub total_length: Option<i64>,
    pub supports_range: bool,
    /// Offset at which the body's first byte lands in the resource.
    pub body_offset: i64,
}

/// A streaming origin response: learned headers plus the body chunks.
pub struct OriginResponse {
    pub meta: ResponseMeta,
    pub body: BoxStream<'static, Result<Vec<u8>>>,
}

/// The remote side of a fetch. Cut as a trait so tests can script origins
/// without a network.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Issue a GET for `url`, optionally with `Range: bytes=start-[end]`.
    async fn fetch(&self, url: &Url, range: Option<(i64, Option<i64>)>) -> Result<OriginResponse>;
}

/// Production origin backed by `reqwest`.
pub struct HttpOrigin {
    client: Client,
}

impl HttpOrigin {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.custom_http_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CacheError::Config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CacheError::Config(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| CacheError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, url: &Url, range: Option<(i64, Option<i64>)>) -> Result<OriginResponse> {
        let mut request = self.client.get(url.clone());
        if let Some((start, end)) = range {
            let header = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            debug!("GET {url} Range: {header}");
            request = request.header("Range", header);
        } else {
            debug!("GET {url}");
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus(status.as_u16()));
        }

        let headers = response.headers();
        let content_type = headers
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let accepts_ranges = headers
            .get("Accept-Ranges")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        let partial = status.as_u16() == 206;

        let (body_offset, total_length) = if partial {
            let content_range = headers
                .get("Content-Range")
                .and_then(|v| v.to_str().ok())
                .map(parse_content_range)
                .unwrap_or((None, None));
            (
                content_range
                    .0
                    .or(range.map(|(start, _)| start))
                    .unwrap_or(0),
                content_range.1,
            )
        } else {
            (0, response.content_length().map(|len| len as i64))
        };

        let meta = ResponseMeta {
            content_type,
            total_length,
            supports_range: partial || accepts_ranges,
            body_offset,
        };

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(CacheError::from)
            })
            .boxed();

        Ok(OriginResponse { meta, body })
    }
}

/// Parse `Content-Range: bytes A-B/T` into `(offset, total)`.
/// `bytes */T` yields the total only; unknown totals (`/*`) yield neither.
fn parse_content_range(value: &str) -> (Option<i64>, Option<i64>) {
    let Some(rest) = value.trim().strip_prefix("bytes ") else {
        return (None, None);
    };
    let Some((span, total)) = rest.split_once('/') else {
        return (None, None);
    };
    let total = total.trim().parse::<i64>().ok().filter(|t| *t >= 0);
    let offset = span
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse::<i64>().ok())
        .filter(|o| *o >= 0);
    (offset, total)
}
