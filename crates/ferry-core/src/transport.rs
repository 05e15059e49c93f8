//! Transport seam - how a transfer reaches the network
//!
//! The engine only needs `fetch`: send a GET (optionally ranged) and hand
//! back the status, headers and a body stream. `ReqwestTransport` is the
//! default implementation; the fallback path uses a second instance that
//! never reuses pooled connections.

use crate::error::FerryError;
use bytes::Bytes;
use ferry_types::EngineConfig;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Body of a response, read chunk by chunk
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A single GET request
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: HeaderMap,
    /// Ask for bytes from this offset onward (`Range: bytes=N-`)
    pub range_start: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            range_start: None,
        }
    }

    pub fn with_range_start(mut self, offset: u64) -> Self {
        self.range_start = Some(offset);
        self
    }

    /// Adds headers from configuration, skipping names or values that are not valid HTTP
    pub fn with_extra_headers<'a>(mut self, extra: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (name, value) in extra {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    self.headers.insert(name, value);
                }
                _ => warn!("Ignoring invalid header {}: {}", name, value),
            }
        }
        self
    }

    /// Value of the `Range` header this request carries, if any
    pub fn range_header(&self) -> Option<String> {
        self.range_start.map(|start| format!("bytes={}-", start))
    }
}

/// Response head plus body
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl FetchResponse {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        self.headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentRange::parse)
    }

    pub fn has_content_range(&self) -> bool {
        self.headers.contains_key(CONTENT_RANGE)
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Parsed `Content-Range: bytes start-end/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*`
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

/// Something that can perform a fetch
pub trait Transport: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<FetchResponse, FerryError>>;
}

/// HTTP transport backed by reqwest
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Pooled client used for the primary path
    pub fn new(config: &EngineConfig) -> Result<Self, FerryError> {
        let client = Self::builder(config).build()?;
        Ok(Self { client })
    }

    /// Client that opens a new connection for every request, used when a
    /// stream on the primary path was closed underneath us
    pub fn fresh_connections(config: &EngineConfig) -> Result<Self, FerryError> {
        let client = Self::builder(config).pool_max_idle_per_host(0).build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn builder(config: &EngineConfig) -> reqwest::ClientBuilder {
        Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
    }
}

impl Transport for ReqwestTransport {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, Result<FetchResponse, FerryError>> {
        Box::pin(async move {
            let mut builder = self.client.get(&request.url).headers(request.headers.clone());
            if let Some(range) = request.range_header() {
                debug!("Requesting {} with range {}", request.url, range);
                builder = builder.header(RANGE, range);
            }

            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes_stream().map_err(body_error).boxed();

            Ok(FetchResponse { status, headers, body })
        })
    }
}

/// Body errors surface as I/O errors so the copy loop can classify them
fn body_error(err: reqwest::Error) -> std::io::Error {
    let kind = if err.is_timeout() {
        std::io::ErrorKind::TimedOut
    } else {
        std::io::ErrorKind::ConnectionAborted
    };
    std::io::Error::new(kind, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_range() {
        assert_eq!(
            ContentRange::parse("bytes 400-999/1000"),
            Some(ContentRange { start: 400, end: 999, total: Some(1000) })
        );
        assert_eq!(
            ContentRange::parse("bytes 0-10/*"),
            Some(ContentRange { start: 0, end: 10, total: None })
        );
        assert_eq!(ContentRange::parse("bytes */1000"), None);
        assert_eq!(ContentRange::parse("items 0-1/2"), None);
    }

    #[test]
    fn range_header_is_open_ended() {
        let request = FetchRequest::new("http://example.com/f").with_range_start(400);
        assert_eq!(request.range_header().as_deref(), Some("bytes=400-"));
        assert_eq!(FetchRequest::new("http://example.com/f").range_header(), None);
    }

    #[test]
    fn invalid_extra_headers_are_skipped() {
        let mut extra = std::collections::HashMap::new();
        extra.insert("x-token".to_string(), "abc".to_string());
        extra.insert("bad header".to_string(), "v".to_string());
        let request = FetchRequest::new("http://example.com/f").with_extra_headers(&extra);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.headers.get("x-token").unwrap(), "abc");
    }
}
