//! The transport collaborator: moves a [`WireRequest`] over HTTP and hands
//! back either a buffered body or a stream of byte chunks.
//!
//! [`Transport`] is the seam tests substitute. [`HttpTransport`] is the
//! `reqwest`-backed implementation used in production.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use tracing::{debug, trace, warn};

use crate::{DEFAULT_MAX_RESPONSE_SIZE, DEFAULT_TIMEOUT_MS};

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receives each chunk of a streaming body and decides whether to keep reading.
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> ChunkControl + Send + 'a;

// ── Wire types ─────────────────────────────────────────────────────

/// A fully encoded HTTP POST, produced by a codec.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Total timeout for buffered requests; connect and per-chunk idle
    /// timeout for streams.
    pub timeout: Duration,
    /// Largest buffered body accepted before the response is flagged oversized.
    pub max_response_size: usize,
}

impl WireRequest {
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body: body.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of a buffered request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    /// HTTP status, `0` when no response was received.
    pub status: u16,
    /// Response body, or a description of the transport failure.
    pub body: String,
    pub success: bool,
    /// The body exceeded [`WireRequest::max_response_size`] and was discarded.
    pub oversized: bool,
    /// `Retry-After` value in seconds, captured on 429 and 5xx responses.
    pub retry_after: Option<u64>,
}

impl TransportResponse {
    pub fn network_failure(detail: impl Into<String>) -> Self {
        Self {
            body: detail.into(),
            ..Default::default()
        }
    }
}

/// Result of a streaming request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// The body was read to its end, or the sink asked to stop.
    pub completed: bool,
    /// HTTP status, `0` when the connection failed or dropped mid-stream.
    pub status: u16,
    pub retry_after: Option<u64>,
    /// Error body or transport failure description when not completed.
    pub detail: String,
}

impl StreamOutcome {
    pub fn completed(status: u16) -> Self {
        Self {
            completed: true,
            status,
            ..Default::default()
        }
    }

    pub fn failed(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            ..Default::default()
        }
    }
}

/// Returned by a [`ChunkSink`] after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkControl {
    Continue,
    Stop,
}

// ── Transport trait ────────────────────────────────────────────────

/// Performs HTTP I/O for the executor.
pub trait Transport: Send + Sync {
    /// Whether the underlying network is usable. Checked before the first
    /// attempt and again after every retry backoff.
    fn is_ready(&self) -> bool {
        true
    }

    /// Send the request and buffer the whole response body.
    fn execute<'a>(&'a self, request: &'a WireRequest) -> TransportFuture<'a, TransportResponse>;

    /// Send the request and hand each body chunk to `on_chunk` until the body
    /// ends or the sink returns [`ChunkControl::Stop`].
    fn execute_stream<'a>(
        &'a self,
        request: &'a WireRequest,
        on_chunk: &'a mut ChunkSink<'a>,
    ) -> TransportFuture<'a, StreamOutcome>;
}

// ── reqwest transport ──────────────────────────────────────────────

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("microchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (custom TLS roots, proxies, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, request: &WireRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn send_buffered(&self, request: &WireRequest) -> TransportResponse {
        debug!(url = %request.url, bytes = request.body.len(), "Sending request");
        let start = Instant::now();

        let mut resp = match self.request(request).timeout(request.timeout).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Request to {} failed: {e}", request.url);
                return TransportResponse::network_failure(format!("request failed: {e}"));
            }
        };

        let status = resp.status().as_u16();
        let success = resp.status().is_success();
        let retry_after = retry_after_hint(&resp);
        let max = request.max_response_size;

        if let Some(declared) = resp.content_length()
            && declared > max as u64
        {
            warn!(status, declared, max, "Rejecting oversized response");
            return oversized(status, declared, max, retry_after);
        }

        let mut body: Vec<u8> = Vec::new();
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    body.extend_from_slice(&chunk);
                    if body.len() > max {
                        warn!(status, read = body.len(), max, "Response body exceeded limit");
                        return oversized(status, body.len() as u64, max, retry_after);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read response body: {e}");
                    return TransportResponse {
                        status: 0,
                        retry_after,
                        ..TransportResponse::network_failure(format!("failed to read response: {e}"))
                    };
                }
            }
        }

        debug!(
            "Response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            body.len()
        );

        TransportResponse {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
            success,
            oversized: false,
            retry_after,
        }
    }

    async fn send_streaming(
        &self,
        request: &WireRequest,
        on_chunk: &mut ChunkSink<'_>,
    ) -> StreamOutcome {
        debug!(url = %request.url, "Opening stream");
        let send = self
            .request(request)
            .header(ACCEPT, "text/event-stream")
            .send();

        let mut resp = match tokio::time::timeout(request.timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!("Streaming request to {} failed: {e}", request.url);
                return StreamOutcome::failed(0, format!("streaming request failed: {e}"));
            }
            Err(_) => {
                warn!("Streaming request to {} timed out", request.url);
                return StreamOutcome::failed(0, "streaming request timed out");
            }
        };

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_hint(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "Stream rejected: {text}");
            return StreamOutcome {
                retry_after,
                ..StreamOutcome::failed(status, text)
            };
        }

        let mut chunks = 0usize;
        loop {
            match tokio::time::timeout(request.timeout, resp.chunk()).await {
                Ok(Ok(Some(chunk))) => {
                    chunks += 1;
                    trace!(bytes = chunk.len(), "Stream chunk");
                    if on_chunk(&chunk) == ChunkControl::Stop {
                        debug!(chunks, "Stream stopped by consumer");
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!("Failed to read streaming chunk: {e}");
                    return StreamOutcome::failed(0, format!("failed to read streaming chunk: {e}"));
                }
                Err(_) => {
                    warn!("Stream idle for {:?}", request.timeout);
                    return StreamOutcome::failed(0, "stream idle timeout");
                }
            }
        }

        debug!(chunks, "Stream ended");
        StreamOutcome::completed(status)
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(&'a self, request: &'a WireRequest) -> TransportFuture<'a, TransportResponse> {
        Box::pin(self.send_buffered(request))
    }

    fn execute_stream<'a>(
        &'a self,
        request: &'a WireRequest,
        on_chunk: &'a mut ChunkSink<'a>,
    ) -> TransportFuture<'a, StreamOutcome> {
        Box::pin(self.send_streaming(request, on_chunk))
    }
}

fn oversized(status: u16, size: u64, max: usize, retry_after: Option<u64>) -> TransportResponse {
    TransportResponse {
        status,
        body: format!("Response too large: {size} bytes (max {max})"),
        success: false,
        oversized: true,
        retry_after,
    }
}

/// `Retry-After` in seconds, only for statuses that are worth retrying.
/// The HTTP-date form is not supported.
fn retry_after_hint(resp: &reqwest::Response) -> Option<u64> {
    let status = resp.status().as_u16();
    if !super::retry::is_retryable(status) {
        return None;
    }
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
