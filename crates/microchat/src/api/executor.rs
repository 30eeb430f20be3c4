//! Request execution: one logical request, possibly several attempts.
//!
//! [`RequestExecutor`] builds the request through its [`Codec`], sends it
//! through its [`Transport`], and retries transient failures according to its
//! [`RetryConfig`]. Backoff sleeps run on whichever task drives the executor,
//! which for async runs is the slot's background worker.
//!
//! Streaming attempts get a fresh [`StreamParser`] each time, so state from
//! a failed attempt never leaks into the next one. Fragments already handed
//! to the caller during a failed attempt are not retracted. Across retries,
//! delivery of streamed text is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::retry::{RetryConfig, classify_status, delay_for};
use super::streaming::StreamParser;
use super::transport::{ChunkControl, StreamOutcome, Transport, TransportResponse, WireRequest};
use crate::provider::Codec;
use crate::slot::CancelFlag;
use crate::{
    ChatMessage, ChatOptions, DEFAULT_MAX_RESPONSE_SIZE, DEFAULT_TIMEOUT_MS, ErrorKind,
    ExecutionResult,
};

/// Drives requests against a transport and codec pair.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    retry: RetryConfig,
    timeout: Duration,
    max_response_size: usize,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("codec", &self.codec.name())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("max_response_size", &self.max_response_size)
            .finish()
    }
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>, retry: RetryConfig) -> Self {
        Self {
            transport,
            codec,
            retry,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_response_size(mut self, max: usize) -> Self {
        self.max_response_size = max;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.codec.is_configured()
    }

    /// Single-shot request. Never panics; every failure is reported in the
    /// returned [`ExecutionResult`].
    pub async fn execute(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        cancel: &CancelFlag,
    ) -> ExecutionResult {
        let request = match self.prepare(messages, options, false, cancel) {
            Ok(request) => request,
            Err(result) => return result,
        };

        let attempts = self.retry.attempts();
        let mut attempt = 0;
        let response = loop {
            debug!(codec = self.codec.name(), "Attempt {}/{}", attempt + 1, attempts);
            let response = self.transport.execute(&request).await;
            if response.success {
                break response;
            }

            let kind = response_kind(&response);
            if attempt + 1 >= attempts || !kind.is_transient() {
                break response;
            }

            let delay = delay_for(&self.retry, attempt, response.retry_after);
            warn!(
                "Transient API error (attempt {}/{}): {kind} (HTTP {}). Retrying in {delay:?}...",
                attempt + 1,
                attempts,
                response.status,
            );
            tokio::time::sleep(delay).await;
            if let Some(result) = self.interrupted(cancel, "Request cancelled") {
                return result;
            }
            attempt += 1;
        };

        if !response.success {
            let kind = response_kind(&response);
            warn!(%kind, status = response.status, "Request failed after {} attempt(s)", attempt + 1);
            return ExecutionResult::fail(kind, failure_detail(response.status, &response.body))
                .with_status(response.status);
        }

        let result = self
            .codec
            .decode_response(&response.body)
            .with_status(response.status);
        if result.success {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                result.prompt_tokens,
                result.completion_tokens,
                result.total_tokens()
            );
        }
        result
    }

    /// Streaming request. `on_fragment` receives `(text, false)` per text
    /// fragment and `("", true)` when the stream completes.
    ///
    /// The returned result carries tool calls and token usage but no content;
    /// text only reaches the caller through `on_fragment`.
    pub async fn execute_stream<F>(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        mut on_fragment: F,
        cancel: &CancelFlag,
    ) -> ExecutionResult
    where
        F: FnMut(&str, bool) + Send,
    {
        let request = match self.prepare(messages, options, true, cancel) {
            Ok(request) => request,
            Err(result) => return result,
        };

        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            debug!(codec = self.codec.name(), "Stream attempt {}/{}", attempt + 1, attempts);

            let mut parser = StreamParser::new(self.codec.wire_format());
            parser.set_accumulate(false);
            parser.on_content(|text, done| on_fragment(text, done));

            let outcome = {
                let mut sink = |chunk: &[u8]| {
                    if cancel.is_cancelled() {
                        parser.cancel();
                        return ChunkControl::Stop;
                    }
                    parser.feed(chunk);
                    if parser.is_done() || parser.has_error() {
                        ChunkControl::Stop
                    } else {
                        ChunkControl::Continue
                    }
                };
                self.transport.execute_stream(&request, &mut sink).await
            };

            if cancel.is_cancelled() || parser.is_cancelled() {
                return ExecutionResult::fail(ErrorKind::NetworkError, "Stream cancelled")
                    .with_status(outcome.status);
            }

            if outcome.completed && !parser.has_error() {
                let mut result = ExecutionResult::ok("")
                    .with_status(outcome.status)
                    .with_usage(parser.usage());
                result.tool_calls = parser.take_tool_calls();
                debug!(
                    done = parser.is_done(),
                    tool_calls = result.tool_calls.len(),
                    "Stream finished"
                );
                return result;
            }

            let (kind, message) = stream_failure(&parser, &outcome);
            if attempt + 1 >= attempts || !kind.is_transient() {
                warn!(%kind, status = outcome.status, "Stream failed: {message}");
                return ExecutionResult::fail(kind, message).with_status(outcome.status);
            }

            let delay = delay_for(&self.retry, attempt, outcome.retry_after);
            warn!(
                "Transient stream error (attempt {}/{}): {kind}. Retrying in {delay:?}...",
                attempt + 1,
                attempts,
            );
            tokio::time::sleep(delay).await;
            if let Some(result) = self.interrupted(cancel, "Stream cancelled") {
                return result;
            }
            attempt += 1;
        }
    }

    fn prepare(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
        cancel: &CancelFlag,
    ) -> Result<WireRequest, ExecutionResult> {
        if !self.codec.is_configured() {
            return Err(ExecutionResult::fail(
                ErrorKind::NotConfigured,
                format!("{} provider is not configured", self.codec.name()),
            ));
        }
        if cancel.is_cancelled() {
            let message = if stream { "Stream cancelled" } else { "Request cancelled" };
            return Err(ExecutionResult::fail(ErrorKind::NetworkError, message));
        }
        if !self.transport.is_ready() {
            return Err(ExecutionResult::fail(ErrorKind::NetworkError, "Network not ready"));
        }

        let mut request = self
            .codec
            .build_request(messages, options, stream)
            .map_err(|e| ExecutionResult::fail(ErrorKind::InvalidRequest, e))?;
        request.timeout = self.timeout;
        request.max_response_size = self.max_response_size;
        Ok(request)
    }

    /// Checked after every backoff sleep.
    fn interrupted(&self, cancel: &CancelFlag, cancel_message: &str) -> Option<ExecutionResult> {
        if cancel.is_cancelled() {
            return Some(ExecutionResult::fail(ErrorKind::NetworkError, cancel_message));
        }
        if !self.transport.is_ready() {
            warn!("Network lost while waiting to retry");
            return Some(ExecutionResult::fail(
                ErrorKind::NetworkError,
                "Network lost during retry",
            ));
        }
        None
    }
}

fn response_kind(response: &TransportResponse) -> ErrorKind {
    if response.oversized {
        ErrorKind::ResponseTooLarge
    } else {
        classify_status(response.status)
    }
}

fn failure_detail(status: u16, body: &str) -> String {
    if body.is_empty() {
        format!("HTTP {status}")
    } else {
        body.to_string()
    }
}

fn stream_failure(parser: &StreamParser<'_>, outcome: &StreamOutcome) -> (ErrorKind, String) {
    if let Some((kind, message)) = parser.error() {
        return (kind, message.to_string());
    }
    match outcome.status {
        0 if !outcome.detail.is_empty() => (ErrorKind::NetworkError, outcome.detail.clone()),
        0 => (ErrorKind::NetworkError, "Stream failed".to_string()),
        200..=299 => (ErrorKind::StreamingError, "Stream failed".to_string()),
        status => (classify_status(status), failure_detail(status, &outcome.detail)),
    }
}
