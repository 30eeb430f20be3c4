//! [`ChatClient`]: the convenience façade most callers use.
//!
//! Bundles a [`RequestExecutor`] for the configured provider with an
//! [`ExecutionSlot`] for background runs, validates input, and remembers the
//! outcome of the most recent request.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::api::executor::RequestExecutor;
use crate::api::transport::{HttpTransport, Transport};
use crate::config::ClientConfig;
use crate::slot::{AsyncStatus, CancelFlag, ExecutionSlot};
use crate::{ChatMessage, ChatOptions, ErrorKind, ExecutionResult};

#[derive(Debug, Default)]
struct LastOutcome {
    error: Option<ErrorKind>,
    message: String,
    http_status: u16,
}

impl LastOutcome {
    fn record(cell: &Mutex<LastOutcome>, result: &ExecutionResult) {
        let mut last = cell.lock().unwrap_or_else(|e| e.into_inner());
        last.error = result.error;
        last.message = result.error_message.clone();
        last.http_status = result.http_status;
    }
}

/// Chat client for one configured provider.
#[derive(Debug)]
pub struct ChatClient {
    config: ClientConfig,
    executor: RequestExecutor,
    slot: ExecutionSlot,
    last: Arc<Mutex<LastOutcome>>,
}

impl ChatClient {
    /// Build a client that talks HTTP through `reqwest`.
    pub fn new(config: ClientConfig) -> Result<Self, String> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Build a client over a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let codec = config.provider.codec(
            &config.api_key,
            &config.model,
            config.base_url.as_deref(),
        );
        let executor = RequestExecutor::new(transport, codec, config.retry.clone())
            .with_timeout(config.timeout)
            .with_max_response_size(config.max_response_size);
        let slot = ExecutionSlot::new(config.slot.clone());
        debug!(
            provider = %config.provider,
            model = config.effective_model(),
            "Chat client created"
        );
        Self {
            config,
            executor,
            slot,
            last: Arc::new(Mutex::new(LastOutcome::default())),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.executor.is_configured()
    }

    // ── Blocking-style (awaited) requests ──

    /// Send a single user message.
    pub async fn chat(&self, message: &str, options: &ChatOptions) -> ExecutionResult {
        if let Err(result) = self.validate_message(message) {
            return result;
        }
        self.chat_messages(&[ChatMessage::user(message)], options)
            .await
    }

    /// Send a full conversation.
    pub async fn chat_messages(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> ExecutionResult {
        if let Err(result) = self.validate_messages(messages) {
            return result;
        }
        let result = self
            .executor
            .execute(messages, options, &CancelFlag::new())
            .await;
        LastOutcome::record(&self.last, &result);
        result
    }

    /// Stream a single user message. Fragments go to `on_fragment`; the
    /// returned result carries usage and tool calls.
    pub async fn chat_stream<F>(
        &self,
        message: &str,
        options: &ChatOptions,
        on_fragment: F,
    ) -> ExecutionResult
    where
        F: FnMut(&str, bool) + Send,
    {
        if let Err(result) = self.validate_message(message) {
            return result;
        }
        self.chat_stream_messages(&[ChatMessage::user(message)], options, on_fragment)
            .await
    }

    pub async fn chat_stream_messages<F>(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        on_fragment: F,
    ) -> ExecutionResult
    where
        F: FnMut(&str, bool) + Send,
    {
        if let Err(result) = self.validate_messages(messages) {
            return result;
        }
        let result = self
            .executor
            .execute_stream(messages, options, on_fragment, &CancelFlag::new())
            .await;
        LastOutcome::record(&self.last, &result);
        result
    }

    // ── Background requests ──

    /// Start a request on the background slot. Returns `false` when the
    /// input is invalid or a run is already in flight; `on_complete` fires
    /// from [`poll_async`](Self::poll_async).
    pub fn chat_async(
        &mut self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
        on_complete: impl FnOnce(&ExecutionResult) + Send + 'static,
    ) -> bool {
        if self.validate_messages(&messages).is_err() {
            return false;
        }
        let executor = self.executor.clone();
        let last = Arc::clone(&self.last);
        self.slot.launch(
            move |cancel| async move { executor.execute(&messages, &options, &cancel).await },
            move |result| {
                LastOutcome::record(&last, result);
                on_complete(result);
            },
        )
    }

    /// Start a streaming request on the background slot. Fragments are
    /// delivered on the worker thread; `on_done` fires from
    /// [`poll_async`](Self::poll_async).
    pub fn chat_stream_async(
        &mut self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
        on_fragment: impl FnMut(&str, bool) + Send + 'static,
        on_done: impl FnOnce(&ExecutionResult) + Send + 'static,
    ) -> bool {
        if self.validate_messages(&messages).is_err() {
            return false;
        }
        let executor = self.executor.clone();
        let last = Arc::clone(&self.last);
        self.slot.launch_stream(
            move |forward, cancel| async move {
                executor
                    .execute_stream(&messages, &options, forward, &cancel)
                    .await
            },
            on_fragment,
            move |result| {
                LastOutcome::record(&last, result);
                on_done(result);
            },
        )
    }

    /// Deliver the completion callback of a finished background run.
    pub fn poll_async(&self) -> bool {
        self.slot.poll()
    }

    pub fn cancel_async(&self) {
        self.slot.cancel();
    }

    pub fn is_async_busy(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn async_status(&self) -> AsyncStatus {
        self.slot.status()
    }

    pub fn async_result(&self) -> ExecutionResult {
        self.slot.result()
    }

    // ── Last outcome ──

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).error
    }

    pub fn last_error_message(&self) -> String {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .message
            .clone()
    }

    pub fn last_http_status(&self) -> u16 {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).http_status
    }

    /// Forget the last error and status.
    pub fn reset(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = LastOutcome::default();
    }

    fn validate_message(&self, message: &str) -> Result<(), ExecutionResult> {
        if message.is_empty() {
            return Err(self.reject(ErrorKind::InvalidRequest, "Message cannot be empty"));
        }
        Ok(())
    }

    fn validate_messages(&self, messages: &[ChatMessage]) -> Result<(), ExecutionResult> {
        if !self.is_configured() {
            let message = format!("{} provider is not configured", self.executor.codec().name());
            return Err(self.reject(ErrorKind::NotConfigured, message));
        }
        if messages.is_empty() {
            return Err(self.reject(ErrorKind::InvalidRequest, "No messages to send"));
        }
        Ok(())
    }

    fn reject(&self, kind: ErrorKind, message: impl Into<String>) -> ExecutionResult {
        let result = ExecutionResult::fail(kind, message);
        LastOutcome::record(&self.last, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::{
        ChunkControl, ChunkSink, StreamOutcome, TransportFuture, TransportResponse, WireRequest,
    };
    use crate::provider::Provider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Answers every request with the same canned body or SSE chunks.
    struct CannedTransport {
        status: u16,
        body: String,
        chunks: Vec<String>,
        calls: AtomicUsize,
    }

    impl CannedTransport {
        fn json(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_string(),
                chunks: Vec::new(),
                calls: AtomicUsize::new(0),
            })
        }

        fn sse(chunks: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                status: 200,
                body: String::new(),
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Transport for CannedTransport {
        fn execute<'a>(
            &'a self,
            _request: &'a WireRequest,
        ) -> TransportFuture<'a, TransportResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                TransportResponse {
                    status: self.status,
                    body: self.body.clone(),
                    success: (200..300).contains(&self.status),
                    ..Default::default()
                }
            })
        }

        fn execute_stream<'a>(
            &'a self,
            _request: &'a WireRequest,
            on_chunk: &'a mut ChunkSink<'a>,
        ) -> TransportFuture<'a, StreamOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                for chunk in &self.chunks {
                    if on_chunk(chunk.as_bytes()) == ChunkControl::Stop {
                        break;
                    }
                }
                StreamOutcome::completed(self.status)
            })
        }
    }

    const OPENAI_OK: &str = r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}],
        "usage":{"prompt_tokens":3,"completion_tokens":2}}"#;

    fn client(transport: Arc<CannedTransport>) -> ChatClient {
        ChatClient::with_transport(ClientConfig::new(Provider::OpenAi, "sk-test"), transport)
    }

    fn poll_until_done(client: &ChatClient) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !client.poll_async() {
            assert!(Instant::now() < deadline, "background run did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn chat_success_records_status() {
        let transport = CannedTransport::json(200, OPENAI_OK);
        let client = client(transport.clone());
        let result = client.chat("Hello", &ChatOptions::default()).await;
        assert!(result.success);
        assert_eq!(result.content, "Hi there");
        assert_eq!(result.total_tokens(), 5);
        assert_eq!(client.last_http_status(), 200);
        assert_eq!(client.last_error(), None);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_without_io() {
        let transport = CannedTransport::json(200, OPENAI_OK);
        let client = client(transport.clone());
        let result = client.chat("", &ChatOptions::default()).await;
        assert_eq!(result.error, Some(ErrorKind::InvalidRequest));
        assert_eq!(client.last_error(), Some(ErrorKind::InvalidRequest));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        client.reset();
        assert_eq!(client.last_error(), None);
        assert!(client.last_error_message().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_client() {
        let transport = CannedTransport::json(200, OPENAI_OK);
        let client = ChatClient::with_transport(
            ClientConfig::new(Provider::Anthropic, ""),
            transport.clone(),
        );
        assert!(!client.is_configured());
        let result = client.chat("Hello", &ChatOptions::default()).await;
        assert_eq!(result.error, Some(ErrorKind::NotConfigured));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn http_error_is_remembered() {
        let client = client(CannedTransport::json(401, r#"{"error":"bad key"}"#));
        let result = client.chat("Hello", &ChatOptions::default()).await;
        assert_eq!(result.error, Some(ErrorKind::AuthError));
        assert_eq!(client.last_http_status(), 401);
        assert!(client.last_error_message().contains("bad key"));
    }

    #[tokio::test]
    async fn chat_stream_delivers_fragments() {
        let client = client(CannedTransport::sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: [DONE]\n\n",
        ]));
        let mut text = String::new();
        let mut done = false;
        let result = client
            .chat_stream("Hi", &ChatOptions::default(), |fragment, finished| {
                text.push_str(fragment);
                done |= finished;
            })
            .await;
        assert!(result.success);
        assert_eq!(text, "Hello");
        assert!(done);
    }

    #[test]
    fn chat_async_completes_through_poll() {
        let mut client = client(CannedTransport::json(200, OPENAI_OK));
        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        assert!(client.chat_async(
            vec![ChatMessage::user("Hello")],
            ChatOptions::default(),
            move |result| *sink.lock().unwrap() = Some(result.content.clone()),
        ));
        poll_until_done(&client);

        assert_eq!(received.lock().unwrap().as_deref(), Some("Hi there"));
        assert_eq!(client.async_status(), AsyncStatus::Completed);
        assert_eq!(client.last_http_status(), 200);
    }

    #[test]
    fn chat_async_rejects_empty_conversation() {
        let mut client = client(CannedTransport::json(200, OPENAI_OK));
        assert!(!client.chat_async(Vec::new(), ChatOptions::default(), |_| {}));
        assert_eq!(client.last_error(), Some(ErrorKind::InvalidRequest));
        assert_eq!(client.async_status(), AsyncStatus::Idle);
    }

    #[test]
    fn chat_stream_async_collects_text() {
        let mut client = client(CannedTransport::sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\n\ndata: [DONE]\n\n",
        ]));
        let text = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&text);
        assert!(client.chat_stream_async(
            vec![ChatMessage::user("Hello")],
            ChatOptions::default(),
            move |fragment, _| sink.lock().unwrap().push_str(fragment),
            |_| {},
        ));
        poll_until_done(&client);

        assert_eq!(client.async_status(), AsyncStatus::Completed);
        assert_eq!(*text.lock().unwrap(), "AB");
    }
}
