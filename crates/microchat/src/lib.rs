//! Chat-completion client for resource-constrained devices.
//!
//! `microchat` gives a small device one chat interface over several
//! incompatible vendor wire protocols. The interesting parts are not the
//! HTTP plumbing but the pieces around it:
//!
//! - an incremental SSE parser ([`api::streaming::StreamParser`]) that
//!   rebuilds text fragments, tool calls, and completion signals from a byte
//!   stream split at arbitrary points, for three wire grammars;
//! - a retry policy ([`api::retry`]) with capped exponential backoff that
//!   honours server `Retry-After` hints;
//! - a request executor ([`api::executor::RequestExecutor`]) that combines
//!   the two over pluggable [`Transport`](api::transport::Transport) and
//!   [`Codec`](provider::Codec) collaborators;
//! - a single-slot background runner ([`slot::ExecutionSlot`]) so a caller's
//!   poll loop never blocks on the network.
//!
//! # Getting started
//!
//! ```ignore
//! use microchat::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let config = ClientConfig::new(Provider::OpenAi, std::env::var("MICROCHAT_API_KEY").unwrap())
//!         .with_retries(3);
//!     let client = ChatClient::new(config)?;
//!
//!     let result = client.chat("Hello!", &ChatOptions::default()).await;
//!     if result.success {
//!         println!("{}", result.content);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | SSE parser, retry policy, transport trait + reqwest transport, request executor |
//! | [`provider`] | [`Codec`](provider::Codec) trait and codecs for the three wire grammars |
//! | [`slot`] | [`ExecutionSlot`](slot::ExecutionSlot) single-concurrency background runner |
//! | [`client`] | [`ChatClient`](client::ChatClient) façade |
//! | [`config`] | [`ClientConfig`](config::ClientConfig) |

pub mod api;
pub mod client;
pub mod config;
pub mod prelude;
pub mod provider;
pub mod slot;

use serde::{Deserialize, Serialize};

// ── Constants ──────────────────────────────────────────────────────

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default cap on a buffered (non-streaming) response body.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 64 * 1024;

/// Upper bound on tool definitions sent with a single request.
pub const MAX_TOOLS: usize = 10;

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in the conversation.
///
/// Messages are never reordered by anything in this crate; the slice the
/// caller passes in is encoded in order.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// For [`Role::Tool`] messages: the id of the tool call being answered.
    pub name: Option<String>,
    /// For assistant messages that requested tools.
    pub tool_calls: Vec<ToolInvocation>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ── Request options ────────────────────────────────────────────────

/// Sampling and shape parameters for one request.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    /// Maximum completion tokens. `0` leaves the vendor default.
    pub max_tokens: u32,
    /// Overrides the configured model for this request.
    pub model: Option<String>,
    /// Replaces any system message in the conversation.
    pub system_prompt: Option<String>,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Thinking token budget for vendors that support it. `None` keeps the
    /// vendor default, `Some(0)` disables thinking.
    pub thinking_budget: Option<u32>,
    pub tools: Vec<ToolDefinition>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            model: None,
            system_prompt: None,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            thinking_budget: None,
            tools: Vec::new(),
        }
    }
}

impl ChatOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add a tool definition. Definitions beyond [`MAX_TOOLS`] are dropped.
    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        if self.tools.len() < MAX_TOOLS {
            self.tools.push(tool);
        }
        self
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// A tool the model may call. Each codec maps `parameters` to its own
/// field name (`parameters`, `input_schema`, ...).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A tool call requested by the model.
///
/// `arguments` is the raw argument payload exactly as the vendor sent it
/// (usually a JSON object serialized to a string).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Failure classification shared by every layer of the crate.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport unreachable or connection lost.
    NetworkError,
    Timeout,
    /// HTTP 401 / 403.
    AuthError,
    /// HTTP 429.
    RateLimited,
    /// Any other 4xx, or a request the vendor refused to answer.
    InvalidRequest,
    /// HTTP 5xx or an error envelope inside a payload.
    ServerError,
    /// A structured payload failed to parse.
    ParseError,
    /// The background worker could not be created.
    OutOfMemory,
    ResponseTooLarge,
    StreamingError,
    NotConfigured,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::AuthError => "AuthError",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::ResponseTooLarge => "ResponseTooLarge",
            ErrorKind::StreamingError => "StreamingError",
            ErrorKind::NotConfigured => "NotConfigured",
        }
    }

    /// Whether the executor may retry a failure of this kind.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError | ErrorKind::RateLimited | ErrorKind::ServerError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage statistics reported by the vendor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Outcome of one request (single-shot, streaming, or async run).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub content: String,
    pub error: Option<ErrorKind>,
    pub error_message: String,
    /// HTTP status of the final attempt, `0` when no response was received.
    pub http_status: u16,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub tool_calls: Vec<ToolInvocation>,
}

impl ExecutionResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(kind),
            error_message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.prompt_tokens = usage.prompt_tokens;
        self.completion_tokens = usage.completion_tokens;
        self
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = ChatMessage::system("hello");
        assert_eq!(sys.role, Role::System);
        assert_eq!(sys.content, "hello");

        let tool = ChatMessage::tool_result("call-1", "42");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.name.as_deref(), Some("call-1"));

        let assist = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolInvocation::new("t1", "f", "{}")],
        );
        assert!(assist.has_tool_calls());
    }

    #[test]
    fn options_cap_tool_count() {
        let mut options = ChatOptions::default();
        for i in 0..(MAX_TOOLS + 3) {
            options = options.with_tool(ToolDefinition::new(
                format!("t{i}"),
                "",
                serde_json::json!({"type": "object"}),
            ));
        }
        assert_eq!(options.tools.len(), MAX_TOOLS);
    }

    #[test]
    fn result_constructors() {
        let ok = ExecutionResult::ok("hi").with_status(200);
        assert!(ok.success);
        assert_eq!(ok.error, None);
        assert_eq!(ok.http_status, 200);

        let fail = ExecutionResult::fail(ErrorKind::RateLimited, "slow down");
        assert!(!fail.success);
        assert_eq!(fail.error, Some(ErrorKind::RateLimited));
        assert_eq!(fail.error_message, "slow down");
    }

    #[test]
    fn total_tokens_saturates() {
        let r = ExecutionResult::ok("").with_usage(TokenUsage {
            prompt_tokens: u32::MAX,
            completion_tokens: 5,
        });
        assert_eq!(r.total_tokens(), u32::MAX);
    }

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::ServerError.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(ErrorKind::NetworkError.is_transient());
        assert!(!ErrorKind::AuthError.is_transient());
        assert!(!ErrorKind::ResponseTooLarge.is_transient());
        assert_eq!(ErrorKind::ParseError.to_string(), "ParseError");
    }
}
