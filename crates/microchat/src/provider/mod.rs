//! Vendor codecs: request encoding and response decoding per wire grammar.
//!
//! A [`Codec`] turns a conversation into a [`WireRequest`] and a buffered
//! response body back into an [`ExecutionResult`]. It also names the
//! [`WireFormat`] its streaming endpoint speaks. The executor never looks
//! inside vendor JSON itself.
//!
//! [`Provider`] is a plain selector value. There is no global registry:
//! callers pick a provider and ask it for a codec.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::sync::Arc;

pub use anthropic::AnthropicCodec;
pub use gemini::GeminiCodec;
pub use openai::OpenAiCodec;

use crate::api::streaming::WireFormat;
use crate::api::transport::WireRequest;
use crate::{ChatMessage, ChatOptions, ExecutionResult, Role};

/// Request/response translation for one vendor API.
pub trait Codec: Send + Sync {
    /// Human-readable vendor name for logs and error messages.
    fn name(&self) -> &str;

    /// Streaming grammar of this vendor's SSE endpoint.
    fn wire_format(&self) -> WireFormat;

    /// Whether enough settings are present to build a request.
    fn is_configured(&self) -> bool;

    /// Encode a request. `stream` selects the streaming variant.
    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<WireRequest, String>;

    /// Decode a buffered success body.
    fn decode_response(&self, body: &str) -> ExecutionResult;
}

/// Supported vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    OpenAi,
    Anthropic,
    Gemini,
    /// Local Ollama server through its OpenAI-compatible endpoint.
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Ollama => "ollama",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4.1-mini",
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::Gemini => "gemini-2.0-flash",
            Provider::Ollama => "llama3.2",
        }
    }

    pub fn requires_api_key(self) -> bool {
        self != Provider::Ollama
    }

    pub fn wire_format(self) -> WireFormat {
        match self {
            Provider::OpenAi | Provider::Ollama => WireFormat::OpenAi,
            Provider::Anthropic => WireFormat::Anthropic,
            Provider::Gemini => WireFormat::Gemini,
        }
    }

    /// Build the codec for this vendor. Empty `model` falls back to
    /// [`default_model`](Self::default_model); `base_url` overrides the
    /// vendor endpoint.
    pub fn codec(self, api_key: &str, model: &str, base_url: Option<&str>) -> Arc<dyn Codec> {
        let model = if model.is_empty() {
            self.default_model()
        } else {
            model
        };
        match self {
            Provider::OpenAi => {
                let codec = OpenAiCodec::openai(api_key, model);
                Arc::new(match base_url {
                    Some(url) => codec.with_base_url(url),
                    None => codec,
                })
            }
            Provider::Ollama => {
                let codec = OpenAiCodec::ollama(model);
                Arc::new(match base_url {
                    Some(url) => codec.with_base_url(url),
                    None => codec,
                })
            }
            Provider::Anthropic => {
                let codec = AnthropicCodec::new(api_key, model);
                Arc::new(match base_url {
                    Some(url) => codec.with_base_url(url),
                    None => codec,
                })
            }
            Provider::Gemini => {
                let codec = GeminiCodec::new(api_key, model);
                Arc::new(match base_url {
                    Some(url) => codec.with_base_url(url),
                    None => codec,
                })
            }
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown provider '{s}' (expected openai, anthropic, gemini, or ollama)")
            })
    }
}

/// The system prompt to send: the options override wins, then the first
/// system message in the conversation.
pub(crate) fn effective_system_prompt<'a>(
    messages: &'a [ChatMessage],
    options: &'a ChatOptions,
) -> Option<&'a str> {
    options
        .system_prompt
        .as_deref()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            messages
                .iter()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.as_str())
                .filter(|s| !s.is_empty())
        })
}

/// Parse stored tool-call arguments back into JSON, treating anything
/// unparseable as an empty object.
pub(crate) fn arguments_value(arguments: &str) -> serde_json::Value {
    serde_json::from_str(arguments)
        .ok()
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::json!({}))
}
