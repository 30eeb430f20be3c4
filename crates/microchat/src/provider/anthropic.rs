//! Anthropic Messages API codec.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Codec, arguments_value, effective_system_prompt};
use crate::api::streaming::{WireFormat, envelope_message};
use crate::api::transport::WireRequest;
use crate::{ChatMessage, ChatOptions, ErrorKind, ExecutionResult, Role, ToolInvocation};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// The Messages API requires `max_tokens`; used when the options leave it at 0.
const FALLBACK_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicCodec {
    api_key: String,
    model: String,
    url: String,
}

impl AnthropicCodec {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            url: ANTHROPIC_URL.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Value>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

fn encode_message(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::Tool => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": msg.name.as_deref().unwrap_or_default(),
                "content": msg.content,
            }],
        }),
        Role::Assistant if msg.has_tool_calls() => {
            let mut blocks = Vec::with_capacity(msg.tool_calls.len() + 1);
            if !msg.content.is_empty() {
                blocks.push(json!({"type": "text", "text": msg.content}));
            }
            for call in &msg.tool_calls {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": arguments_value(&call.arguments),
                }));
            }
            json!({"role": "assistant", "content": blocks})
        }
        role => json!({"role": role.as_str(), "content": msg.content}),
    }
}

#[derive(Deserialize)]
struct ResponseBody {
    content: Option<Vec<ContentBlock>>,
    usage: Option<ResponseUsage>,
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl Codec for AnthropicCodec {
    fn name(&self) -> &str {
        "Anthropic"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Anthropic
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.model.is_empty() && !self.url.is_empty()
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<WireRequest, String> {
        let thinking = match options.thinking_budget {
            Some(budget) if budget > 0 => Some(json!({"type": "enabled", "budget_tokens": budget})),
            _ => None,
        };

        let body = RequestBody {
            model: options.model.as_deref().unwrap_or(&self.model),
            max_tokens: if options.max_tokens > 0 {
                options.max_tokens
            } else {
                FALLBACK_MAX_TOKENS
            },
            system: effective_system_prompt(messages, options),
            messages: messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(encode_message)
                .collect(),
            temperature: options.temperature,
            top_p: (options.top_p < 1.0).then_some(options.top_p),
            tools: options
                .tools
                .iter()
                .map(|tool| {
                    let mut def = json!({"name": tool.name, "input_schema": tool.parameters});
                    if !tool.description.is_empty() {
                        def["description"] = json!(tool.description);
                    }
                    def
                })
                .collect(),
            thinking,
            stream,
        };

        let json =
            serde_json::to_string(&body).map_err(|e| format!("failed to serialize request: {e}"))?;
        Ok(WireRequest::post(&self.url, json)
            .with_header("x-api-key", &self.api_key)
            .with_header("anthropic-version", API_VERSION))
    }

    fn decode_response(&self, body: &str) -> ExecutionResult {
        let parsed: ResponseBody = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ExecutionResult::fail(
                    ErrorKind::ParseError,
                    format!("failed to parse response: {e}"),
                );
            }
        };

        if let Some(error) = parsed.error {
            let message = envelope_message(&error);
            let message = if message.is_empty() {
                "API error".to_string()
            } else {
                message
            };
            return ExecutionResult::fail(ErrorKind::ServerError, message);
        }

        let Some(blocks) = parsed.content else {
            return ExecutionResult::fail(ErrorKind::ParseError, "No content in response");
        };
        if blocks.is_empty() {
            return ExecutionResult::fail(ErrorKind::ParseError, "Empty content array");
        }

        let mut texts: Vec<String> = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => texts.push(text),
                ContentBlock::ToolUse { id, name, input } if !id.is_empty() && !name.is_empty() => {
                    let arguments = if input.is_null() {
                        "{}".to_string()
                    } else {
                        input.to_string()
                    };
                    tool_calls.push(ToolInvocation::new(id, name, arguments));
                }
                _ => {}
            }
        }

        let mut result = ExecutionResult::ok(texts.join("\n"));
        result.tool_calls = tool_calls;
        if let Some(usage) = parsed.usage {
            result.prompt_tokens = usage.input_tokens;
            result.completion_tokens = usage.output_tokens;
        }
        result
    }
}
