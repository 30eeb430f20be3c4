//! Google Gemini `generateContent` codec.
//!
//! Gemini never assigns ids to function calls, so decoded tool calls get
//! sequential `gemini_tc_N` ids. A buffered body may arrive either as one
//! JSON object or SSE-wrapped (`data: {...}` lines); both are accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Codec, arguments_value, effective_system_prompt};
use crate::api::streaming::{WireFormat, envelope_message};
use crate::api::transport::WireRequest;
use crate::{ChatMessage, ChatOptions, ErrorKind, ExecutionResult, Role, ToolInvocation};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiCodec {
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiCodec {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.into(),
        }
    }

    /// Base URL up to (not including) `/models/...`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        if stream {
            format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url)
        } else {
            format!("{}/models/{model}:generateContent", self.base_url)
        }
    }
}

// ── Request body ───────────────────────────────────────────────────

#[derive(Serialize)]
struct RequestBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Value>,
    contents: Vec<Value>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<Value>,
}

/// Function name for a tool result: the matching call in an earlier
/// assistant turn, falling back to the call id itself.
fn function_name_for<'a>(history: &'a [ChatMessage], call_id: &'a str) -> &'a str {
    history
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter())
        .find(|call| call.id == call_id)
        .map(|call| call.name.as_str())
        .unwrap_or(call_id)
}

fn encode_contents(messages: &[ChatMessage]) -> Vec<Value> {
    let mut contents = Vec::with_capacity(messages.len());
    for (index, msg) in messages.iter().enumerate() {
        let parts = match msg.role {
            Role::System => continue,
            Role::Assistant if msg.has_tool_calls() => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({"text": msg.content}));
                }
                for call in &msg.tool_calls {
                    parts.push(json!({
                        "functionCall": {"name": call.name, "args": arguments_value(&call.arguments)}
                    }));
                }
                parts
            }
            Role::Tool => {
                let call_id = msg.name.as_deref().unwrap_or_default();
                let name = function_name_for(&messages[..index], call_id);
                let result = serde_json::from_str::<Value>(&msg.content)
                    .unwrap_or_else(|_| Value::String(msg.content.clone()));
                vec![json!({
                    "functionResponse": {"name": name, "response": {"result": result}}
                })]
            }
            _ => vec![json!({"text": msg.content})],
        };
        let role = if msg.role == Role::Assistant { "model" } else { "user" };
        contents.push(json!({"role": role, "parts": parts}));
    }
    contents
}

// ── Response body ──────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: String,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    #[serde(default)]
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// Collects text and tool calls across candidate parts.
#[derive(Default)]
struct PartCollector {
    text: String,
    tool_calls: Vec<ToolInvocation>,
}

impl PartCollector {
    fn collect(&mut self, parts: Vec<Part>, join_with_newline: bool) {
        for part in parts {
            if part.thought {
                continue;
            }
            if let Some(text) = part.text {
                if join_with_newline && !self.text.is_empty() {
                    self.text.push('\n');
                }
                self.text.push_str(&text);
            }
            if let Some(call) = part.function_call
                && !call.name.is_empty()
            {
                let id = format!("gemini_tc_{}", self.tool_calls.len());
                let arguments = if call.args.is_null() {
                    "{}".to_string()
                } else {
                    call.args.to_string()
                };
                self.tool_calls.push(ToolInvocation::new(id, call.name, arguments));
            }
        }
    }

    fn finish(self, usage: Option<UsageMetadata>) -> ExecutionResult {
        let mut result = ExecutionResult::ok(self.text);
        result.tool_calls = self.tool_calls;
        if let Some(usage) = usage {
            result.prompt_tokens = usage.prompt_token_count;
            result.completion_tokens = usage.candidates_token_count;
        }
        result
    }
}

fn blocked(finish_reason: &str) -> Option<ExecutionResult> {
    (!finish_reason.is_empty() && finish_reason != "STOP").then(|| {
        ExecutionResult::fail(
            ErrorKind::InvalidRequest,
            format!("Response blocked: {finish_reason}"),
        )
    })
}

fn decode_single(body: &str) -> ExecutionResult {
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
        let status = error.get("code").and_then(Value::as_u64).unwrap_or(0) as u16;
        let message = match envelope_message(&error) {
            m if m.is_empty() => "API error".to_string(),
            m => m,
        };
        return ExecutionResult::fail(ErrorKind::ServerError, message).with_status(status);
    }

    let Some(candidates) = parsed.candidates else {
        return ExecutionResult::fail(ErrorKind::ParseError, "No candidates in response");
    };
    let Some(candidate) = candidates.into_iter().next() else {
        return ExecutionResult::fail(ErrorKind::ParseError, "Empty candidates array");
    };
    let Some(content) = candidate.content else {
        return blocked(&candidate.finish_reason).unwrap_or_else(|| {
            ExecutionResult::fail(ErrorKind::ParseError, "No content in candidate")
        });
    };

    let mut collector = PartCollector::default();
    collector.collect(content.parts, true);
    collector.finish(parsed.usage_metadata)
}

/// Decode a body made of `data: {...}` lines. Text is concatenated across
/// lines without a separator; unparseable lines are skipped.
fn decode_sse(body: &str) -> ExecutionResult {
    let mut collector = PartCollector::default();
    let mut usage = None;
    let mut found_any = false;

    for line in body.lines() {
        let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
            continue;
        };
        let Ok(chunk) = serde_json::from_str::<ResponseBody>(data.trim_start()) else {
            continue;
        };

        if let Some(candidate) = chunk.candidates.and_then(|c| c.into_iter().next()) {
            match candidate.content {
                Some(content) => collector.collect(content.parts, false),
                None if !found_any => {
                    if let Some(failure) = blocked(&candidate.finish_reason) {
                        return failure;
                    }
                }
                None => {}
            }
            found_any = true;
        }
        if chunk.usage_metadata.is_some() {
            usage = chunk.usage_metadata;
        }
    }

    if !found_any {
        return ExecutionResult::fail(ErrorKind::ParseError, "No valid data in SSE response");
    }
    collector.finish(usage)
}

impl Codec for GeminiCodec {
    fn name(&self) -> &str {
        "Gemini"
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Gemini
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.model.is_empty() && !self.base_url.is_empty()
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<WireRequest, String> {
        let model = options.model.as_deref().unwrap_or(&self.model);

        let body = RequestBody {
            system_instruction: effective_system_prompt(messages, options)
                .map(|prompt| json!({"parts": [{"text": prompt}]})),
            contents: encode_contents(messages),
            generation_config: GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: (options.max_tokens > 0).then_some(options.max_tokens),
                top_p: (options.top_p < 1.0).then_some(options.top_p),
                frequency_penalty: (options.frequency_penalty != 0.0)
                    .then_some(options.frequency_penalty),
                presence_penalty: (options.presence_penalty != 0.0)
                    .then_some(options.presence_penalty),
                thinking_config: options
                    .thinking_budget
                    .map(|budget| json!({"thinkingBudget": budget})),
            },
            tools: if options.tools.is_empty() {
                Vec::new()
            } else {
                let declarations: Vec<Value> = options
                    .tools
                    .iter()
                    .map(|tool| {
                        let mut decl = json!({"name": tool.name, "parameters": tool.parameters});
                        if !tool.description.is_empty() {
                            decl["description"] = json!(tool.description);
                        }
                        decl
                    })
                    .collect();
                vec![json!({"functionDeclarations": declarations})]
            },
        };

        let json =
            serde_json::to_string(&body).map_err(|e| format!("failed to serialize request: {e}"))?;
        Ok(WireRequest::post(self.endpoint(model, stream), json)
            .with_header("x-goog-api-key", &self.api_key))
    }

    fn decode_response(&self, body: &str) -> ExecutionResult {
        if body.contains("data: ") {
            decode_sse(body)
        } else {
            decode_single(body)
        }
    }
}
