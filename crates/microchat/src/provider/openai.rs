//! OpenAI chat completions codec, also used for OpenAI-compatible servers
//! such as Ollama.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Codec, effective_system_prompt};
use crate::api::streaming::{WireFormat, envelope_message};
use crate::api::transport::WireRequest;
use crate::{ChatMessage, ChatOptions, ErrorKind, ExecutionResult, Role, ToolInvocation};

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const OLLAMA_URL: &str = "http://localhost:11434/v1/chat/completions";

/// Codec for `/v1/chat/completions` style endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiCodec {
    name: String,
    api_key: String,
    model: String,
    url: String,
    requires_api_key: bool,
    /// Ask for a trailing usage chunk when streaming.
    stream_usage: bool,
}

impl OpenAiCodec {
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: "OpenAI".into(),
            api_key: api_key.into(),
            model: model.into(),
            url: OPENAI_URL.into(),
            requires_api_key: true,
            stream_usage: true,
        }
    }

    pub fn ollama(model: impl Into<String>) -> Self {
        Self {
            name: "Ollama".into(),
            api_key: String::new(),
            model: model.into(),
            url: OLLAMA_URL.into(),
            requires_api_key: false,
            stream_usage: false,
        }
    }

    /// Any other OpenAI-compatible endpoint.
    pub fn compatible(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        Self {
            name: name.into(),
            requires_api_key: !api_key.is_empty(),
            api_key,
            model: model.into(),
            url: url.into(),
            stream_usage: false,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

// ── Request body ───────────────────────────────────────────────────

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<RequestTool<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<Value>,
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    /// `null` for assistant turns that only carry tool calls.
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<RequestToolCall<'a>>,
}

#[derive(Serialize)]
struct RequestToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: RequestFunction<'a>,
}

#[derive(Serialize)]
struct RequestFunction<'a> {
    name: &'a str,
    arguments: &'a str,
}

#[derive(Serialize)]
struct RequestTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: RequestToolDef<'a>,
}

#[derive(Serialize)]
struct RequestToolDef<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    description: &'a str,
    parameters: &'a Value,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

fn encode_message(msg: &ChatMessage) -> RequestMessage<'_> {
    let tool_calls: Vec<RequestToolCall<'_>> = msg
        .tool_calls
        .iter()
        .map(|call| RequestToolCall {
            id: &call.id,
            kind: "function",
            function: RequestFunction {
                name: &call.name,
                arguments: &call.arguments,
            },
        })
        .collect();

    let content = if msg.role == Role::Assistant && !tool_calls.is_empty() && msg.content.is_empty()
    {
        None
    } else {
        Some(msg.content.as_str())
    };

    RequestMessage {
        role: msg.role.as_str(),
        content,
        tool_call_id: match msg.role {
            Role::Tool => msg.name.as_deref(),
            _ => None,
        },
        tool_calls,
    }
}

// ── Response body ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct ResponseBody {
    choices: Option<Vec<ResponseChoice>>,
    usage: Option<ResponseUsage>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ResponseChoice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: String,
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl Codec for OpenAiCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::OpenAi
    }

    fn is_configured(&self) -> bool {
        (!self.requires_api_key || !self.api_key.is_empty())
            && !self.model.is_empty()
            && !self.url.is_empty()
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> Result<WireRequest, String> {
        let mut encoded = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = effective_system_prompt(messages, options) {
            encoded.push(RequestMessage {
                role: "system",
                content: Some(prompt),
                tool_call_id: None,
                tool_calls: Vec::new(),
            });
        }
        encoded.extend(
            messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(encode_message),
        );

        let body = RequestBody {
            model: options.model.as_deref().unwrap_or(&self.model),
            messages: encoded,
            temperature: options.temperature,
            max_tokens: (options.max_tokens > 0).then_some(options.max_tokens),
            top_p: (options.top_p < 1.0).then_some(options.top_p),
            frequency_penalty: (options.frequency_penalty != 0.0)
                .then_some(options.frequency_penalty),
            presence_penalty: (options.presence_penalty != 0.0).then_some(options.presence_penalty),
            tools: options
                .tools
                .iter()
                .map(|tool| RequestTool {
                    kind: "function",
                    function: RequestToolDef {
                        name: &tool.name,
                        description: &tool.description,
                        parameters: &tool.parameters,
                    },
                })
                .collect(),
            stream,
            stream_options: (stream && self.stream_usage)
                .then(|| serde_json::json!({"include_usage": true})),
        };

        let json =
            serde_json::to_string(&body).map_err(|e| format!("failed to serialize request: {e}"))?;
        let mut request = WireRequest::post(&self.url, json);
        if !self.api_key.is_empty() {
            request = request.with_header("Authorization", format!("Bearer {}", self.api_key));
        }
        Ok(request)
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
            return ExecutionResult::fail(ErrorKind::ServerError, envelope_message(&error));
        }

        let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) else {
            return ExecutionResult::fail(ErrorKind::ParseError, "No choices in response");
        };
        let Some(message) = choice.message else {
            return ExecutionResult::fail(ErrorKind::ParseError, "No message in response");
        };

        let mut result = ExecutionResult::ok(message.content.unwrap_or_default());
        result.tool_calls = message
            .tool_calls
            .into_iter()
            .filter(|call| !call.id.is_empty() && !call.function.name.is_empty())
            .map(|call| ToolInvocation::new(call.id, call.function.name, call.function.arguments))
            .collect();
        if let Some(usage) = parsed.usage {
            result.prompt_tokens = usage.prompt_tokens;
            result.completion_tokens = usage.completion_tokens;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDefinition;
    use serde_json::json;

    fn body_of(request: &WireRequest) -> Value {
        serde_json::from_str(&request.body).unwrap()
    }

    #[test]
    fn basic_request_shape() {
        let codec = OpenAiCodec::openai("sk-test", "gpt-4o-mini");
        let options = ChatOptions::default().with_max_tokens(100);
        let req = codec
            .build_request(&[ChatMessage::user("Hello")], &options, false)
            .unwrap();

        assert_eq!(req.url, OPENAI_URL);
        assert_eq!(req.header("Authorization"), Some("Bearer sk-test"));
        assert!(req.body.contains("\"temperature\":0.7"));
        let body = body_of(&req);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["messages"], json!([{"role": "user", "content": "Hello"}]));
        assert!(body.get("top_p").is_none());
        assert!(body.get("frequency_penalty").is_none());
        assert!(body.get("tools").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn optional_sampling_fields() {
        let codec = OpenAiCodec::openai("k", "m");
        let options = ChatOptions {
            top_p: 0.9,
            frequency_penalty: 0.5,
            presence_penalty: 0.25,
            ..Default::default()
        };
        let req = codec.build_request(&[ChatMessage::user("x")], &options, false).unwrap();
        assert!(req.body.contains("\"top_p\":0.9"));
        assert!(req.body.contains("\"frequency_penalty\":0.5"));
        assert!(req.body.contains("\"presence_penalty\":0.25"));
    }

    #[test]
    fn system_prompt_override_replaces_history() {
        let codec = OpenAiCodec::openai("k", "m");
        let messages = [ChatMessage::system("old"), ChatMessage::user("hi")];
        let options = ChatOptions::default().with_system_prompt("You are helpful");
        let body = body_of(&codec.build_request(&messages, &options, false).unwrap());

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], json!({"role": "system", "content": "You are helpful"}));
    }

    #[test]
    fn tool_round_trip_messages() {
        let codec = OpenAiCodec::openai("k", "m");
        let messages = [
            ChatMessage::user("weather?"),
            ChatMessage::assistant_tool_calls(
                "",
                vec![ToolInvocation::new("call_abc123", "get_weather", r#"{"location":"NYC"}"#)],
            ),
            ChatMessage::tool_result("call_abc123", "25 degrees"),
        ];
        let options = ChatOptions::default().with_tool(ToolDefinition::new(
            "get_weather",
            "Get current weather",
            json!({"type": "object"}),
        ));
        let req = codec.build_request(&messages, &options, false).unwrap();
        let body = body_of(&req);

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[1]["content"], Value::Null);
        assert_eq!(msgs[1]["tool_calls"][0]["id"], "call_abc123");
        assert_eq!(msgs[1]["tool_calls"][0]["type"], "function");
        assert_eq!(msgs[1]["tool_calls"][0]["function"]["arguments"], r#"{"location":"NYC"}"#);
        assert_eq!(msgs[2]["role"], "tool");
        assert_eq!(msgs[2]["tool_call_id"], "call_abc123");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(body["tools"][0]["function"]["description"], "Get current weather");
    }

    #[test]
    fn streaming_request_flags() {
        let req = OpenAiCodec::openai("k", "m")
            .build_request(&[ChatMessage::user("x")], &ChatOptions::default(), true)
            .unwrap();
        let body = body_of(&req);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let ollama = OpenAiCodec::ollama("llama3.2")
            .build_request(&[ChatMessage::user("x")], &ChatOptions::default(), true)
            .unwrap();
        assert_eq!(ollama.url, OLLAMA_URL);
        assert_eq!(ollama.header("Authorization"), None);
        assert!(body_of(&ollama).get("stream_options").is_none());
    }

    #[test]
    fn model_override() {
        let options = ChatOptions::default().with_model("gpt-4o");
        let body = body_of(
            &OpenAiCodec::openai("k", "m")
                .build_request(&[ChatMessage::user("x")], &options, false)
                .unwrap(),
        );
        assert_eq!(body["model"], "gpt-4o");
    }

    #[test]
    fn decode_text_response() {
        let result = OpenAiCodec::openai("k", "m").decode_response(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hello there"},"finish_reason":"stop"}],
                "usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        assert!(result.success);
        assert_eq!(result.content, "Hello there");
        assert_eq!(result.total_tokens(), 15);
    }

    #[test]
    fn decode_tool_calls() {
        let result = OpenAiCodec::openai("k", "m").decode_response(
            r#"{"choices":[{"message":{"role":"assistant","content":null,"tool_calls":[
                {"id":"call_xyz789","type":"function","function":{"name":"get_temp","arguments":"{\"unit\":\"c\"}"}},
                {"id":"call_2","type":"function","function":{"name":"get_time","arguments":"{}"}}
            ]}}]}"#,
        );
        assert!(result.success);
        assert_eq!(result.content, "");
        assert_eq!(result.tool_calls.len(), 2);
        assert_eq!(result.tool_calls[0].name, "get_temp");
        assert_eq!(result.tool_calls[0].arguments, r#"{"unit":"c"}"#);
    }

    #[test]
    fn decode_failures() {
        let codec = OpenAiCodec::openai("k", "m");

        let envelope = codec.decode_response(r#"{"error":{"message":"Invalid API key","type":"invalid_request_error"}}"#);
        assert_eq!(envelope.error, Some(ErrorKind::ServerError));
        assert_eq!(envelope.error_message, "Invalid API key");

        let garbage = codec.decode_response("not json");
        assert_eq!(garbage.error, Some(ErrorKind::ParseError));

        let empty = codec.decode_response(r#"{"choices":[]}"#);
        assert_eq!(empty.error, Some(ErrorKind::ParseError));
    }
}
