//! Incremental Server-Sent Events parser for the three supported wire
//! grammars.
//!
//! [`StreamParser`] consumes raw bytes in chunks of any size (down to one
//! byte per call), splits them into SSE lines, and decodes each `data:`
//! payload according to its [`WireFormat`]:
//!
//! | Format | Grammar | Completion signal |
//! |--------|---------|-------------------|
//! | [`WireFormat::OpenAi`] | `data: <json>` deltas, tool calls merged by index | `data: [DONE]` |
//! | [`WireFormat::Anthropic`] | `event:`/`data:` frames of typed content blocks | `message_stop` |
//! | [`WireFormat::Gemini`] | self-contained `data: <json>` objects | non-empty `finishReason` |
//!
//! Results surface through callbacks: text fragments via
//! [`on_content`](StreamParser::on_content), finalized tool calls via
//! [`on_tool_call`](StreamParser::on_tool_call), decoded frames via
//! [`on_event`](StreamParser::on_event), and failures via
//! [`on_error`](StreamParser::on_error). Once the parser is done, failed,
//! or cancelled, further input is ignored until [`reset`](StreamParser::reset).
//!
//! The parser never reads a clock on its own. Callers that want an idle
//! timeout invoke [`check_timeout`](StreamParser::check_timeout) from their
//! own poll loop.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{DEFAULT_TIMEOUT_MS, ErrorKind, MAX_TOOLS, TokenUsage, ToolInvocation};

/// Event types that may carry non-JSON payloads without being an error.
const IGNORABLE_EVENTS: &[&str] = &[
    "message_stop",
    "message_start",
    "content_block_start",
    "content_block_stop",
    "ping",
];

/// Which streaming grammar a parser decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Delta grammar: `choices[0].delta` objects terminated by `[DONE]`.
    #[default]
    OpenAi,
    /// Typed-block grammar: `content_block_*` frames terminated by `message_stop`.
    Anthropic,
    /// Self-contained grammar: `candidates[0]` objects with a `finishReason`.
    Gemini,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFormat::OpenAi => write!(f, "openai"),
            WireFormat::Anthropic => write!(f, "anthropic"),
            WireFormat::Gemini => write!(f, "gemini"),
        }
    }
}

/// A decoded SSE frame, as seen by the low-level event observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// The `event:` field of the current frame (empty for line-per-event grammars).
    pub event_type: String,
    /// Raw `data:` payload.
    pub data: String,
    /// Whether this frame completed the stream.
    pub is_done: bool,
}

/// A tool call still being assembled from argument fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolInvocation {
        ToolInvocation {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Streaming,
    Done,
    Cancelled,
    Failed,
}

type ContentCallback<'a> = Box<dyn FnMut(&str, bool) + Send + 'a>;
type ToolCallCallback<'a> = Box<dyn FnMut(&ToolInvocation) + Send + 'a>;
type EventCallback<'a> = Box<dyn FnMut(&StreamEvent) + Send + 'a>;
type ErrorCallback<'a> = Box<dyn FnMut(ErrorKind, &str) + Send + 'a>;

/// Outcome of decoding one `data:` payload.
#[derive(Debug, Default)]
struct Frame {
    content: String,
    done: bool,
}

impl Frame {
    fn done() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }
}

/// `Ok(None)` means the payload was recognized but carries nothing to report.
type DecodeResult = Result<Option<Frame>, (ErrorKind, String)>;

// ── Wire shapes ────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct DeltaChunk {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
    usage: Option<DeltaUsage>,
    error: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct DeltaChoice {
    delta: Option<Delta>,
}

#[derive(Deserialize, Debug)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Deserialize, Debug)]
struct ToolCallFragment {
    index: Option<usize>,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Deserialize, Debug)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize, Debug)]
struct DeltaUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CandidateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    function_call: Option<FunctionCallPart>,
}

#[derive(Deserialize, Debug)]
struct FunctionCallPart {
    #[serde(default)]
    name: String,
    args: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// Pull a human-readable message out of a vendor error envelope.
pub(crate) fn envelope_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

// ── Parser ─────────────────────────────────────────────────────────

/// Stateful SSE decoder. See the [module docs](self).
pub struct StreamParser<'a> {
    format: WireFormat,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a newline.
    scan_from: usize,
    event_type: String,
    accumulated: String,
    accumulate: bool,
    pending: BTreeMap<usize, PendingToolCall>,
    tool_calls: Vec<ToolInvocation>,
    tool_counter: usize,
    saw_content: bool,
    usage: TokenUsage,
    state: ParserState,
    error: Option<(ErrorKind, String)>,
    timeout: Duration,
    last_activity: Instant,
    on_content: Option<ContentCallback<'a>>,
    on_tool_call: Option<ToolCallCallback<'a>>,
    on_event: Option<EventCallback<'a>>,
    on_error: Option<ErrorCallback<'a>>,
}

impl Default for StreamParser<'_> {
    fn default() -> Self {
        Self::new(WireFormat::default())
    }
}

impl std::fmt::Debug for StreamParser<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamParser")
            .field("format", &self.format)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("pending_tool_calls", &self.pending.len())
            .field("error", &self.error)
            .finish()
    }
}

impl<'a> StreamParser<'a> {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            buffer: Vec::new(),
            scan_from: 0,
            event_type: String::new(),
            accumulated: String::new(),
            accumulate: true,
            pending: BTreeMap::new(),
            tool_calls: Vec::new(),
            tool_counter: 0,
            saw_content: false,
            usage: TokenUsage::default(),
            state: ParserState::Streaming,
            error: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            last_activity: Instant::now(),
            on_content: None,
            on_tool_call: None,
            on_event: None,
            on_error: None,
        }
    }

    /// Called with `(fragment, false)` for every non-empty text fragment and
    /// once with `("", true)` when the stream completes.
    pub fn on_content(&mut self, callback: impl FnMut(&str, bool) + Send + 'a) {
        self.on_content = Some(Box::new(callback));
    }

    /// Called once per finalized tool call.
    pub fn on_tool_call(&mut self, callback: impl FnMut(&ToolInvocation) + Send + 'a) {
        self.on_tool_call = Some(Box::new(callback));
    }

    /// Called for every decoded frame, before its content is reported.
    pub fn on_event(&mut self, callback: impl FnMut(&StreamEvent) + Send + 'a) {
        self.on_event = Some(Box::new(callback));
    }

    /// Called once when the parser enters the error state.
    pub fn on_error(&mut self, callback: impl FnMut(ErrorKind, &str) + Send + 'a) {
        self.on_error = Some(Box::new(callback));
    }

    /// Append a chunk of the byte stream and process every complete line.
    ///
    /// A trailing partial line stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.is_terminal() {
            return;
        }
        self.last_activity = Instant::now();
        self.buffer.extend_from_slice(bytes);

        loop {
            let Some(offset) = self.buffer[self.scan_from..].iter().position(|&b| b == b'\n')
            else {
                self.scan_from = self.buffer.len();
                break;
            };
            let pos = self.scan_from + offset;
            self.scan_from = 0;
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.process_line(&line);

            if self.is_terminal() {
                break;
            }
        }
    }

    /// Clear all state so the parser can decode a new stream. Callbacks and
    /// settings are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
        self.event_type.clear();
        self.accumulated.clear();
        self.pending.clear();
        self.tool_calls.clear();
        self.tool_counter = 0;
        self.saw_content = false;
        self.usage = TokenUsage::default();
        self.state = ParserState::Streaming;
        self.error = None;
        self.last_activity = Instant::now();
    }

    /// Stop processing. Further input is ignored until [`reset`](Self::reset).
    pub fn cancel(&mut self) {
        if self.state == ParserState::Streaming {
            debug!("Stream parser cancelled");
            self.state = ParserState::Cancelled;
        }
    }

    /// Fail with [`ErrorKind::Timeout`] if no bytes arrived within the idle
    /// timeout. Returns `true` only when this call tripped the timeout.
    pub fn check_timeout(&mut self) -> bool {
        if self.timeout.is_zero() || self.is_terminal() {
            return false;
        }
        if self.last_activity.elapsed() >= self.timeout {
            self.fail(ErrorKind::Timeout, "Stream timeout".to_string());
            return true;
        }
        false
    }

    /// Idle timeout used by [`check_timeout`](Self::check_timeout). Zero disables it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Keep (default) or skip the running buffer of all text fragments.
    pub fn set_accumulate(&mut self, accumulate: bool) {
        self.accumulate = accumulate;
    }

    pub fn set_format(&mut self, format: WireFormat) {
        self.format = format;
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn is_done(&self) -> bool {
        self.state == ParserState::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ParserState::Cancelled
    }

    pub fn has_error(&self) -> bool {
        self.state == ParserState::Failed
    }

    pub fn error(&self) -> Option<(ErrorKind, &str)> {
        self.error.as_ref().map(|(kind, msg)| (*kind, msg.as_str()))
    }

    pub fn accumulated_content(&self) -> &str {
        &self.accumulated
    }

    pub fn clear_accumulated_content(&mut self) {
        self.accumulated.clear();
    }

    /// Tool calls finalized so far, in emission order.
    pub fn tool_calls(&self) -> &[ToolInvocation] {
        &self.tool_calls
    }

    pub fn take_tool_calls(&mut self) -> Vec<ToolInvocation> {
        std::mem::take(&mut self.tool_calls)
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    fn is_terminal(&self) -> bool {
        self.state != ParserState::Streaming
    }

    // ── Line handling ──

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            self.event_type.clear();
            return;
        }
        let Some((field, value)) = line.split_once(':') else {
            return;
        };
        // Empty field name is an SSE comment (": keep-alive").
        if field.is_empty() {
            return;
        }
        let value = value.trim_start_matches(' ');

        match field {
            "event" => self.event_type = value.to_string(),
            "data" => self.process_data(value),
            _ => trace!(field, "Ignoring SSE field"),
        }
    }

    fn process_data(&mut self, data: &str) {
        let decoded = match self.format {
            WireFormat::OpenAi => self.decode_delta(data),
            WireFormat::Anthropic => self.decode_block(data),
            WireFormat::Gemini => self.decode_candidate(data),
        };

        match decoded {
            Ok(Some(frame)) => self.dispatch(data, frame),
            Ok(None) => {}
            Err((kind, message)) => self.fail(kind, message),
        }
    }

    fn dispatch(&mut self, data: &str, frame: Frame) {
        if frame.done {
            self.state = ParserState::Done;
        }

        if let Some(cb) = self.on_event.as_mut() {
            cb(&StreamEvent {
                event_type: self.event_type.clone(),
                data: data.to_string(),
                is_done: frame.done,
            });
        }

        if !frame.content.is_empty() {
            self.saw_content = true;
            if self.accumulate {
                self.accumulated.push_str(&frame.content);
            }
            if let Some(cb) = self.on_content.as_mut() {
                cb(&frame.content, false);
            }
        }

        if frame.done {
            debug!(format = %self.format, tool_calls = self.tool_calls.len(), "Stream completed");
            if let Some(cb) = self.on_content.as_mut() {
                cb("", true);
            }
        }
    }

    fn fail(&mut self, kind: ErrorKind, message: String) {
        warn!(format = %self.format, %kind, "Stream parser error: {message}");
        self.state = ParserState::Failed;
        if let Some(cb) = self.on_error.as_mut() {
            cb(kind, &message);
        }
        self.error = Some((kind, message));
    }

    /// Returns `false` when the call was dropped for exceeding [`MAX_TOOLS`].
    fn emit_tool_call(&mut self, call: ToolInvocation) -> bool {
        if self.tool_calls.len() >= MAX_TOOLS {
            warn!(name = %call.name, "Dropping tool call beyond limit of {MAX_TOOLS}");
            return false;
        }
        debug!(id = %call.id, name = %call.name, "Tool call assembled");
        if let Some(cb) = self.on_tool_call.as_mut() {
            cb(&call);
        }
        self.tool_calls.push(call);
        true
    }

    fn ignorable_event(&self) -> bool {
        IGNORABLE_EVENTS.contains(&self.event_type.as_str())
    }

    // ── Delta grammar ──

    fn decode_delta(&mut self, data: &str) -> DecodeResult {
        if data.trim() == "[DONE]" {
            let pending = std::mem::take(&mut self.pending);
            for call in pending.into_values() {
                self.emit_tool_call(call.finish());
            }
            return Ok(Some(Frame::done()));
        }

        let chunk: DeltaChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(_) if self.ignorable_event() => return Ok(None),
            Err(e) => return Err((ErrorKind::ParseError, format!("invalid stream chunk: {e}"))),
        };

        if let Some(error) = chunk.error {
            return Err((ErrorKind::ServerError, envelope_message(&error)));
        }
        if let Some(usage) = chunk.usage {
            self.usage = TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            };
        }

        let mut frame = Frame::default();
        if let Some(choice) = chunk.choices.into_iter().next()
            && let Some(delta) = choice.delta
        {
            frame.content = delta.content.unwrap_or_default();
            for fragment in delta.tool_calls.unwrap_or_default() {
                self.merge_tool_fragment(fragment);
            }
        }
        Ok(Some(frame))
    }

    fn merge_tool_fragment(&mut self, fragment: ToolCallFragment) {
        let index = fragment.index.unwrap_or(0);
        if !self.pending.contains_key(&index) && self.pending.len() >= MAX_TOOLS {
            warn!(index, "Ignoring tool call fragment beyond limit of {MAX_TOOLS}");
            return;
        }
        let entry = self.pending.entry(index).or_default();

        if let Some(id) = fragment.id
            && !id.is_empty()
            && entry.id.is_empty()
        {
            entry.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name
                && !name.is_empty()
                && entry.name.is_empty()
            {
                entry.name = name;
            }
            if let Some(args) = function.arguments {
                entry.arguments.push_str(&args);
            }
        }
    }

    // ── Typed-block grammar ──

    fn decode_block(&mut self, data: &str) -> DecodeResult {
        if self.event_type == "message_stop" {
            return Ok(Some(Frame::done()));
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) if self.ignorable_event() => return Ok(None),
            Err(e) => return Err((ErrorKind::ParseError, format!("invalid stream event: {e}"))),
        };

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.event_type.clone());
        let index = value
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(0);

        match kind.as_str() {
            "message_stop" => Ok(Some(Frame::done())),
            "error" => {
                let error = value.get("error").unwrap_or(&value);
                Err((ErrorKind::ServerError, envelope_message(error)))
            }
            "message_start" => {
                if let Some(tokens) = value
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.usage.prompt_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
                }
                Ok(None)
            }
            "message_delta" => {
                if let Some(tokens) = value
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    self.usage.completion_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
                }
                Ok(None)
            }
            "content_block_start" => {
                let block = value.get("content_block");
                let block_type = block.and_then(|b| b.get("type")).and_then(Value::as_str);
                if block_type == Some("tool_use") {
                    let field = |name: &str| {
                        block
                            .and_then(|b| b.get(name))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    if self.pending.len() < MAX_TOOLS || self.pending.contains_key(&index) {
                        self.pending.insert(
                            index,
                            PendingToolCall {
                                id: field("id"),
                                name: field("name"),
                                arguments: String::new(),
                            },
                        );
                    }
                }
                Ok(Some(Frame::default()))
            }
            "content_block_delta" => {
                let delta = value.get("delta");
                let delta_type = delta.and_then(|d| d.get("type")).and_then(Value::as_str);
                let mut frame = Frame::default();
                match delta_type {
                    Some("text_delta") => {
                        frame.content = delta
                            .and_then(|d| d.get("text"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                    }
                    Some("input_json_delta") => {
                        if let Some(call) = self.pending.get_mut(&index)
                            && let Some(partial) = delta
                                .and_then(|d| d.get("partial_json"))
                                .and_then(Value::as_str)
                        {
                            call.arguments.push_str(partial);
                        }
                    }
                    _ => {}
                }
                Ok(Some(frame))
            }
            "content_block_stop" => {
                if let Some(call) = self.pending.remove(&index) {
                    self.emit_tool_call(call.finish());
                }
                Ok(Some(Frame::default()))
            }
            other => {
                trace!(event = other, "Ignoring stream event");
                Ok(None)
            }
        }
    }

    // ── Self-contained grammar ──

    fn decode_candidate(&mut self, data: &str) -> DecodeResult {
        let chunk: CandidateChunk = serde_json::from_str(data)
            .map_err(|e| (ErrorKind::ParseError, format!("invalid stream chunk: {e}")))?;

        if let Some(error) = chunk.error {
            return Err((ErrorKind::ServerError, envelope_message(&error)));
        }
        if let Some(usage) = chunk.usage_metadata {
            self.usage = TokenUsage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
            };
        }

        let mut frame = Frame::default();
        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(Some(frame));
        };

        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for part in parts {
            if part.thought {
                continue;
            }
            if let Some(text) = part.text {
                frame.content.push_str(&text);
            }
            if let Some(call) = part.function_call {
                let id = format!("gemini_tc_{}", self.tool_counter);
                let arguments = call
                    .args
                    .map(|args| args.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                if self.emit_tool_call(ToolInvocation::new(id, call.name, arguments)) {
                    self.tool_counter += 1;
                }
            }
        }

        let finish = candidate.finish_reason.unwrap_or_default();
        if !finish.is_empty() {
            let nothing_produced =
                frame.content.is_empty() && !self.saw_content && self.tool_calls.is_empty();
            if finish != "STOP" && nothing_produced {
                return Err((ErrorKind::InvalidRequest, format!("Response blocked: {finish}")));
            }
            frame.done = true;
        }
        Ok(Some(frame))
    }
}
