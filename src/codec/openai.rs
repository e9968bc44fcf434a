//! OpenAI-compatible codec.
//!
//! Serves every `/v1/chat/completions`-shaped upstream (lmstudio, ollama,
//! qwen, modelscope, hosted OpenAI). Request encode hoists `system` into a
//! leading system message, splits tool_result blocks into `role:"tool"`
//! messages, and wraps tools in the `function` envelope. Response decode
//! maps `choices[0]` back into canonical blocks; the stream decoder turns
//! `chat.completion.chunk` deltas into the canonical event sequence,
//! forwarding tool-call argument fragments raw.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::compat::effective_max_tokens;
use crate::config::{PipelineEntry, ProviderType};
use crate::error::GatewayError;
use crate::types::{
    BlockDelta, BlockStart, ChatRequest, ChatResponse, ContentBlock, ImageSource, MessageContent,
    MessageDeltaBody, MessageStart, Role, StopReason, StreamEvent, ToolChoice, Usage,
};

use super::{Codec, StreamDecoder};

pub struct OpenAiCodec;

impl Codec for OpenAiCodec {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenaiCompatible
    }

    fn request_path(&self, _entry: &PipelineEntry, _stream: bool) -> String {
        "/v1/chat/completions".to_string()
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        entry: &PipelineEntry,
    ) -> Result<Value, GatewayError> {
        let mut messages: Vec<Value> = Vec::new();

        if let Some(system) = &request.system {
            let text = system_text(system);
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        }

        for message in &request.messages {
            encode_message(message, &mut messages)?;
        }

        let mut body = json!({
            "model": entry.upstream_model,
            "messages": messages,
            "max_tokens": effective_max_tokens(
                request.max_tokens,
                entry.compatibility_hints.max_tokens_cap,
                entry.default_max_tokens,
            ),
        });
        let obj = body.as_object_mut().expect("object literal");

        if let Some(t) = request.temperature {
            obj.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            obj.insert("top_p".to_string(), json!(p));
        }
        if !request.stop_sequences.is_empty() {
            obj.insert("stop".to_string(), json!(request.stop_sequences));
        }
        if let Some(stream) = request.stream {
            obj.insert("stream".to_string(), json!(stream));
            if stream {
                // Usage only arrives on streams when asked for.
                obj.insert("stream_options".to_string(), json!({"include_usage": true}));
            }
        }

        if let Some(tools) = &request.tools {
            let wrapped: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description.clone().unwrap_or_default(),
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            obj.insert("tools".to_string(), Value::Array(wrapped));
        }

        if let Some(choice) = &request.tool_choice {
            let encoded = match choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Any => json!("required"),
                ToolChoice::Tool { name } => {
                    json!({"type": "function", "function": {"name": name}})
                }
            };
            obj.insert("tool_choice".to_string(), encoded);
        }

        Ok(body)
    }

    fn decode_response(&self, body: Value) -> Result<ChatResponse, GatewayError> {
        let wire: OpenAiResponse = serde_json::from_value(body).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed openai response: {e}"))
        })?;

        let choice = wire.choices.into_iter().next().ok_or_else(|| {
            GatewayError::BackendTransient("openai response has no choices".to_string())
        })?;

        let mut response = ChatResponse::new(wire.id, wire.model);
        response.content = decode_message_content(&choice.message)?;

        for call in choice.message.tool_calls.unwrap_or_default() {
            response.content.push(tool_call_to_block(&call));
        }

        response.stop_reason = Some(map_finish_reason(
            choice.finish_reason.as_deref().unwrap_or("stop"),
        ));
        if let Some(usage) = wire.usage {
            response.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::new())
    }
}

/// Flatten the canonical system value (string or block array) to text.
fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        other => other.to_string(),
    }
}

/// Encode one canonical message. Assistant tool_use blocks become a
/// `tool_calls` array; tool_result blocks split into separate
/// `role:"tool"` messages, preserving conversation order.
fn encode_message(
    message: &crate::types::Message,
    out: &mut Vec<Value>,
) -> Result<(), GatewayError> {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    match &message.content {
        MessageContent::Text(text) => {
            out.push(json!({"role": role, "content": text}));
        }
        MessageContent::Blocks(blocks) => {
            let mut parts: Vec<Value> = Vec::new();
            let mut tool_calls: Vec<Value> = Vec::new();
            let mut tool_results: Vec<Value> = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        parts.push(json!({"type": "text", "text": text}));
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        // OpenAI demands stringified arguments.
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": serde_json::to_string(input)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            }
                        }));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        tool_results.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": tool_result_text(content),
                        }));
                    }
                    ContentBlock::Image { source } => {
                        parts.push(encode_image(source));
                    }
                }
            }

            if !parts.is_empty() || !tool_calls.is_empty() {
                let content = collapse_parts(parts);
                let mut msg = json!({"role": role, "content": content});
                if !tool_calls.is_empty() {
                    msg.as_object_mut()
                        .expect("object literal")
                        .insert("tool_calls".to_string(), Value::Array(tool_calls));
                }
                out.push(msg);
            }
            out.extend(tool_results);
        }
    }
    Ok(())
}

/// Pure-text part lists collapse to a plain string; multimodal stays an
/// array of parts.
fn collapse_parts(parts: Vec<Value>) -> Value {
    let all_text = parts
        .iter()
        .all(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"));
    if all_text {
        let joined = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n");
        Value::String(joined)
    } else {
        Value::Array(parts)
    }
}

fn encode_image(source: &ImageSource) -> Value {
    let url = match source {
        ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
        ImageSource::Url { url } => url.clone(),
    };
    json!({"type": "image_url", "image_url": {"url": url}})
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        other => other.to_string(),
    }
}

/// stop -> end_turn, length -> max_tokens, tool_calls -> tool_use,
/// content_filter -> stop_sequence, anything else -> end_turn.
pub(crate) fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" => StopReason::ToolUse,
        "content_filter" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

fn decode_message_content(message: &OpenAiMessage) -> Result<Vec<ContentBlock>, GatewayError> {
    match &message.content {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(text)) => {
            if text.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![ContentBlock::Text { text: text.clone() }])
            }
        }
        Some(Value::Array(parts)) => {
            let mut blocks = Vec::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    blocks.push(ContentBlock::Text {
                        text: text.to_string(),
                    });
                }
            }
            Ok(blocks)
        }
        Some(other) => Err(GatewayError::BackendTransient(format!(
            "unexpected openai content shape: {other}"
        ))),
    }
}

/// OpenAI tool call -> canonical tool_use block. Unparseable argument
/// strings are preserved under `raw_arguments` rather than dropped.
fn tool_call_to_block(call: &OpenAiToolCall) -> ContentBlock {
    let name = call
        .function
        .as_ref()
        .map(|f| f.name.clone())
        .unwrap_or_default();
    let arguments = call
        .function
        .as_ref()
        .map(|f| f.arguments.clone())
        .unwrap_or_default();
    let input = parse_tool_arguments(&arguments);

    ContentBlock::ToolUse {
        id: call.id.clone().unwrap_or_else(|| "call_unknown".to_string()),
        name,
        input,
    }
}

fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw_arguments": raw }))
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiToolFunction>,
}

#[derive(Debug, Deserialize, Clone)]
struct OpenAiToolFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamToolFunction>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiStreamToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============================================================================
// Stream decoder
// ============================================================================

/// State for one open tool block in the stream.
struct OpenToolBlock {
    canonical_index: usize,
    accumulated_args: String,
}

struct OpenAiStreamDecoder {
    message_started: bool,
    terminal_emitted: bool,
    next_index: usize,
    text_index: Option<usize>,
    /// Keyed by the upstream tool_calls index.
    tool_blocks: std::collections::HashMap<usize, OpenToolBlock>,
    last_usage: Option<Usage>,
    pending_stop: Option<StopReason>,
}

impl OpenAiStreamDecoder {
    fn new() -> Self {
        Self {
            message_started: false,
            terminal_emitted: false,
            next_index: 0,
            text_index: None,
            tool_blocks: std::collections::HashMap::new(),
            last_usage: None,
            pending_stop: None,
        }
    }

    fn ensure_message_start(&mut self, chunk: &OpenAiStreamChunk, out: &mut Vec<StreamEvent>) {
        if !self.message_started {
            self.message_started = true;
            let id = if chunk.id.is_empty() {
                "msg_stream".to_string()
            } else {
                chunk.id.clone()
            };
            out.push(StreamEvent::MessageStart {
                message: MessageStart::new(id, chunk.model.clone()),
            });
        }
    }

    fn ensure_text_block(&mut self, out: &mut Vec<StreamEvent>) -> usize {
        match self.text_index {
            Some(idx) => idx,
            None => {
                let idx = self.next_index;
                self.next_index += 1;
                self.text_index = Some(idx);
                out.push(StreamEvent::ContentBlockStart {
                    index: idx,
                    content_block: BlockStart::Text {
                        text: String::new(),
                    },
                });
                idx
            }
        }
    }

    /// Close every open block in ascending index order, then emit the
    /// terminal pair.
    fn emit_terminal(&mut self, stop_reason: StopReason, out: &mut Vec<StreamEvent>) {
        if self.terminal_emitted {
            return;
        }
        self.terminal_emitted = true;

        let mut open: Vec<usize> = self.text_index.into_iter().collect();
        open.extend(self.tool_blocks.values().map(|b| b.canonical_index));
        open.sort_unstable();
        for index in open {
            out.push(StreamEvent::ContentBlockStop { index });
        }

        for block in self.tool_blocks.values() {
            // Parse check at close; the fragments were already forwarded,
            // so this only surfaces diagnostics.
            if serde_json::from_str::<Value>(&block.accumulated_args).is_err()
                && !block.accumulated_args.trim().is_empty()
            {
                debug!(
                    args = %block.accumulated_args,
                    "tool arguments did not parse as JSON at block close"
                );
            }
        }

        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.last_usage,
        });
        out.push(StreamEvent::MessageStop);
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode_data(
        &mut self,
        _event_name: Option<&str>,
        data: &str,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        if data == "[DONE]" {
            let mut out = Vec::new();
            if let Some(stop) = self.pending_stop.take() {
                self.emit_terminal(stop, &mut out);
            }
            return Ok(out);
        }

        let chunk: OpenAiStreamChunk = serde_json::from_str(data).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed openai stream chunk: {e}"))
        })?;

        let mut out = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.last_usage = Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        // Usage-only trailer chunks have no choices.
        let Some(choice) = chunk.choices.first() else {
            return Ok(out);
        };

        self.ensure_message_start(&chunk, &mut out);

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                let index = self.ensure_text_block(&mut out);
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta {
                        text: content.clone(),
                    },
                });
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                let is_new = !self.tool_blocks.contains_key(&call.index);
                if is_new {
                    let canonical_index = self.next_index;
                    self.next_index += 1;
                    self.tool_blocks.insert(
                        call.index,
                        OpenToolBlock {
                            canonical_index,
                            accumulated_args: String::new(),
                        },
                    );
                    out.push(StreamEvent::ContentBlockStart {
                        index: canonical_index,
                        content_block: BlockStart::ToolUse {
                            id: call
                                .id
                                .clone()
                                .unwrap_or_else(|| format!("call_{}", call.index)),
                            name: call
                                .function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                            input: json!({}),
                        },
                    });
                }

                if let Some(arguments) = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_ref())
                    .filter(|a| !a.is_empty())
                {
                    let block = self
                        .tool_blocks
                        .get_mut(&call.index)
                        .expect("inserted above");
                    block.accumulated_args.push_str(arguments);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: block.canonical_index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: arguments.clone(),
                        },
                    });
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            // Hold the terminal back one chunk: a usage trailer may still
            // follow before [DONE].
            self.pending_stop = Some(map_finish_reason(reason));
        }

        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, GatewayError> {
        let mut out = Vec::new();
        if let Some(stop) = self.pending_stop.take() {
            self.emit_terminal(stop, &mut out);
            return Ok(out);
        }
        if !self.terminal_emitted {
            if !self.message_started {
                return Err(GatewayError::BackendTransient(
                    "openai stream ended without any chunks".to_string(),
                ));
            }
            // Upstream hung up without a finish_reason; close out what we
            // have rather than swallowing the partial message.
            self.emit_terminal(StopReason::EndTurn, &mut out);
        }
        Ok(out)
    }
}
