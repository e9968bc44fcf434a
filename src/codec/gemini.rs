//! Google Gemini codec.
//!
//! Speaks the `:generateContent` / `:streamGenerateContent` REST shapes:
//! camelCase `contents`/`parts`, `functionDeclarations` tools,
//! `functionCall`/`functionResponse` parts, `usageMetadata` accounting.
//! Gemini delivers function-call arguments as complete JSON objects, so
//! streamed tool blocks open, carry one `input_json_delta`, and close in a
//! single chunk.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::compat::effective_max_tokens;
use crate::config::{PipelineEntry, ProviderType};
use crate::error::GatewayError;
use crate::types::{
    BlockDelta, BlockStart, ChatRequest, ChatResponse, ContentBlock, ImageSource, MessageContent,
    MessageDeltaBody, MessageStart, Role, StopReason, StreamEvent, ToolChoice, Usage,
};

use super::{Codec, StreamDecoder};

pub struct GeminiCodec;

impl Codec for GeminiCodec {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    fn request_path(&self, entry: &PipelineEntry, stream: bool) -> String {
        if stream {
            format!(
                "/v1beta/models/{}:streamGenerateContent?alt=sse",
                entry.upstream_model
            )
        } else {
            format!("/v1beta/models/{}:generateContent", entry.upstream_model)
        }
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        entry: &PipelineEntry,
    ) -> Result<Value, GatewayError> {
        let mut contents: Vec<Value> = Vec::new();

        for message in &request.messages {
            encode_content(message, &mut contents)?;
        }

        let mut generation_config = json!({
            "maxOutputTokens": effective_max_tokens(
                request.max_tokens,
                entry.compatibility_hints.max_tokens_cap,
                entry.default_max_tokens,
            ),
        });
        let gc = generation_config.as_object_mut().expect("object literal");
        if let Some(t) = request.temperature {
            gc.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = request.top_p {
            gc.insert("topP".to_string(), json!(p));
        }
        if !request.stop_sequences.is_empty() {
            gc.insert("stopSequences".to_string(), json!(request.stop_sequences));
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        let obj = body.as_object_mut().expect("object literal");

        if let Some(system) = &request.system {
            let text = match system {
                Value::String(s) => s.clone(),
                Value::Array(blocks) => blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
                other => other.to_string(),
            };
            if !text.is_empty() {
                obj.insert(
                    "systemInstruction".to_string(),
                    json!({"parts": [{"text": text}]}),
                );
            }
        }

        if let Some(tools) = &request.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            obj.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );

            if let Some(choice) = &request.tool_choice {
                let config = match choice {
                    ToolChoice::Auto => json!({"mode": "AUTO"}),
                    ToolChoice::None => json!({"mode": "NONE"}),
                    ToolChoice::Any => json!({"mode": "ANY"}),
                    ToolChoice::Tool { name } => {
                        json!({"mode": "ANY", "allowedFunctionNames": [name]})
                    }
                };
                obj.insert(
                    "toolConfig".to_string(),
                    json!({"functionCallingConfig": config}),
                );
            }
        }

        Ok(body)
    }

    fn decode_response(&self, body: Value) -> Result<ChatResponse, GatewayError> {
        let wire: GeminiResponse = serde_json::from_value(body).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed gemini response: {e}"))
        })?;

        let candidate = wire.candidates.into_iter().next().ok_or_else(|| {
            GatewayError::BackendTransient("gemini response has no candidates".to_string())
        })?;

        let mut response = ChatResponse::new("msg_gemini", wire.model_version.unwrap_or_default());
        let mut call_seq = 0usize;
        let mut saw_function_call = false;

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                saw_function_call = true;
                response.content.push(function_call_to_block(call, &mut call_seq));
            } else if !part.text.is_empty() {
                response.content.push(ContentBlock::Text { text: part.text });
            }
        }

        response.stop_reason = Some(if saw_function_call {
            StopReason::ToolUse
        } else {
            map_gemini_finish(candidate.finish_reason.as_deref().unwrap_or("STOP"))
        });

        if let Some(usage) = wire.usage_metadata {
            response.usage = Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            };
        }
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GeminiStreamDecoder::new())
    }
}

/// Canonical roles map onto Gemini's user/model pair; tool results ride in
/// `functionResponse` parts under the function role.
fn encode_content(
    message: &crate::types::Message,
    out: &mut Vec<Value>,
) -> Result<(), GatewayError> {
    let mut parts: Vec<Value> = Vec::new();
    let mut function_responses: Vec<Value> = Vec::new();

    let blocks = match &message.content {
        MessageContent::Text(text) => {
            vec![ContentBlock::Text { text: text.clone() }]
        }
        MessageContent::Blocks(blocks) => blocks.clone(),
    };

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                parts.push(json!({"text": text}));
            }
            ContentBlock::ToolUse { name, input, .. } => {
                parts.push(json!({"functionCall": {"name": name, "args": input}}));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                // Gemini addresses results by function name; the id carries
                // it when synthesized by our decoder (`call_<name>_<n>`).
                let name = function_name_from_call_id(&tool_use_id);
                function_responses.push(json!({
                    "functionResponse": {
                        "name": name,
                        "response": {"name": name, "content": content},
                    }
                }));
            }
            ContentBlock::Image { source } => match source {
                ImageSource::Base64 { media_type, data } => {
                    parts.push(json!({"inlineData": {"mimeType": media_type, "data": data}}));
                }
                ImageSource::Url { url } => {
                    return Err(GatewayError::ClientFault(format!(
                        "gemini upstream requires inline image data, got url '{url}'"
                    )));
                }
            },
        }
    }

    let role = match message.role {
        Role::Assistant => "model",
        // Gemini has no system role in contents; system text rides in
        // systemInstruction, anything else is user-voiced.
        Role::User | Role::System | Role::Tool => "user",
    };

    if !parts.is_empty() {
        out.push(json!({"role": role, "parts": parts}));
    }
    if !function_responses.is_empty() {
        out.push(json!({"role": "function", "parts": function_responses}));
    }
    Ok(())
}

/// `call_LS_0` -> `LS`; opaque foreign ids pass through unchanged.
fn function_name_from_call_id(id: &str) -> String {
    id.strip_prefix("call_")
        .and_then(|rest| rest.rsplit_once('_').map(|(name, _)| name.to_string()))
        .unwrap_or_else(|| id.to_string())
}

fn function_call_to_block(call: GeminiFunctionCall, seq: &mut usize) -> ContentBlock {
    let id = format!("call_{}_{}", call.name, *seq);
    *seq += 1;
    ContentBlock::ToolUse {
        id,
        name: call.name,
        input: call.args,
    }
}

/// STOP -> end_turn, MAX_TOKENS -> max_tokens, SAFETY/RECITATION ->
/// stop_sequence, anything else -> end_turn.
fn map_gemini_finish(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "RECITATION" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize, Default)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

// ============================================================================
// Stream decoder
// ============================================================================

struct GeminiStreamDecoder {
    message_started: bool,
    terminal_emitted: bool,
    next_index: usize,
    text_index: Option<usize>,
    call_seq: usize,
    saw_function_call: bool,
    last_usage: Option<Usage>,
    pending_stop: Option<StopReason>,
}

impl GeminiStreamDecoder {
    fn new() -> Self {
        Self {
            message_started: false,
            terminal_emitted: false,
            next_index: 0,
            text_index: None,
            call_seq: 0,
            saw_function_call: false,
            last_usage: None,
            pending_stop: None,
        }
    }

    fn emit_terminal(&mut self, stop: StopReason, out: &mut Vec<StreamEvent>) {
        if self.terminal_emitted {
            return;
        }
        self.terminal_emitted = true;
        if let Some(index) = self.text_index.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop),
                stop_sequence: None,
            },
            usage: self.last_usage,
        });
        out.push(StreamEvent::MessageStop);
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode_data(
        &mut self,
        _event_name: Option<&str>,
        data: &str,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        let chunk: GeminiResponse = serde_json::from_str(data).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed gemini stream chunk: {e}"))
        })?;

        let mut out = Vec::new();

        if !self.message_started {
            self.message_started = true;
            out.push(StreamEvent::MessageStart {
                message: MessageStart::new(
                    "msg_gemini",
                    chunk.model_version.clone().unwrap_or_default(),
                ),
            });
        }

        if let Some(usage) = &chunk.usage_metadata {
            self.last_usage = Some(Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(out);
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                self.saw_function_call = true;
                // Close a running text block before a structured block; the
                // whole call arrives at once, so open-delta-close here.
                if let Some(index) = self.text_index.take() {
                    out.push(StreamEvent::ContentBlockStop { index });
                }
                let index = self.next_index;
                self.next_index += 1;
                let args = serde_json::to_string(&call.args).unwrap_or_else(|_| "{}".to_string());
                let id = format!("call_{}_{}", call.name, self.call_seq);
                self.call_seq += 1;
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: BlockStart::ToolUse {
                        id,
                        name: call.name,
                        input: json!({}),
                    },
                });
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta { partial_json: args },
                });
                out.push(StreamEvent::ContentBlockStop { index });
            } else if !part.text.is_empty() {
                let index = match self.text_index {
                    Some(index) => index,
                    None => {
                        let index = self.next_index;
                        self.next_index += 1;
                        self.text_index = Some(index);
                        out.push(StreamEvent::ContentBlockStart {
                            index,
                            content_block: BlockStart::Text {
                                text: String::new(),
                            },
                        });
                        index
                    }
                };
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text: part.text },
                });
            }
        }

        if let Some(reason) = candidate.finish_reason.as_deref() {
            let stop = if self.saw_function_call {
                StopReason::ToolUse
            } else {
                map_gemini_finish(reason)
            };
            // Hold for a possible trailing usageMetadata-only chunk.
            self.pending_stop = Some(stop);
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
                    "gemini stream ended without any chunks".to_string(),
                ));
            }
            self.emit_terminal(StopReason::EndTurn, &mut out);
        }
        Ok(out)
    }
}
