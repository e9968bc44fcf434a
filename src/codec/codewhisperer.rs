//! AWS CodeWhisperer codec.
//!
//! Requests wrap the conversation in a `conversationState` envelope: the
//! latest user turn rides in `currentMessage.userInputMessage`, everything
//! before it in `history`, tools and tool results in
//! `userInputMessageContext`. The response event stream interleaves
//! `assistantResponseEvent` text chunks with `toolUseEvent` fragments that
//! accumulate per `toolUseId` until their `stop` marker.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::compat::effective_max_tokens;
use crate::config::{PipelineEntry, ProviderType};
use crate::error::GatewayError;
use crate::types::{
    BlockDelta, BlockStart, ChatRequest, ChatResponse, ContentBlock, MessageContent,
    MessageDeltaBody, MessageStart, Role, StopReason, StreamEvent, Usage,
};

use super::{Codec, StreamDecoder};

pub struct CodeWhispererCodec;

impl Codec for CodeWhispererCodec {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Codewhisperer
    }

    fn request_path(&self, _entry: &PipelineEntry, _stream: bool) -> String {
        "/generateAssistantResponse".to_string()
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        entry: &PipelineEntry,
    ) -> Result<Value, GatewayError> {
        let (history, current) = split_history(request)?;

        let mut context = json!({});
        let ctx = context.as_object_mut().expect("object literal");

        if let Some(tools) = &request.tools {
            let specs: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "toolSpecification": {
                            "name": t.name,
                            "description": t.description.clone().unwrap_or_default(),
                            "inputSchema": {"json": t.input_schema},
                        }
                    })
                })
                .collect();
            ctx.insert("tools".to_string(), Value::Array(specs));
        }

        let tool_results = collect_tool_results(&current);
        if !tool_results.is_empty() {
            ctx.insert("toolResults".to_string(), Value::Array(tool_results));
        }

        let mut user_input = json!({
            "content": current_text(request, &current),
            "modelId": entry.upstream_model,
            "origin": "AI_EDITOR",
        });
        if !ctx.is_empty() {
            user_input
                .as_object_mut()
                .expect("object literal")
                .insert("userInputMessageContext".to_string(), context);
        }

        // The envelope has no max-token field of its own; the cap rides in
        // inferenceConfiguration like the other bedrock-family bodies.
        let body = json!({
            "conversationState": {
                "chatTriggerType": "MANUAL",
                "currentMessage": {"userInputMessage": user_input},
                "history": history,
            },
            "inferenceConfiguration": {
                "maxTokens": effective_max_tokens(
                    request.max_tokens,
                    entry.compatibility_hints.max_tokens_cap,
                    entry.default_max_tokens,
                ),
            },
        });
        Ok(body)
    }

    fn decode_response(&self, body: Value) -> Result<ChatResponse, GatewayError> {
        let wire: CwResponse = serde_json::from_value(body).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed codewhisperer response: {e}"))
        })?;

        let mut response = ChatResponse::new("msg_codewhisperer", "codewhisperer");
        if !wire.content.is_empty() {
            response.content.push(ContentBlock::Text {
                text: wire.content,
            });
        }
        let mut saw_tool = false;
        for tool_use in wire.tool_uses {
            saw_tool = true;
            response.content.push(ContentBlock::ToolUse {
                id: tool_use.tool_use_id,
                name: tool_use.name,
                input: tool_use.input,
            });
        }
        response.stop_reason = Some(if saw_tool {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        Ok(response)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(CwStreamDecoder::new())
    }
}

/// All but the last user message become `history` turns; the last user
/// message is the `currentMessage`.
fn split_history(request: &ChatRequest) -> Result<(Vec<Value>, MessageContent), GatewayError> {
    let last_index = request
        .messages
        .iter()
        .rposition(|m| m.role == Role::User || m.role == Role::Tool)
        .ok_or_else(|| {
            GatewayError::ClientFault("conversation has no user message to send".to_string())
        })?;

    let mut history = Vec::new();
    for message in &request.messages[..last_index] {
        match message.role {
            Role::Assistant => {
                let mut text = String::new();
                let mut tool_uses = Vec::new();
                for block in message.content.blocks() {
                    match block {
                        ContentBlock::Text { text: t } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(&t);
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_uses.push(json!({
                                "toolUseId": id,
                                "name": name,
                                "input": input,
                            }));
                        }
                        _ => {}
                    }
                }
                let mut msg = json!({"content": text});
                if !tool_uses.is_empty() {
                    msg.as_object_mut()
                        .expect("object literal")
                        .insert("toolUses".to_string(), Value::Array(tool_uses));
                }
                history.push(json!({"assistantResponseMessage": msg}));
            }
            Role::User | Role::System | Role::Tool => {
                history.push(json!({
                    "userInputMessage": {"content": message.content.as_text()}
                }));
            }
        }
    }

    Ok((history, request.messages[last_index].content.clone()))
}

fn current_text(request: &ChatRequest, current: &MessageContent) -> String {
    let mut text = String::new();
    if let Some(system) = &request.system {
        let system_text = match system {
            Value::String(s) => s.clone(),
            other => other
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                })
                .unwrap_or_default(),
        };
        if !system_text.is_empty() {
            text.push_str(&system_text);
            text.push_str("\n\n");
        }
    }
    text.push_str(&current.as_text());
    text
}

fn collect_tool_results(current: &MessageContent) -> Vec<Value> {
    current
        .blocks()
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => Some(json!({
                "toolUseId": tool_use_id,
                "content": [{"json": content}],
                "status": "SUCCESS",
            })),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CwResponse {
    #[serde(default)]
    content: String,
    #[serde(rename = "toolUses", default)]
    tool_uses: Vec<CwToolUse>,
}

#[derive(Debug, Deserialize)]
struct CwToolUse {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

/// One frame of the decoded event stream. Text chunks carry `content`;
/// tool events carry fragments keyed by `toolUseId` with a final `stop`.
#[derive(Debug, Deserialize)]
struct CwStreamEvent {
    #[serde(default)]
    content: Option<String>,
    #[serde(rename = "toolUseId", default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    stop: bool,
}

// ============================================================================
// Stream decoder
// ============================================================================

struct OpenCwTool {
    canonical_index: usize,
    accumulated: String,
}

struct CwStreamDecoder {
    message_started: bool,
    terminal_emitted: bool,
    next_index: usize,
    text_index: Option<usize>,
    open_tools: std::collections::HashMap<String, OpenCwTool>,
    saw_tool: bool,
}

impl CwStreamDecoder {
    fn new() -> Self {
        Self {
            message_started: false,
            terminal_emitted: false,
            next_index: 0,
            text_index: None,
            open_tools: std::collections::HashMap::new(),
            saw_tool: false,
        }
    }

    fn ensure_message_start(&mut self, out: &mut Vec<StreamEvent>) {
        if !self.message_started {
            self.message_started = true;
            out.push(StreamEvent::MessageStart {
                message: MessageStart::new("msg_codewhisperer", "codewhisperer"),
            });
        }
    }

    fn emit_terminal(&mut self, out: &mut Vec<StreamEvent>) {
        if self.terminal_emitted {
            return;
        }
        self.terminal_emitted = true;

        let mut open: Vec<usize> = self.text_index.into_iter().collect();
        open.extend(self.open_tools.values().map(|t| t.canonical_index));
        open.sort_unstable();
        for index in open {
            out.push(StreamEvent::ContentBlockStop { index });
        }

        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(if self.saw_tool {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                }),
                stop_sequence: None,
            },
            usage: Some(Usage::default()),
        });
        out.push(StreamEvent::MessageStop);
    }
}

impl StreamDecoder for CwStreamDecoder {
    fn decode_data(
        &mut self,
        _event_name: Option<&str>,
        data: &str,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        if data == "[DONE]" {
            if !self.message_started {
                return Err(GatewayError::BackendTransient(
                    "codewhisperer stream ended without any frames".to_string(),
                ));
            }
            let mut out = Vec::new();
            self.emit_terminal(&mut out);
            return Ok(out);
        }

        let event: CwStreamEvent = serde_json::from_str(data).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed codewhisperer frame: {e}"))
        })?;

        let mut out = Vec::new();
        self.ensure_message_start(&mut out);

        if let Some(content) = event.content.filter(|c| !c.is_empty()) {
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
                delta: BlockDelta::TextDelta { text: content },
            });
        }

        if let Some(tool_use_id) = event.tool_use_id {
            self.saw_tool = true;
            let is_new = !self.open_tools.contains_key(&tool_use_id);
            if is_new {
                let canonical_index = self.next_index;
                self.next_index += 1;
                out.push(StreamEvent::ContentBlockStart {
                    index: canonical_index,
                    content_block: BlockStart::ToolUse {
                        id: tool_use_id.clone(),
                        name: event.name.clone().unwrap_or_default(),
                        input: json!({}),
                    },
                });
                self.open_tools.insert(
                    tool_use_id.clone(),
                    OpenCwTool {
                        canonical_index,
                        accumulated: String::new(),
                    },
                );
            }

            let tool = self
                .open_tools
                .get_mut(&tool_use_id)
                .expect("inserted above");

            // Fragments may be raw strings or (rarely) a complete object.
            if let Some(input) = event.input {
                let fragment = match input {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                if !fragment.is_empty() {
                    tool.accumulated.push_str(&fragment);
                    out.push(StreamEvent::ContentBlockDelta {
                        index: tool.canonical_index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: fragment,
                        },
                    });
                }
            }

            if event.stop {
                let tool = self.open_tools.remove(&tool_use_id).expect("open");
                // Fragments were forwarded raw; the parse check at close
                // only surfaces diagnostics.
                if serde_json::from_str::<Value>(&tool.accumulated).is_err()
                    && !tool.accumulated.trim().is_empty()
                {
                    debug!(
                        tool_use_id = %tool_use_id,
                        args = %tool.accumulated,
                        "tool arguments did not parse as JSON at block close"
                    );
                }
                out.push(StreamEvent::ContentBlockStop {
                    index: tool.canonical_index,
                });
            }
        }

        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, GatewayError> {
        if !self.message_started {
            return Err(GatewayError::BackendTransient(
                "codewhisperer stream ended without any frames".to_string(),
            ));
        }
        let mut out = Vec::new();
        self.emit_terminal(&mut out);
        Ok(out)
    }
}
