//! OpenAI-compatible frontend for the `/v1/chat/completions` alias.
//!
//! Requests are transcoded to canonical on ingress; responses (including
//! streams) are re-encoded on egress. This is the same conversion the
//! OpenAI codec performs against upstreams, pointed the other way: here
//! the *caller* speaks OpenAI and the pipeline stays canonical.

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::stream::EgressEncoder;
use crate::types::{
    BlockDelta, BlockStart, ChatRequest, ChatResponse, ContentBlock, StopReason, StreamEvent,
};

/// Parse an OpenAI chat-completion request body into the canonical form.
pub fn openai_request_to_canonical(body: &Value) -> Result<ChatRequest, GatewayError> {
    let obj = body
        .as_object()
        .ok_or_else(|| GatewayError::ClientFault("request body must be a JSON object".into()))?;

    let model = obj
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| GatewayError::ClientFault("missing 'model'".into()))?
        .to_string();

    let wire_messages = obj
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| GatewayError::ClientFault("missing 'messages' array".into()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in wire_messages {
        let role = message
            .get("role")
            .and_then(|r| r.as_str())
            .ok_or_else(|| GatewayError::ClientFault("message missing 'role'".into()))?;

        match role {
            "system" | "developer" => {
                let text = content_to_text(message.get("content").unwrap_or(&Value::Null));
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                let tool_use_id = message
                    .get("tool_call_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        GatewayError::ClientFault("tool message missing 'tool_call_id'".into())
                    })?;
                let content = content_to_text(message.get("content").unwrap_or(&Value::Null));
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                    }]
                }));
            }
            "user" | "assistant" => {
                let mut blocks = content_to_blocks(message.get("content").unwrap_or(&Value::Null))?;

                if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
                    for call in tool_calls {
                        let function = call.get("function").ok_or_else(|| {
                            GatewayError::ClientFault("tool_call missing 'function'".into())
                        })?;
                        let name = function
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default();
                        let arguments = function
                            .get("arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("{}");
                        let input: Value = serde_json::from_str(arguments)
                            .unwrap_or_else(|_| json!({"raw_arguments": arguments}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.get("id").and_then(|i| i.as_str()).unwrap_or("call_unknown"),
                            "name": name,
                            "input": input,
                        }));
                    }
                }

                if !blocks.is_empty() {
                    messages.push(json!({"role": role, "content": blocks}));
                }
            }
            other => {
                return Err(GatewayError::ClientFault(format!(
                    "unsupported message role '{other}'"
                )))
            }
        }
    }

    let mut canonical = json!({
        "model": model,
        "messages": messages,
    });
    let out = canonical.as_object_mut().expect("object literal");

    if !system_parts.is_empty() {
        out.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    if let Some(v) = obj.get("max_tokens").or_else(|| obj.get("max_completion_tokens")) {
        out.insert("max_tokens".to_string(), v.clone());
    }
    if let Some(v) = obj.get("temperature") {
        out.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = obj.get("top_p") {
        out.insert("top_p".to_string(), v.clone());
    }
    if let Some(v) = obj.get("stream") {
        out.insert("stream".to_string(), v.clone());
    }
    match obj.get("stop") {
        Some(Value::String(s)) => {
            out.insert("stop_sequences".to_string(), json!([s]));
        }
        Some(Value::Array(a)) => {
            out.insert("stop_sequences".to_string(), json!(a));
        }
        _ => {}
    }
    if let Some(user) = obj.get("user").and_then(|u| u.as_str()) {
        out.insert("metadata".to_string(), json!({"user_id": user}));
    }

    if let Some(tools) = obj.get("tools").and_then(|t| t.as_array()) {
        let converted: Result<Vec<Value>, GatewayError> = tools
            .iter()
            .map(|tool| {
                let function = tool.get("function").ok_or_else(|| {
                    GatewayError::ClientFault("tool entry missing 'function'".into())
                })?;
                Ok(json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                }))
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(converted?));
    }

    if let Some(choice) = obj.get("tool_choice") {
        let converted = match choice {
            Value::String(s) if s == "auto" => Some(json!({"type": "auto"})),
            Value::String(s) if s == "none" => Some(json!({"type": "none"})),
            Value::String(s) if s == "required" => Some(json!({"type": "any"})),
            Value::Object(map) => map
                .get("function")
                .and_then(|f| f.get("name"))
                .map(|name| json!({"type": "tool", "name": name})),
            _ => None,
        };
        if let Some(c) = converted {
            out.insert("tool_choice".to_string(), c);
        }
    }

    serde_json::from_value(canonical)
        .map_err(|e| GatewayError::ClientFault(format!("malformed request: {e}")))
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

fn content_to_blocks(content: &Value) -> Result<Vec<Value>, GatewayError> {
    match content {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => {
            if s.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![json!({"type": "text", "text": s})])
            }
        }
        Value::Array(parts) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => blocks.push(json!({
                        "type": "text",
                        "text": part.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                    })),
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|i| i.get("url"))
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        blocks.push(image_url_to_block(url));
                    }
                    _ => {
                        return Err(GatewayError::ClientFault(format!(
                            "unsupported content part: {part}"
                        )))
                    }
                }
            }
            Ok(blocks)
        }
        other => Err(GatewayError::ClientFault(format!(
            "unsupported content shape: {other}"
        ))),
    }
}

fn image_url_to_block(url: &str) -> Value {
    if let Some(rest) = url.strip_prefix("data:") {
        let mut split = rest.splitn(2, ';');
        let media_type = split.next().unwrap_or("image/jpeg");
        let data = split
            .next()
            .and_then(|s| s.strip_prefix("base64,"))
            .unwrap_or("");
        json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data}
        })
    } else {
        json!({
            "type": "image",
            "source": {"type": "url", "url": url}
        })
    }
}

fn stop_reason_to_finish(stop: StopReason) -> &'static str {
    match stop {
        StopReason::EndTurn | StopReason::StopSequence | StopReason::Error => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
    }
}

/// Render a canonical response as an OpenAI chat.completion body.
pub fn canonical_response_to_openai(response: &ChatResponse) -> Value {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
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
            _ => {}
        }
    }

    let content = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n\n"))
    };

    let mut message = json!({"role": "assistant", "content": content});
    if !tool_calls.is_empty() {
        message
            .as_object_mut()
            .expect("object literal")
            .insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    json!({
        "id": response.id,
        "object": "chat.completion",
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": stop_reason_to_finish(
                response.stop_reason.unwrap_or(StopReason::EndTurn)
            ),
        }],
        "usage": {
            "prompt_tokens": response.usage.input_tokens,
            "completion_tokens": response.usage.output_tokens,
            "total_tokens": response.usage.input_tokens + response.usage.output_tokens,
        }
    })
}

/// Re-encodes the canonical event stream as `chat.completion.chunk` SSE.
pub struct OpenAiEgress {
    id: String,
    model: String,
    /// canonical content_block index -> openai tool_calls index
    tool_indexes: std::collections::HashMap<usize, usize>,
    next_tool_index: usize,
    usage: Option<crate::types::Usage>,
}

impl OpenAiEgress {
    pub fn new() -> Self {
        Self {
            id: "chatcmpl-relay".to_string(),
            model: String::new(),
            tool_indexes: std::collections::HashMap::new(),
            next_tool_index: 0,
            usage: None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        });
        format!("data: {body}\n\n")
    }
}

impl Default for OpenAiEgress {
    fn default() -> Self {
        Self::new()
    }
}

impl EgressEncoder for OpenAiEgress {
    fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.id = message.id.clone();
                self.model = message.model.clone();
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block: BlockStart::ToolUse { id, name, .. },
            } => {
                let tool_index = self.next_tool_index;
                self.next_tool_index += 1;
                self.tool_indexes.insert(*index, tool_index);
                vec![self.chunk(
                    json!({"tool_calls": [{
                        "index": tool_index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]}),
                    None,
                )]
            }
            StreamEvent::ContentBlockStart { .. } | StreamEvent::ContentBlockStop { .. } => {
                Vec::new()
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    vec![self.chunk(json!({"content": text}), None)]
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    let tool_index = self.tool_indexes.get(index).copied().unwrap_or(0);
                    vec![self.chunk(
                        json!({"tool_calls": [{
                            "index": tool_index,
                            "function": {"arguments": partial_json},
                        }]}),
                        None,
                    )]
                }
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    self.usage = Some(*u);
                }
                let finish = delta
                    .stop_reason
                    .map(stop_reason_to_finish)
                    .unwrap_or("stop");
                let mut body = json!({
                    "id": self.id,
                    "object": "chat.completion.chunk",
                    "model": self.model,
                    "choices": [{
                        "index": 0,
                        "delta": {},
                        "finish_reason": finish,
                    }]
                });
                if let Some(u) = self.usage {
                    body.as_object_mut().expect("object literal").insert(
                        "usage".to_string(),
                        json!({
                            "prompt_tokens": u.input_tokens,
                            "completion_tokens": u.output_tokens,
                            "total_tokens": u.input_tokens + u.output_tokens,
                        }),
                    );
                }
                vec![format!("data: {body}\n\n")]
            }
            StreamEvent::MessageStop => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<String> {
        vec!["data: [DONE]\n\n".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageContent, Role, ToolChoice, Usage};

    #[test]
    fn ingress_hoists_system_and_tool_messages() {
        let req = openai_request_to_canonical(&json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "LS", "arguments": "{\"path\":\"/\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "etc"}
            ]
        }))
        .unwrap();

        assert_eq!(req.system, Some(json!("be terse")));
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].role, Role::User);

        let assistant_blocks = req.messages[1].content.blocks();
        assert!(matches!(
            &assistant_blocks[0],
            ContentBlock::ToolUse { name, .. } if name == "LS"
        ));

        let result_blocks = req.messages[2].content.blocks();
        assert!(matches!(
            &result_blocks[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "call_1"
        ));
    }

    #[test]
    fn ingress_converts_tools_and_choice() {
        let req = openai_request_to_canonical(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "type": "function",
                "function": {"name": "LS", "description": "list", "parameters": {"type": "object"}}
            }],
            "tool_choice": "required"
        }))
        .unwrap();

        let tools = req.tools.unwrap();
        assert_eq!(tools[0].name, "LS");
        assert_eq!(req.tool_choice, Some(ToolChoice::Any));
    }

    #[test]
    fn ingress_converts_stop_and_max_completion_tokens() {
        let req = openai_request_to_canonical(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END",
            "max_completion_tokens": 77
        }))
        .unwrap();
        assert_eq!(req.stop_sequences, vec!["END"]);
        assert_eq!(req.max_tokens, Some(77));
    }

    #[test]
    fn ingress_rejects_missing_model() {
        let err = openai_request_to_canonical(&json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap_err();
        assert!(matches!(err, GatewayError::ClientFault(_)));
    }

    #[test]
    fn ingress_user_field_becomes_metadata() {
        let req = openai_request_to_canonical(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "user": "u-42"
        }))
        .unwrap();
        assert_eq!(req.session_key(), Some("u-42"));
    }

    #[test]
    fn egress_response_with_tools() {
        let mut response = ChatResponse::new("msg_1", "gpt-4o");
        response.content = vec![
            ContentBlock::Text {
                text: "checking".into(),
            },
            ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "LS".into(),
                input: json!({"path": "/"}),
            },
        ];
        response.stop_reason = Some(StopReason::ToolUse);
        response.usage = Usage {
            input_tokens: 5,
            output_tokens: 7,
        };

        let body = canonical_response_to_openai(&response);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["choices"][0]["message"]["content"], "checking");
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "LS"
        );
        assert_eq!(body["usage"]["total_tokens"], 12);
    }

    #[test]
    fn egress_stream_reencodes_chunks() {
        let mut egress: Box<dyn EgressEncoder> = Box::new(OpenAiEgress::new());

        let frames = egress.encode(&StreamEvent::MessageStart {
            message: crate::types::MessageStart::new("msg_1", "gpt-4o"),
        });
        assert!(frames[0].contains("chat.completion.chunk"));
        assert!(frames[0].contains(r#""role":"assistant""#));

        let frames = egress.encode(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::TextDelta { text: "hi".into() },
        });
        assert!(frames[0].contains(r#""content":"hi""#));

        let frames = egress.encode(&StreamEvent::MessageDelta {
            delta: crate::types::MessageDeltaBody {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(Usage {
                input_tokens: 1,
                output_tokens: 2,
            }),
        });
        assert!(frames[0].contains(r#""finish_reason":"stop""#));
        assert!(frames[0].contains(r#""total_tokens":3"#));

        assert_eq!(egress.finish(), vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn egress_stream_tool_call_indexes() {
        let mut egress: Box<dyn EgressEncoder> = Box::new(OpenAiEgress::new());
        egress.encode(&StreamEvent::MessageStart {
            message: crate::types::MessageStart::new("msg_1", "m"),
        });

        // Canonical indexes 1 and 2 (text was 0) map to openai 0 and 1.
        let frames = egress.encode(&StreamEvent::ContentBlockStart {
            index: 1,
            content_block: BlockStart::ToolUse {
                id: "call_a".into(),
                name: "A".into(),
                input: json!({}),
            },
        });
        assert!(frames[0].contains(r#""index":0"#));

        let frames = egress.encode(&StreamEvent::ContentBlockStart {
            index: 2,
            content_block: BlockStart::ToolUse {
                id: "call_b".into(),
                name: "B".into(),
                input: json!({}),
            },
        });
        assert!(frames[0].contains(r#""index":1"#));

        let frames = egress.encode(&StreamEvent::ContentBlockDelta {
            index: 2,
            delta: BlockDelta::InputJsonDelta {
                partial_json: "{}".into(),
            },
        });
        assert!(frames[0].contains(r#""index":1"#));
    }

    #[test]
    fn ingress_round_trip_content_blocks() {
        let req = openai_request_to_canonical(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]}]
        }))
        .unwrap();
        match &req.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[1], ContentBlock::Image { .. }));
            }
            _ => panic!("expected blocks"),
        }
    }
}
