//! Server compatibility stage (chain stage 3).
//!
//! Small, upstream-specific adjustments applied to the canonical request
//! before the codec encodes it, driven entirely by the entry's resolved
//! `compatibility_hints`. No cross-format rewriting happens here; that is
//! the codec's job.

use crate::config::{CompatibilityHints, ContentShape, ForceStream};
use crate::types::{ChatRequest, MessageContent, ToolChoice};

/// Apply hint-driven adjustments in place.
pub fn apply(request: &mut ChatRequest, hints: &CompatibilityHints) {
    match hints.force_stream {
        ForceStream::On => request.stream = Some(true),
        ForceStream::Off => request.stream = Some(false),
        ForceStream::Passthrough => {}
    }

    if let Some(shape) = hints.content_shape {
        coerce_content_shape(request, shape);
    }

    // Providers that see tools but no choice tend to never call them;
    // default to auto.
    if request.tool_choice.is_none()
        && request.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
    {
        request.tool_choice = Some(ToolChoice::Auto);
    }
}

/// Clamp the effective max_tokens: caller value capped by the hint ceiling,
/// falling back to the per-model default when the caller omitted it.
pub fn effective_max_tokens(
    requested: Option<u32>,
    cap: Option<u32>,
    default_max_tokens: u32,
) -> u32 {
    let base = requested.unwrap_or(default_max_tokens);
    match cap {
        Some(cap) => base.min(cap),
        None => base,
    }
}

fn coerce_content_shape(request: &mut ChatRequest, shape: ContentShape) {
    for message in &mut request.messages {
        match shape {
            // Only flatten when nothing would be lost: pure-text blocks.
            ContentShape::String => {
                if let MessageContent::Blocks(blocks) = &message.content {
                    let all_text = blocks
                        .iter()
                        .all(|b| matches!(b, crate::types::ContentBlock::Text { .. }));
                    if all_text {
                        message.content = MessageContent::Text(message.content.as_text());
                    }
                }
            }
            ContentShape::Array => {
                if let MessageContent::Text(_) = &message.content {
                    message.content = MessageContent::Blocks(message.content.blocks());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentBlock;
    use serde_json::json;

    fn request(stream: Option<bool>) -> ChatRequest {
        let mut req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        req.stream = stream;
        req
    }

    #[test]
    fn force_stream_on_overrides() {
        let mut req = request(Some(false));
        apply(
            &mut req,
            &CompatibilityHints {
                force_stream: ForceStream::On,
                ..Default::default()
            },
        );
        assert_eq!(req.stream, Some(true));
    }

    #[test]
    fn passthrough_keeps_caller_choice() {
        let mut req = request(Some(true));
        apply(&mut req, &CompatibilityHints::default());
        assert_eq!(req.stream, Some(true));
    }

    #[test]
    fn tools_without_choice_get_auto() {
        let mut req = request(None);
        req.tools = Some(vec![crate::types::Tool {
            name: "LS".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        }]);
        apply(&mut req, &CompatibilityHints::default());
        assert_eq!(req.tool_choice, Some(ToolChoice::Auto));
    }

    #[test]
    fn explicit_choice_not_overridden() {
        let mut req = request(None);
        req.tools = Some(vec![crate::types::Tool {
            name: "LS".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        }]);
        req.tool_choice = Some(ToolChoice::None);
        apply(&mut req, &CompatibilityHints::default());
        assert_eq!(req.tool_choice, Some(ToolChoice::None));
    }

    #[test]
    fn string_shape_flattens_text_blocks() {
        let mut req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"}
            ]}]
        }))
        .unwrap();
        apply(
            &mut req,
            &CompatibilityHints {
                content_shape: Some(ContentShape::String),
                ..Default::default()
            },
        );
        assert!(matches!(
            &req.messages[0].content,
            MessageContent::Text(s) if s == "a\n\nb"
        ));
    }

    #[test]
    fn string_shape_preserves_tool_blocks() {
        let mut req: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "assistant", "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "t1", "name": "LS", "input": {}}
            ]}]
        }))
        .unwrap();
        apply(
            &mut req,
            &CompatibilityHints {
                content_shape: Some(ContentShape::String),
                ..Default::default()
            },
        );
        // Mixed content must stay structured.
        match &req.messages[0].content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn array_shape_wraps_strings() {
        let mut req = request(None);
        apply(
            &mut req,
            &CompatibilityHints {
                content_shape: Some(ContentShape::Array),
                ..Default::default()
            },
        );
        match &req.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hi"));
            }
            _ => panic!("expected blocks"),
        }
    }

    #[test]
    fn max_tokens_clamping_order() {
        // caller value capped by ceiling
        assert_eq!(effective_max_tokens(Some(10_000), Some(4096), 8192), 4096);
        // caller value under ceiling passes through
        assert_eq!(effective_max_tokens(Some(1000), Some(4096), 8192), 1000);
        // omitted: default, still capped
        assert_eq!(effective_max_tokens(None, Some(4096), 8192), 4096);
        // omitted, no cap: default
        assert_eq!(effective_max_tokens(None, None, 8192), 8192);
    }
}
