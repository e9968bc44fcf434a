//! Inbound and outbound validators (chain stages 1 and 6).
//!
//! The inbound validator enforces the canonical request invariants and
//! produces client faults. The outbound validator checks what came back
//! from a codec; a violation there is the backend's fault, because a
//! malformed upstream body must never pass through as a success.

use std::collections::HashSet;

use crate::error::GatewayError;
use crate::types::{ChatRequest, ChatResponse, ContentBlock, MessageContent, Role, ToolChoice};

/// Validate the canonical request invariants. First failure wins.
pub fn validate_request(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::ClientFault(
            "messages must not be empty".to_string(),
        ));
    }

    if let Some(max_tokens) = request.max_tokens {
        if max_tokens == 0 {
            return Err(GatewayError::ClientFault(
                "max_tokens must be a positive integer".to_string(),
            ));
        }
    }

    // Every tool_result must reference a tool_use id that appeared earlier
    // in the conversation.
    let mut seen_tool_use_ids: HashSet<&str> = HashSet::new();
    for (idx, message) in request.messages.iter().enumerate() {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                match block {
                    ContentBlock::ToolUse { id, .. } => {
                        seen_tool_use_ids.insert(id.as_str());
                    }
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        if !seen_tool_use_ids.contains(tool_use_id.as_str()) {
                            return Err(GatewayError::ClientFault(format!(
                                "message {idx}: tool_result references unknown tool_use id '{tool_use_id}'"
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // A named tool_choice implies that tool is offered.
    if let Some(ToolChoice::Tool { name }) = &request.tool_choice {
        let offered = request
            .tools
            .as_ref()
            .map(|tools| tools.iter().any(|t| &t.name == name))
            .unwrap_or(false);
        if !offered {
            return Err(GatewayError::ClientFault(format!(
                "tool_choice names '{name}' but it is not in tools"
            )));
        }
    }

    Ok(())
}

/// Validate a canonical response produced by a codec. Failures classify as
/// backend-transient: the upstream sent something we could not faithfully
/// represent.
pub fn validate_response(response: &ChatResponse) -> Result<(), GatewayError> {
    if response.id.is_empty() {
        return Err(GatewayError::BackendTransient(
            "upstream response missing message id".to_string(),
        ));
    }

    if response.role != Role::Assistant {
        return Err(GatewayError::BackendTransient(format!(
            "upstream response has non-assistant role {:?}",
            response.role
        )));
    }

    if response.stop_reason.is_none() {
        return Err(GatewayError::BackendTransient(
            "upstream response missing stop_reason".to_string(),
        ));
    }

    for block in &response.content {
        if let ContentBlock::ToolUse { id, name, .. } = block {
            if id.is_empty() || name.is_empty() {
                return Err(GatewayError::BackendTransient(
                    "upstream tool_use block missing id or name".to_string(),
                ));
            }
        }
    }

    Ok(())
}
