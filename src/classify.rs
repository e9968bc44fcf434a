//! Category classification.
//!
//! `classify` is a pure function over the canonical request and the table's
//! classifier rules. Rules apply in order, first match wins:
//! token estimate over threshold, search tool present, thinking hint,
//! background model pattern, else default.

use lazy_static::lazy_static;

use crate::config::{Category, ClassifierRules};
use crate::types::{ChatRequest, ContentBlock, MessageContent};

lazy_static! {
    static ref BPE: tiktoken_rs::CoreBPE =
        tiktoken_rs::cl100k_base().expect("failed to load cl100k_base tokenizer");
}

/// Fixed per-message overhead in the estimate (role framing and separators).
const PER_MESSAGE_OVERHEAD: u32 = 8;

/// Estimate input tokens for a request. Text runs through the tokenizer;
/// non-text blocks fall back to len/4 of their JSON rendering.
pub fn estimate_tokens(request: &ChatRequest) -> u32 {
    let mut total: u32 = 0;

    if let Some(system) = &request.system {
        total += match system.as_str() {
            Some(s) => count_text(s),
            None => approx_json_tokens(system),
        };
    }

    for message in &request.messages {
        total += PER_MESSAGE_OVERHEAD;
        match &message.content {
            MessageContent::Text(s) => total += count_text(s),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    total += match block {
                        ContentBlock::Text { text } => count_text(text),
                        other => {
                            let rendered =
                                serde_json::to_value(other).unwrap_or(serde_json::Value::Null);
                            approx_json_tokens(&rendered)
                        }
                    };
                }
            }
        }
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            let rendered = serde_json::to_value(tool).unwrap_or(serde_json::Value::Null);
            total += approx_json_tokens(&rendered);
        }
    }

    total
}

fn count_text(text: &str) -> u32 {
    BPE.encode_with_special_tokens(text).len() as u32
}

fn approx_json_tokens(value: &serde_json::Value) -> u32 {
    (value.to_string().len() / 4) as u32
}

/// Derive the category for a request. Deterministic and side-effect-free;
/// callers fall back to the table's default category when the classified
/// one has no route.
pub fn classify(request: &ChatRequest, rules: &ClassifierRules) -> Category {
    if estimate_tokens(request) > rules.long_context_threshold {
        return Category::Longcontext;
    }

    if let Some(tools) = &request.tools {
        if tools.iter().any(|t| t.name == rules.search_tool) {
            return Category::Search;
        }
    }

    if has_thinking_hint(request) {
        return Category::Thinking;
    }

    if rules
        .background_patterns
        .iter()
        .any(|p| p.is_match(&request.model))
    {
        return Category::Background;
    }

    Category::Default
}

/// The thinking rule matches the canonical `thinking` block being enabled
/// or a `reasoning` hint in metadata.
fn has_thinking_hint(request: &ChatRequest) -> bool {
    if let Some(thinking) = &request.thinking {
        let disabled = thinking
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| t == "disabled")
            .unwrap_or(false);
        if !disabled {
            return true;
        }
    }
    request
        .metadata
        .as_ref()
        .and_then(|m| m.get("reasoning"))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Role, Tool};
    use serde_json::json;

    fn rules() -> ClassifierRules {
        ClassifierRules {
            long_context_threshold: 100,
            search_tool: "web_search".to_string(),
            background_patterns: vec![regex::Regex::new(r"(?i)haiku|mini").unwrap()],
        }
    }

    fn request(model: &str, text: &str) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Text(text.to_string()),
            }],
            system: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop_sequences: Vec::new(),
            stream: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            metadata: None,
        }
    }

    #[test]
    fn short_request_is_default() {
        assert_eq!(classify(&request("claude-3-5-sonnet", "hi"), &rules()), Category::Default);
    }

    #[test]
    fn long_request_beats_other_rules() {
        let long_text = "word ".repeat(500);
        let mut req = request("claude-3-haiku", &long_text);
        req.tools = Some(vec![Tool {
            name: "web_search".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        }]);
        // longcontext is checked first even though search and background match
        assert_eq!(classify(&req, &rules()), Category::Longcontext);
    }

    #[test]
    fn search_tool_routes_to_search() {
        let mut req = request("claude-3-5-sonnet", "find rust news");
        req.tools = Some(vec![Tool {
            name: "web_search".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        }]);
        assert_eq!(classify(&req, &rules()), Category::Search);
    }

    #[test]
    fn thinking_flag_routes_to_thinking() {
        let mut req = request("claude-3-5-sonnet", "prove it");
        req.thinking = Some(json!({"type": "enabled", "budget_tokens": 1024}));
        assert_eq!(classify(&req, &rules()), Category::Thinking);
    }

    #[test]
    fn disabled_thinking_does_not_match() {
        let mut req = request("claude-3-5-sonnet", "hi");
        req.thinking = Some(json!({"type": "disabled"}));
        assert_eq!(classify(&req, &rules()), Category::Default);
    }

    #[test]
    fn reasoning_metadata_routes_to_thinking() {
        let mut req = request("claude-3-5-sonnet", "hi");
        req.metadata = Some(json!({"reasoning": {"effort": "high"}}));
        assert_eq!(classify(&req, &rules()), Category::Thinking);
    }

    #[test]
    fn background_pattern_matches_model_hint() {
        assert_eq!(
            classify(&request("claude-3-haiku-20240307", "hi"), &rules()),
            Category::Background
        );
        assert_eq!(
            classify(&request("gpt-4o-MINI", "hi"), &rules()),
            Category::Background
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let req = request("claude-3-5-sonnet", "same input");
        let r = rules();
        let first = classify(&req, &r);
        for _ in 0..10 {
            assert_eq!(classify(&req, &r), first);
        }
    }

    #[test]
    fn estimate_counts_system_and_tools() {
        let mut req = request("m", "hello world");
        let base = estimate_tokens(&req);
        req.system = Some(json!("you are terse"));
        let with_system = estimate_tokens(&req);
        assert!(with_system > base);

        req.tools = Some(vec![Tool {
            name: "LS".into(),
            description: Some("list files".into()),
            input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        }]);
        assert!(estimate_tokens(&req) > with_system);
    }
}
