//! Anthropic codec.
//!
//! The canonical model is a near-match for the Anthropic wire format, so
//! encoding is mostly re-serialization: swap in the upstream model, clamp
//! max_tokens, and drop gateway-internal metadata keys. Stream decode is a
//! relabeling pass that re-parses upstream events into canonical ones and
//! drops keepalive pings.

use serde_json::Value;

use crate::compat::effective_max_tokens;
use crate::config::{PipelineEntry, ProviderType};
use crate::error::GatewayError;
use crate::types::{ChatRequest, ChatResponse, StreamEvent};

use super::{Codec, StreamDecoder};

pub struct AnthropicCodec;

impl Codec for AnthropicCodec {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn request_path(&self, _entry: &PipelineEntry, _stream: bool) -> String {
        "/v1/messages".to_string()
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        entry: &PipelineEntry,
    ) -> Result<Value, GatewayError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| GatewayError::TransformFault(format!("request serialize: {e}")))?;

        let obj = body
            .as_object_mut()
            .expect("ChatRequest serializes to an object");

        obj.insert(
            "model".to_string(),
            Value::String(entry.upstream_model.clone()),
        );
        obj.insert(
            "max_tokens".to_string(),
            Value::from(effective_max_tokens(
                request.max_tokens,
                entry.compatibility_hints.max_tokens_cap,
                entry.default_max_tokens,
            )),
        );

        // Routing-only metadata keys stay inside the gateway.
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("session_id");
            meta.remove("reasoning");
            if meta.is_empty() {
                obj.remove("metadata");
            }
        }

        Ok(body)
    }

    fn decode_response(&self, body: Value) -> Result<ChatResponse, GatewayError> {
        serde_json::from_value(body).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed anthropic response: {e}"))
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder { finished: false })
    }
}

struct AnthropicStreamDecoder {
    finished: bool,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode_data(
        &mut self,
        event_name: Option<&str>,
        data: &str,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        if matches!(event_name, Some("ping")) || data.is_empty() {
            return Ok(Vec::new());
        }
        if matches!(event_name, Some("error")) {
            return Err(GatewayError::BackendTransient(format!(
                "upstream stream error: {data}"
            )));
        }

        let event: StreamEvent = serde_json::from_str(data).map_err(|e| {
            GatewayError::BackendTransient(format!("malformed anthropic stream event: {e}"))
        })?;
        if matches!(event, StreamEvent::MessageStop) {
            self.finished = true;
        }
        Ok(vec![event])
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, GatewayError> {
        if self.finished {
            Ok(Vec::new())
        } else {
            Err(GatewayError::BackendTransient(
                "anthropic stream ended before message_stop".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> PipelineEntry {
        serde_json::from_value(json!({
            "pipeline_id": "a/claude",
            "provider_id": "a",
            "provider_type": "anthropic",
            "endpoint_url": "https://api.anthropic.com",
            "credential_ref": "key",
            "upstream_model": "claude-3-5-sonnet-20241022",
            "default_max_tokens": 4096,
            "compatibility_hints": {"max_tokens_cap": 8192}
        }))
        .unwrap()
    }

    fn request() -> ChatRequest {
        serde_json::from_value(json!({
            "model": "sonnet-alias",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[test]
    fn encode_rewrites_model_and_max_tokens() {
        let body = AnthropicCodec.encode_request(&request(), &entry()).unwrap();
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        // caller omitted max_tokens: per-model default applies
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn encode_clamps_max_tokens_to_cap() {
        let mut req = request();
        req.max_tokens = Some(100_000);
        let body = AnthropicCodec.encode_request(&req, &entry()).unwrap();
        assert_eq!(body["max_tokens"], 8192);
    }

    #[test]
    fn encode_strips_routing_metadata() {
        let mut req = request();
        req.metadata = Some(json!({"session_id": "s", "user_id": "u"}));
        let body = AnthropicCodec.encode_request(&req, &entry()).unwrap();
        assert!(body["metadata"].get("session_id").is_none());
        assert_eq!(body["metadata"]["user_id"], "u");
    }

    #[test]
    fn decode_passthrough_response() {
        let resp = AnthropicCodec
            .decode_response(json!({
                "id": "msg_01",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }))
            .unwrap();
        assert_eq!(resp.id, "msg_01");
        assert_eq!(resp.usage.output_tokens, 1);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = AnthropicCodec
            .decode_response(json!({"unexpected": true}))
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendTransient(_)));
    }

    #[test]
    fn stream_relabels_and_skips_pings() {
        let mut dec = AnthropicCodec.stream_decoder();
        assert!(dec.decode_data(Some("ping"), "{}").unwrap().is_empty());

        let events = dec
            .decode_data(
                Some("content_block_delta"),
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name(), "content_block_delta");
    }

    #[test]
    fn stream_eof_without_stop_is_backend_fault() {
        let mut dec = AnthropicCodec.stream_decoder();
        dec.decode_data(
            Some("message_start"),
            r#"{"type":"message_start","message":{"id":"m","type":"message","role":"assistant","model":"c","usage":{"input_tokens":0,"output_tokens":0}}}"#,
        )
        .unwrap();
        assert!(dec.finish().is_err());
    }

    #[test]
    fn stream_error_event_is_backend_fault() {
        let mut dec = AnthropicCodec.stream_decoder();
        let err = dec
            .decode_data(Some("error"), r#"{"type":"overloaded_error"}"#)
            .unwrap_err();
        assert!(matches!(err, GatewayError::BackendTransient(_)));
    }
}
