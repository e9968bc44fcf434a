//! Protocol codecs: canonical <-> upstream wire formats.
//!
//! One [`Codec`] per provider family. Encoding and response decoding are
//! stateless; streaming decode is per-request state behind a fresh
//! [`StreamDecoder`] from `stream_decoder()`. The codec identity for a
//! request comes from `PipelineEntry.provider_type`.

use serde_json::Value;

use crate::config::{PipelineEntry, ProviderType};
use crate::error::GatewayError;
use crate::types::{ChatRequest, ChatResponse, StreamEvent};

pub mod anthropic;
pub mod codewhisperer;
pub mod gemini;
pub mod openai;

pub trait Codec: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// URL path appended to the entry's `endpoint_url` for a chat call.
    fn request_path(&self, entry: &PipelineEntry, stream: bool) -> String;

    /// Canonical request -> upstream wire body. The encoder owns model
    /// addressing (`entry.upstream_model`) and max_tokens clamping.
    fn encode_request(
        &self,
        request: &ChatRequest,
        entry: &PipelineEntry,
    ) -> Result<Value, GatewayError>;

    /// Upstream non-streaming body -> canonical response.
    fn decode_response(&self, body: Value) -> Result<ChatResponse, GatewayError>;

    /// Fresh per-request streaming decoder.
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;
}

/// Stateful decoder for one upstream SSE stream.
///
/// The SSE engine feeds each framed `data:` payload through `decode_data`
/// and calls `finish` at EOF; decoders must uphold the canonical event
/// invariants (per index: one start, deltas in order, one stop;
/// `message_stop` last).
pub trait StreamDecoder: Send {
    fn decode_data(
        &mut self,
        event_name: Option<&str>,
        data: &str,
    ) -> Result<Vec<StreamEvent>, GatewayError>;

    /// Upstream EOF. Emits whatever terminal events are still owed.
    fn finish(&mut self) -> Result<Vec<StreamEvent>, GatewayError>;
}

/// Static codec lookup by provider type.
pub fn codec_for(provider_type: ProviderType) -> &'static dyn Codec {
    match provider_type {
        ProviderType::Anthropic => &anthropic::AnthropicCodec,
        ProviderType::OpenaiCompatible => &openai::OpenAiCodec,
        ProviderType::Gemini => &gemini::GeminiCodec,
        ProviderType::Codewhisperer => &codewhisperer::CodeWhispererCodec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_covers_all_provider_types() {
        for pt in [
            ProviderType::Anthropic,
            ProviderType::OpenaiCompatible,
            ProviderType::Gemini,
            ProviderType::Codewhisperer,
        ] {
            assert_eq!(codec_for(pt).provider_type(), pt);
        }
    }
}
