//! SSE stream engine.
//!
//! Reads the upstream byte stream, frames it as SSE, runs the frames
//! through the backend's [`StreamDecoder`], and forwards canonical events
//! to the caller over a bounded channel. The channel is the backpressure
//! seam: when the caller stops draining, the reader parks on `send` and the
//! upstream socket stops being read.
//!
//! The buffered path (per-backend `buffer_tool_calls` hint) holds the whole
//! stream, extracts free-form text tool calls, and emits the canonical
//! events in one burst.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::codec::StreamDecoder;
use crate::error::GatewayError;
use crate::metrics::{increment_active_streams, record_stream_backpressure};
use crate::observe::{PipelineEvent, SinkSet};
use crate::registry::{Lease, Outcome};
use crate::types::{
    BlockDelta, BlockStart, ChatResponse, ContentBlock, MessageDeltaBody, StopReason, StreamEvent,
    Usage,
};

// ============================================================================
// SSE framing
// ============================================================================

/// One framed SSE event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame decoder. Feed raw bytes as they arrive; complete
/// frames come out, partial lines wait in the buffer for the next chunk.
#[derive(Default)]
pub struct SseFrameDecoder {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take(),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                } else {
                    self.event = None;
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
            // comment lines (":") and unknown fields are ignored
        }
        frames
    }

    /// EOF: a final frame may be pending without its trailing blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

// ============================================================================
// Buffered tool-call extraction
// ============================================================================

lazy_static! {
    static ref TOOL_CALL_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"Tool call:\s*([A-Za-z_][A-Za-z0-9_]*)\((.*?)\)").unwrap(),
        Regex::new(r"function_call:\s*([A-Za-z_][A-Za-z0-9_]*)\((.*?)\)").unwrap(),
        Regex::new(r"\[TOOL_CALL\]\s*([A-Za-z_][A-Za-z0-9_]*)\((.*?)\)").unwrap(),
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCall {
    pub name: String,
    pub input: Value,
}

/// Scan accumulated text for the known free-form tool-call syntaxes.
/// Returns the text with matched spans stripped plus the deduplicated
/// calls in order of first appearance.
pub fn extract_text_tool_calls(text: &str) -> (String, Vec<ExtractedCall>) {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut calls: Vec<ExtractedCall> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    let mut matches: Vec<(usize, usize, String, String)> = Vec::new();
    for pattern in TOOL_CALL_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            let whole = caps.get(0).expect("match");
            matches.push((
                whole.start(),
                whole.end(),
                caps[1].to_string(),
                caps[2].to_string(),
            ));
        }
    }
    matches.sort_by_key(|(start, _, _, _)| *start);

    for (start, end, name, args) in matches {
        // Overlapping matches from different patterns count once.
        if spans.iter().any(|(s, e)| start < *e && end > *s) {
            continue;
        }
        spans.push((start, end));
        let key = (name.clone(), args.trim().to_string());
        if seen.insert(key) {
            calls.push(ExtractedCall {
                name,
                input: parse_extracted_args(args.trim()),
            });
        }
    }

    let mut stripped = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in &spans {
        stripped.push_str(&text[cursor..*start]);
        cursor = *end;
    }
    stripped.push_str(&text[cursor..]);

    (stripped.trim().to_string(), calls)
}

/// JSON-object arguments are used structurally; anything else becomes a
/// `command` string.
fn parse_extracted_args(args: &str) -> Value {
    if args.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(args) {
        Ok(v) if v.is_object() => v,
        _ => json!({ "command": args }),
    }
}

// ============================================================================
// Event aggregation
// ============================================================================

/// Fold a complete canonical event sequence into a [`ChatResponse`].
///
/// Used when the caller asked for a non-streaming answer but the upstream
/// only streams, and by the buffered extraction path. Tool-use argument
/// accumulations that fail to parse at block close surface as
/// `{"raw_arguments": ...}` so nothing is silently dropped.
pub fn aggregate_response(events: &[StreamEvent]) -> Result<ChatResponse, GatewayError> {
    let mut id = String::new();
    let mut model = String::new();
    let mut usage = Usage::default();
    let mut stop_reason = None;

    struct OpenBlock {
        index: usize,
        kind: OpenKind,
    }
    enum OpenKind {
        Text { text: String },
        Tool { id: String, name: String, args: String, start_input: Value },
    }

    let mut open: Vec<OpenBlock> = Vec::new();
    let mut finished: Vec<(usize, ContentBlock)> = Vec::new();

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => {
                id = message.id.clone();
                model = message.model.clone();
                usage = message.usage;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let kind = match content_block {
                    BlockStart::Text { text } => OpenKind::Text { text: text.clone() },
                    BlockStart::ToolUse { id, name, input } => OpenKind::Tool {
                        id: id.clone(),
                        name: name.clone(),
                        args: String::new(),
                        start_input: input.clone(),
                    },
                };
                open.push(OpenBlock {
                    index: *index,
                    kind,
                });
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let block = open.iter_mut().find(|b| b.index == *index).ok_or_else(|| {
                    GatewayError::BackendTransient(format!(
                        "delta for unopened content block {index}"
                    ))
                })?;
                match (&mut block.kind, delta) {
                    (OpenKind::Text { text }, BlockDelta::TextDelta { text: t }) => {
                        text.push_str(t);
                    }
                    (OpenKind::Tool { args, .. }, BlockDelta::InputJsonDelta { partial_json }) => {
                        args.push_str(partial_json);
                    }
                    _ => {
                        return Err(GatewayError::BackendTransient(format!(
                            "delta type mismatch on block {index}"
                        )))
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                let position = open
                    .iter()
                    .position(|b| b.index == *index)
                    .ok_or_else(|| {
                        GatewayError::BackendTransient(format!(
                            "stop for unopened content block {index}"
                        ))
                    })?;
                let block = open.remove(position);
                let content = match block.kind {
                    OpenKind::Text { text } => ContentBlock::Text { text },
                    OpenKind::Tool {
                        id,
                        name,
                        args,
                        start_input,
                    } => {
                        let input = if args.trim().is_empty() {
                            start_input
                        } else {
                            serde_json::from_str(&args)
                                .unwrap_or_else(|_| json!({ "raw_arguments": args }))
                        };
                        ContentBlock::ToolUse { id, name, input }
                    }
                };
                finished.push((block.index, content));
            }
            StreamEvent::MessageDelta {
                delta,
                usage: delta_usage,
            } => {
                if delta.stop_reason.is_some() {
                    stop_reason = delta.stop_reason;
                }
                if let Some(u) = delta_usage {
                    usage = *u;
                }
            }
            StreamEvent::MessageStop => {}
        }
    }

    if !open.is_empty() {
        return Err(GatewayError::BackendTransient(
            "stream ended with unclosed content blocks".to_string(),
        ));
    }

    finished.sort_by_key(|(index, _)| *index);
    let mut response = ChatResponse::new(
        if id.is_empty() { "msg_stream" } else { &id },
        model,
    );
    response.content = finished.into_iter().map(|(_, b)| b).collect();
    response.stop_reason = stop_reason.or(Some(StopReason::EndTurn));
    response.usage = usage;
    Ok(response)
}

/// Rewrite a fully-buffered event sequence: pull free-form tool calls out
/// of the text, then re-emit one clean burst.
pub fn apply_buffered_extraction(events: Vec<StreamEvent>) -> Result<Vec<StreamEvent>, GatewayError> {
    let response = aggregate_response(&events)?;

    let mut text = String::new();
    let mut tools: Vec<(String, String, Value)> = Vec::new();
    for block in &response.content {
        match block {
            ContentBlock::Text { text: t } => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(t);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tools.push((id.clone(), name.clone(), input.clone()));
            }
            _ => {}
        }
    }

    let (stripped, extracted) = extract_text_tool_calls(&text);
    for (seq, call) in extracted.into_iter().enumerate() {
        tools.push((format!("extracted_{seq}"), call.name, call.input));
    }

    let mut out = Vec::new();
    out.push(StreamEvent::MessageStart {
        message: crate::types::MessageStart::new(response.id.clone(), response.model.clone()),
    });

    let mut index = 0usize;
    if !stripped.is_empty() {
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::Text {
                text: String::new(),
            },
        });
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: stripped.clone(),
            },
        });
        out.push(StreamEvent::ContentBlockStop { index });
        index += 1;
    }

    let has_tools = !tools.is_empty();
    for (id, name, input) in tools {
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: BlockStart::ToolUse {
                id,
                name,
                input: json!({}),
            },
        });
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string()),
            },
        });
        out.push(StreamEvent::ContentBlockStop { index });
        index += 1;
    }

    out.push(StreamEvent::MessageDelta {
        delta: MessageDeltaBody {
            stop_reason: Some(if has_tools {
                StopReason::ToolUse
            } else {
                response.stop_reason.unwrap_or(StopReason::EndTurn)
            }),
            stop_sequence: None,
        },
        usage: Some(response.usage),
    });
    out.push(StreamEvent::MessageStop);
    Ok(out)
}

// ============================================================================
// Stream forwarding
// ============================================================================

/// Read the whole upstream stream into canonical events (no forwarding).
pub async fn collect_events(
    upstream: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
) -> Result<Vec<StreamEvent>, GatewayError> {
    let mut frames = SseFrameDecoder::new();
    let mut events = Vec::new();
    let mut body = upstream.bytes_stream();

    while let Some(chunk) = body.next().await {
        let bytes = chunk
            .map_err(|e| GatewayError::BackendTransient(format!("upstream stream read: {e}")))?;
        for frame in frames.feed(&bytes) {
            events.extend(decoder.decode_data(frame.event.as_deref(), &frame.data)?);
        }
    }
    if let Some(frame) = frames.finish() {
        events.extend(decoder.decode_data(frame.event.as_deref(), &frame.data)?);
    }
    events.extend(decoder.finish()?);
    Ok(events)
}

/// Collect a streaming upstream into one canonical response. Used when the
/// caller wants JSON but the backend only streams.
pub async fn collect_response(
    upstream: reqwest::Response,
    decoder: Box<dyn StreamDecoder>,
    buffered_tool_calls: bool,
) -> Result<ChatResponse, GatewayError> {
    let mut events = collect_events(upstream, decoder).await?;
    if buffered_tool_calls {
        events = apply_buffered_extraction(events)?;
    }
    aggregate_response(&events)
}

/// Serializes canonical events into the byte frames the caller expects.
///
/// `/v1/messages` callers get Anthropic SSE verbatim; the OpenAI alias
/// installs its own encoder that re-shapes events into
/// `chat.completion.chunk` frames.
pub trait EgressEncoder: Send {
    fn encode(&mut self, event: &StreamEvent) -> Vec<String>;
    /// Trailer frames after the last event (e.g. `data: [DONE]`).
    fn finish(&mut self) -> Vec<String>;
}

/// Canonical passthrough: one Anthropic SSE frame per event.
pub struct AnthropicEgress;

impl EgressEncoder for AnthropicEgress {
    fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        vec![event.to_sse_frame()]
    }

    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Everything the forwarding task needs besides the upstream response.
pub struct ForwardContext {
    pub lease: Lease,
    pub started: Instant,
    pub request_id: String,
    pub buffer_size: usize,
    pub buffered_tool_calls: bool,
    pub observer: Arc<SinkSet>,
}

/// Forward a streaming upstream to the caller as canonical SSE.
///
/// The reader task owns the lease. Caller disconnect surfaces as a failed
/// channel send: the loop breaks, the upstream body drops (closing the
/// connection), and the lease releases as canceled.
pub async fn forward_stream(
    upstream: reqwest::Response,
    decoder: Box<dyn StreamDecoder>,
    mut encoder: Box<dyn EgressEncoder>,
    ctx: ForwardContext,
) -> Response {
    increment_active_streams(1);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(ctx.buffer_size);

    tokio::spawn(async move {
        let outcome = if ctx.buffered_tool_calls {
            pump_buffered(upstream, decoder, &mut encoder, &tx).await
        } else {
            pump_incremental(upstream, decoder, &mut encoder, &ctx, &tx).await
        };

        let pipeline_id = ctx.lease.entry().pipeline_id.clone();
        match outcome {
            PumpOutcome::Done => {
                let latency = ctx.started.elapsed();
                ctx.observer.emit(PipelineEvent::UpstreamEnd {
                    request_id: ctx.request_id.clone(),
                    pipeline_id,
                    latency,
                });
                ctx.lease.complete(Outcome::Success(latency));
            }
            PumpOutcome::Canceled => {
                debug!(request = %ctx.request_id, "caller disconnected mid-stream");
                ctx.lease.complete(Outcome::Canceled);
            }
            PumpOutcome::Failed(err) => {
                ctx.observer.emit(PipelineEvent::Error {
                    request_id: ctx.request_id.clone(),
                    pipeline_id: Some(pipeline_id),
                    kind: "stream",
                    message: err.to_string(),
                });
                // Surface a terminal error frame if the caller is still there.
                let frame = format!(
                    "event: error\ndata: {}\n\n",
                    json!({"type": "error", "error": {"type": "upstream_error", "message": err.to_string()}})
                );
                let _ = tx.send(Ok(Bytes::from(frame))).await;
                ctx.lease.complete(Outcome::Failure);
            }
        }
        increment_active_streams(-1);
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .expect("static response parts")
}

enum PumpOutcome {
    Done,
    Canceled,
    Failed(GatewayError),
}

async fn send_events(
    events: Vec<StreamEvent>,
    encoder: &mut Box<dyn EgressEncoder>,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ()> {
    for event in events {
        for frame in encoder.encode(&event) {
            if tx.capacity() == 0 {
                record_stream_backpressure();
            }
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                return Err(());
            }
        }
    }
    Ok(())
}

async fn send_trailers(
    encoder: &mut Box<dyn EgressEncoder>,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ()> {
    for frame in encoder.finish() {
        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

async fn pump_incremental(
    upstream: reqwest::Response,
    mut decoder: Box<dyn StreamDecoder>,
    encoder: &mut Box<dyn EgressEncoder>,
    ctx: &ForwardContext,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> PumpOutcome {
    let mut frames = SseFrameDecoder::new();
    let mut body = upstream.bytes_stream();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                return PumpOutcome::Failed(GatewayError::BackendTransient(format!(
                    "upstream stream read: {e}"
                )))
            }
        };
        ctx.observer.emit(PipelineEvent::UpstreamChunk {
            request_id: ctx.request_id.clone(),
            bytes: bytes.len(),
        });

        for frame in frames.feed(&bytes) {
            match decoder.decode_data(frame.event.as_deref(), &frame.data) {
                Ok(events) => {
                    if send_events(events, encoder, tx).await.is_err() {
                        return PumpOutcome::Canceled;
                    }
                }
                Err(e) => return PumpOutcome::Failed(e),
            }
        }
    }

    if let Some(frame) = frames.finish() {
        match decoder.decode_data(frame.event.as_deref(), &frame.data) {
            Ok(events) => {
                if send_events(events, encoder, tx).await.is_err() {
                    return PumpOutcome::Canceled;
                }
            }
            Err(e) => return PumpOutcome::Failed(e),
        }
    }

    match decoder.finish() {
        Ok(events) => {
            if send_events(events, encoder, tx).await.is_err() {
                return PumpOutcome::Canceled;
            }
            if send_trailers(encoder, tx).await.is_err() {
                return PumpOutcome::Canceled;
            }
            PumpOutcome::Done
        }
        Err(e) => PumpOutcome::Failed(e),
    }
}

async fn pump_buffered(
    upstream: reqwest::Response,
    decoder: Box<dyn StreamDecoder>,
    encoder: &mut Box<dyn EgressEncoder>,
    tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> PumpOutcome {
    let events = match collect_events(upstream, decoder).await {
        Ok(events) => events,
        Err(e) => return PumpOutcome::Failed(e),
    };
    let events = match apply_buffered_extraction(events) {
        Ok(events) => events,
        Err(e) => return PumpOutcome::Failed(e),
    };
    if send_events(events, encoder, tx).await.is_err() {
        return PumpOutcome::Canceled;
    }
    if send_trailers(encoder, tx).await.is_err() {
        return PumpOutcome::Canceled;
    }
    PumpOutcome::Done
}
