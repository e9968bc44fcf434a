//! Request orchestrator and HTTP surface (C9).
//!
//! One place decides everything consequential about a request's fate:
//! classification, backend selection, retry, error-to-status mapping, and
//! breaker/stat updates. The transform stages below it only ever return
//! typed errors upward.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::balance::LoadBalancer;
use crate::classify::classify;
use crate::codec::codec_for;
use crate::compat;
use crate::config::{GatewayConfig, PipelineEntry, TableHandle};
use crate::error::GatewayError;
use crate::frontend::{canonical_response_to_openai, openai_request_to_canonical, OpenAiEgress};
use crate::observe::{PipelineEvent, SinkSet};
use crate::registry::{BackendRegistry, Lease, Outcome};
use crate::stream::{
    collect_response, forward_stream, AnthropicEgress, EgressEncoder, ForwardContext,
};
use crate::types::{ChatRequest, ChatResponse};
use crate::upstream::UpstreamClient;
use crate::validate::{validate_request, validate_response};

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    format!("req_{}", REQUEST_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Shared state threaded through the axum handlers. Built once at startup;
/// no process-wide singletons.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub table: Arc<TableHandle>,
    pub registry: Arc<BackendRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub upstream: Arc<UpstreamClient>,
    pub observer: Arc<SinkSet>,
}

/// Which wire format the caller speaks on the way out.
#[derive(Clone, Copy)]
enum EgressKind {
    Anthropic,
    OpenAi,
}

impl EgressKind {
    fn encoder(self) -> Box<dyn EgressEncoder> {
        match self {
            EgressKind::Anthropic => Box::new(AnthropicEgress),
            EgressKind::OpenAi => Box::new(OpenAiEgress::new()),
        }
    }
}

enum HandleResult {
    Complete(ChatResponse),
    Streaming(Response),
}

// ============================================================================
// HTTP handlers
// ============================================================================

/// `POST /v1/messages` — canonical ingress.
pub async fn handle_messages(
    State(ctx): State<GatewayContext>,
    Json(body): Json<Value>,
) -> Response {
    let request: ChatRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return GatewayError::ClientFault(format!("malformed request: {e}")).into_response()
        }
    };

    match handle(&ctx, request, EgressKind::Anthropic).await {
        Ok(HandleResult::Complete(response)) => Json(response).into_response(),
        Ok(HandleResult::Streaming(response)) => response,
        Err(err) => err.into_response(),
    }
}

/// `POST /v1/chat/completions` — OpenAI-compatible alias, transcoded to
/// canonical on ingress and back on egress.
pub async fn handle_chat_completions(
    State(ctx): State<GatewayContext>,
    Json(body): Json<Value>,
) -> Response {
    let request = match openai_request_to_canonical(&body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    match handle(&ctx, request, EgressKind::OpenAi).await {
        Ok(HandleResult::Complete(response)) => {
            Json(canonical_response_to_openai(&response)).into_response()
        }
        Ok(HandleResult::Streaming(response)) => response,
        Err(err) => err.into_response(),
    }
}

/// `GET /health` — liveness plus per-backend snapshot.
pub async fn health_handler(State(ctx): State<GatewayContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "backends": ctx.registry.snapshot(),
    }))
}

// ============================================================================
// Per-request flow
// ============================================================================

async fn handle(
    ctx: &GatewayContext,
    request: ChatRequest,
    egress: EgressKind,
) -> Result<HandleResult, GatewayError> {
    let request_id = next_request_id();

    ctx.observer.emit(PipelineEvent::RequestReceived {
        request_id: request_id.clone(),
        model_hint: request.model.clone(),
        stream: request.wants_stream(),
    });

    let outcome = match validate_request(&request) {
        Err(err) => Err(err),
        Ok(()) => {
            // Hold one table snapshot for the whole request; a concurrent
            // swap affects only requests that arrive after it.
            let table = ctx.table.snapshot();
            let category = classify(&request, &table.classifier);
            ctx.observer.emit(PipelineEvent::CategoryChosen {
                request_id: request_id.clone(),
                category,
            });
            let route = table.route(category);

            let deadline = ctx.config.global_deadline();
            match tokio::time::timeout(
                deadline,
                run_attempts(ctx, &request, egress, &request_id, category, route),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(GatewayError::UpstreamTimeout(deadline)),
            }
        }
    };

    match &outcome {
        Ok(HandleResult::Complete(_)) | Ok(HandleResult::Streaming(_)) => {
            ctx.observer.emit(PipelineEvent::ResponseSent {
                request_id,
                status: StatusCode::OK.as_u16(),
            });
        }
        Err(err) => {
            ctx.observer.emit(PipelineEvent::Error {
                request_id: request_id.clone(),
                pipeline_id: None,
                kind: err.kind(),
                message: err.to_string(),
            });
            ctx.observer.emit(PipelineEvent::ResponseSent {
                request_id,
                status: err.status_code().as_u16(),
            });
        }
    }
    outcome
}

/// Balance-and-run loop. Re-enters selection on retryable failures while
/// nothing has been emitted to the caller, excluding every pipeline
/// already tried within this request.
async fn run_attempts(
    ctx: &GatewayContext,
    request: &ChatRequest,
    egress: EgressKind,
    request_id: &str,
    category: crate::config::Category,
    route: &crate::config::CategoryRoute,
) -> Result<HandleResult, GatewayError> {
    let caller_streams = request.wants_stream();
    let mut tried: HashSet<String> = HashSet::new();
    let mut attempt: u32 = 0;
    let mut last_err: Option<GatewayError> = None;

    loop {
        let lease = match ctx.balancer.select(
            category,
            route,
            &ctx.registry,
            request.session_key(),
            &tried,
        ) {
            Ok(lease) => lease,
            // Nothing left to try: surface the failure that got us here
            // rather than a generic 503, when there is one.
            Err(select_err) => return Err(last_err.unwrap_or(select_err)),
        };
        let entry = lease.entry().clone();
        ctx.observer.emit(PipelineEvent::BackendSelected {
            request_id: request_id.to_string(),
            pipeline_id: entry.pipeline_id.clone(),
            attempt,
        });

        match run_one(ctx, request, egress, request_id, lease, &entry, caller_streams).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                ctx.observer.emit(PipelineEvent::Error {
                    request_id: request_id.to_string(),
                    pipeline_id: Some(entry.pipeline_id.clone()),
                    kind: err.kind(),
                    message: err.to_string(),
                });

                tried.insert(entry.pipeline_id.clone());
                attempt += 1;
                if err.is_retryable() && attempt < ctx.config.global_retry_cap() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// One attempt against one leased backend: shape, encode, call, decode.
/// Consumes the lease on every path.
async fn run_one(
    ctx: &GatewayContext,
    request: &ChatRequest,
    egress: EgressKind,
    request_id: &str,
    lease: Lease,
    entry: &Arc<PipelineEntry>,
    caller_streams: bool,
) -> Result<HandleResult, GatewayError> {
    let mut shaped = request.clone();
    compat::apply(&mut shaped, &entry.compatibility_hints);

    // The buffered extraction path only exists over a stream, so it forces
    // the upstream leg to stream even for a JSON caller.
    let upstream_streams =
        shaped.wants_stream() || entry.compatibility_hints.buffer_tool_calls;
    shaped.stream = Some(upstream_streams);

    let codec = codec_for(entry.provider_type);
    let body = match codec.encode_request(&shaped, entry) {
        Ok(body) => body,
        Err(err) => {
            lease.complete(outcome_for(&err));
            handle_credential_failure(ctx, entry, &err);
            return Err(err);
        }
    };
    let path = codec.request_path(entry, upstream_streams);

    ctx.observer.emit(PipelineEvent::UpstreamBegin {
        request_id: request_id.to_string(),
        pipeline_id: entry.pipeline_id.clone(),
    });
    let started = Instant::now();

    if upstream_streams {
        let upstream = match ctx.upstream.send_stream(entry, &path, &body).await {
            Ok(upstream) => upstream,
            Err(err) => {
                lease.complete(outcome_for(&err));
                handle_credential_failure(ctx, entry, &err);
                return Err(err);
            }
        };

        if caller_streams {
            // The forwarding task owns the lease from here; cancellation
            // and completion are its problem.
            let response = forward_stream(
                upstream,
                codec.stream_decoder(),
                egress.encoder(),
                ForwardContext {
                    lease,
                    started,
                    request_id: request_id.to_string(),
                    buffer_size: ctx.config.sse_buffer_size(),
                    buffered_tool_calls: entry.compatibility_hints.buffer_tool_calls,
                    observer: ctx.observer.clone(),
                },
            )
            .await;
            return Ok(HandleResult::Streaming(response));
        }

        // JSON caller over a streaming upstream: aggregate.
        let collected = collect_response(
            upstream,
            codec.stream_decoder(),
            entry.compatibility_hints.buffer_tool_calls,
        )
        .await
        .and_then(|response| validate_response(&response).map(|_| response));

        return finish_json_attempt(ctx, collected, lease, entry, request_id, started);
    }

    let decoded = ctx
        .upstream
        .send_json(entry, &path, &body)
        .await
        .and_then(|value| codec.decode_response(value))
        .and_then(|response| validate_response(&response).map(|_| response));

    finish_json_attempt(ctx, decoded, lease, entry, request_id, started)
}

fn finish_json_attempt(
    ctx: &GatewayContext,
    result: Result<ChatResponse, GatewayError>,
    lease: Lease,
    entry: &Arc<PipelineEntry>,
    request_id: &str,
    started: Instant,
) -> Result<HandleResult, GatewayError> {
    match result {
        Ok(response) => {
            let latency = started.elapsed();
            lease.complete(Outcome::Success(latency));
            ctx.observer.emit(PipelineEvent::UpstreamEnd {
                request_id: request_id.to_string(),
                pipeline_id: entry.pipeline_id.clone(),
                latency,
            });
            Ok(HandleResult::Complete(response))
        }
        Err(err) => {
            lease.complete(outcome_for(&err));
            handle_credential_failure(ctx, entry, &err);
            Err(err)
        }
    }
}

/// Map an error to the lease outcome that feeds stats and the breaker.
fn outcome_for(err: &GatewayError) -> Outcome {
    if err.is_backend_failure() {
        Outcome::Failure
    } else if matches!(err, GatewayError::Canceled) {
        Outcome::Canceled
    } else {
        // Client and transform faults release the slot without touching
        // EWMA, the success window, or the breaker.
        Outcome::ClientFault
    }
}

fn handle_credential_failure(
    ctx: &GatewayContext,
    entry: &Arc<PipelineEntry>,
    err: &GatewayError,
) {
    if matches!(err, GatewayError::CredentialFailure(_)) {
        ctx.registry.mark_credential_failure(&entry.pipeline_id);
    }
}
