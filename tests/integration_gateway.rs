//! End-to-end gateway scenarios against mock upstreams.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relaymux::config::{self, ConfigFile};
use relaymux::orchestrator::GatewayContext;
use relaymux::stream::SseFrameDecoder;
use relaymux::types::{BlockDelta, BlockStart, StopReason, StreamEvent};
use relaymux::{build_context, router};

fn context_from(config_json: Value) -> GatewayContext {
    let file: ConfigFile = serde_json::from_value(config_json).unwrap();
    let credentials: HashMap<String, relaymux::credentials::CredentialSpec> =
        serde_json::from_value(json!({"local": {"type": "none"}})).unwrap();
    let (config, table) = config::build(file).unwrap();
    build_context(config, table, credentials)
}

fn single_pipeline_config(provider_type: &str, endpoint: &str, hints: Value) -> Value {
    json!({
        "categories": {
            "default": {
                "pipelines": [{
                    "provider_id": "upstream",
                    "provider_type": provider_type,
                    "endpoint_url": endpoint,
                    "credential_ref": "local",
                    "upstream_model": "claude-3-5-sonnet-20241022",
                    "timeout_ms": 5000,
                    "compatibility_hints": hints
                }]
            }
        },
        "breaker": {
            "failure_threshold": 3,
            "recovery_timeout_ms": 100,
            "max_recovery_timeout_ms": 800,
            "half_open_max_probes": 1
        }
    })
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn post_sse(app: &axum::Router, uri: &str, body: Value) -> Vec<StreamEvent> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let mut frames = SseFrameDecoder::new();
    let mut events = Vec::new();
    for frame in frames.feed(&bytes) {
        events.push(serde_json::from_str::<StreamEvent>(&frame.data).unwrap());
    }
    events
}

// ---------------------------------------------------------------------------
// Scenario 1: pure passthrough to an Anthropic upstream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn passthrough_non_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ctx = context_from(single_pipeline_config("anthropic", &server.uri(), json!({})));
    let app = router(ctx.clone());

    let (status, body) = post_json(
        &app,
        "/v1/messages",
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "msg_01");
    assert_eq!(body["content"][0]["text"], "hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 1);
    assert_eq!(body["model"], "claude-3-5-sonnet-20241022");

    let backend = ctx.registry.get("upstream/claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(backend.in_flight(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 2: OpenAI adaptation with streamed tool calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn openai_tool_call_stream_adaptation() {
    let sse_body = concat!(
        "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"LS\",\"arguments\":\"{\\\"pa\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"th\\\":\\\"/\\\"}\"}}]},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = single_pipeline_config("openai_compatible", &server.uri(), json!({}));
    config["categories"]["default"]["pipelines"][0]["upstream_model"] = json!("gpt-4o");
    let app = router(context_from(config));

    let events = post_sse(
        &app,
        "/v1/messages",
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "list the root"}],
            "tools": [{
                "name": "LS",
                "input_schema": {
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }
            }],
            "tool_choice": {"type": "auto"},
            "stream": true
        }),
    )
    .await;

    let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );

    match &events[1] {
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: BlockStart::ToolUse { id, name, .. },
        } => {
            assert_eq!(id, "call_1");
            assert_eq!(name, "LS");
        }
        other => panic!("expected tool_use start at index 0, got {other:?}"),
    }

    let concatenated: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(concatenated, r#"{"path":"/"}"#);

    match &events[5] {
        StreamEvent::MessageDelta { delta, .. } => {
            assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
        }
        other => panic!("expected message_delta, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenario 3: buffered tool-call extraction from free-form text
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffered_tool_call_extraction() {
    let sse_body = concat!(
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"OK.\\n\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Tool call: LS(/tmp)\\n\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let config = single_pipeline_config(
        "openai_compatible",
        &server.uri(),
        json!({"buffer_tool_calls": true}),
    );
    let app = router(context_from(config));

    let events = post_sse(
        &app,
        "/v1/messages",
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "list tmp"}],
            "stream": true
        }),
    )
    .await;

    let text_blocks: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(text_blocks, vec!["OK.".to_string()]);

    let tool_starts: Vec<(&String, &String)> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockStart {
                content_block: BlockStart::ToolUse { id, name, .. },
                ..
            } => Some((id, name)),
            _ => None,
        })
        .collect();
    assert_eq!(tool_starts.len(), 1);
    assert_eq!(tool_starts[0].0, "extracted_0");
    assert_eq!(tool_starts[0].1, "LS");

    let args: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::InputJsonDelta { partial_json },
                ..
            } => Some(partial_json.as_str()),
            _ => None,
        })
        .collect();
    let parsed: Value = serde_json::from_str(&args).unwrap();
    assert_eq!(parsed["command"], "/tmp");

    let stop = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageDelta { delta, .. } => delta.stop_reason,
            _ => None,
        })
        .unwrap();
    assert_eq!(stop, StopReason::ToolUse);
}

// ---------------------------------------------------------------------------
// Scenario 4: round-robin across three pipelines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn round_robin_across_three_upstreams() {
    let mut servers = Vec::new();
    for _ in 0..3 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_rr",
                "type": "message",
                "role": "assistant",
                "model": "claude-3-5-sonnet-20241022",
                "content": [{"type": "text", "text": "ok"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;
        servers.push(server);
    }

    let pipelines: Vec<Value> = servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            json!({
                "provider_id": format!("p{i}"),
                "provider_type": "anthropic",
                "endpoint_url": server.uri(),
                "credential_ref": "local",
                "upstream_model": "claude-3-5-sonnet-20241022",
                "max_concurrent": 100
            })
        })
        .collect();
    let config = json!({
        "categories": {
            "default": {"pipelines": pipelines, "strategy": "round_robin"}
        }
    });
    let app = router(context_from(config));

    for _ in 0..9 {
        let (status, _) = post_json(
            &app,
            "/v1/messages",
            json!({
                "model": "claude-3-5-sonnet-20241022",
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    for server in &servers {
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }
}

// ---------------------------------------------------------------------------
// Scenario 5: breaker trips after three 502s and recovers after the timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breaker_trips_and_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_ok",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "back"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .mount(&server)
        .await;

    let ctx = context_from(single_pipeline_config("anthropic", &server.uri(), json!({})));
    let app = router(ctx.clone());

    let request = json!({
        "model": "claude-3-5-sonnet-20241022",
        "messages": [{"role": "user", "content": "hi"}]
    });

    for _ in 0..3 {
        let (status, _) = post_json(&app, "/v1/messages", request.clone()).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    // Breaker is open: request 4 fails fast without touching the upstream.
    let (status, body) = post_json(&app, "/v1/messages", request.clone()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "overloaded_error");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    // After the recovery timeout one probe is permitted; it succeeds and
    // traffic flows again.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let (status, body) = post_json(&app, "/v1/messages", request.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "back");

    let (status, _) = post_json(&app, "/v1/messages", request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server.received_requests().await.unwrap().len(), 5);
}

// ---------------------------------------------------------------------------
// Scenario 6: caller cancels mid-stream
// ---------------------------------------------------------------------------

/// Minimal hand-rolled SSE upstream: sends one chunk immediately, then
/// keeps emitting chunks until the client hangs up.
async fn spawn_slow_sse_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Drain the request headers (and body, approximately).
        let mut buf = [0u8; 8192];
        let _ = socket.read(&mut buf).await;

        let headers = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        if socket.write_all(headers.as_bytes()).await.is_err() {
            return;
        }

        let first = "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"first\"},\"finish_reason\":null}]}\n\n";
        if socket.write_all(first.as_bytes()).await.is_err() {
            return;
        }
        let _ = socket.flush().await;

        // Keep streaming until the write side errors (client gone).
        loop {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let chunk = "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"more\"},\"finish_reason\":null}]}\n\n";
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
            let _ = socket.flush().await;
        }
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn caller_cancel_mid_stream_releases_lease() {
    let endpoint = spawn_slow_sse_server().await;
    let ctx = context_from(single_pipeline_config("openai_compatible", &endpoint, json!({})));
    let app = router(ctx.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "claude-3-5-sonnet-20241022",
                        "messages": [{"role": "user", "content": "hi"}],
                        "stream": true
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let backend = ctx
        .registry
        .get("upstream/claude-3-5-sonnet-20241022")
        .unwrap()
        .clone();

    // Read the first emitted frame, then hang up.
    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert_eq!(backend.in_flight(), 1);
    drop(body);

    // The lease must release exactly once, within a few read cycles.
    let mut released = false;
    for _ in 0..40 {
        if backend.in_flight() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(released, "lease not released after caller disconnect");

    // Cancellation is not a backend failure.
    assert_eq!(
        backend.breaker_state(),
        relaymux::breaker::BreakerState::Closed
    );
}

// ---------------------------------------------------------------------------
// OpenAI-compatible alias endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_completions_alias_transcodes_both_ways() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_alias",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "toolu_1", "name": "LS", "input": {"path": "/"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 3, "output_tokens": 4}
        })))
        .mount(&server)
        .await;

    let ctx = context_from(single_pipeline_config("anthropic", &server.uri(), json!({})));
    let app = router(ctx);

    let (status, body) = post_json(
        &app,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "list root"}
            ],
            "tools": [{
                "type": "function",
                "function": {"name": "LS", "parameters": {"type": "object"}}
            }]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(body["choices"][0]["message"]["content"], "checking");
    assert_eq!(
        body["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
        "LS"
    );
    assert_eq!(body["usage"]["total_tokens"], 7);

    // The upstream saw an Anthropic-shaped request with the hoisted system.
    let received = server.received_requests().await.unwrap();
    let upstream_body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(upstream_body["system"], "be terse");
    assert_eq!(upstream_body["tools"][0]["name"], "LS");
}

// ---------------------------------------------------------------------------
// Validation and error mapping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_request_is_client_fault() {
    // No upstream needed; validation fails first.
    let ctx = context_from(single_pipeline_config(
        "anthropic",
        "http://127.0.0.1:9",
        json!({}),
    ));
    let app = router(ctx.clone());

    let (status, body) = post_json(
        &app,
        "/v1/messages",
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": []
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");

    // A client fault never counts against the backend.
    let backend = ctx.registry.get("upstream/claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(
        backend.breaker_state(),
        relaymux::breaker::BreakerState::Closed
    );
}

#[tokio::test]
async fn unknown_credential_surfaces_as_auth_error_and_trips_breaker() {
    let server = MockServer::start().await;
    let mut config = single_pipeline_config("anthropic", &server.uri(), json!({}));
    config["categories"]["default"]["pipelines"][0]["credential_ref"] = json!("missing");
    let ctx = context_from(config);
    let app = router(ctx.clone());

    let (status, body) = post_json(
        &app,
        "/v1/messages",
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "authentication_error");

    // Credential failure opens the breaker immediately.
    let backend = ctx.registry.get("upstream/claude-3-5-sonnet-20241022").unwrap();
    assert_eq!(
        backend.breaker_state(),
        relaymux::breaker::BreakerState::Open
    );
}
