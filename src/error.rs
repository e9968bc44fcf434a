//! Error taxonomy for the request pipeline.
//!
//! Transform stages return these upward; the orchestrator is the single
//! place that maps them to HTTP statuses, retry decisions, and breaker
//! updates. Classification matters more than message text: a
//! `BackendTransient` feeds the breaker and is retryable cross-pipeline,
//! a `ClientFault` is neither.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invariant violation in the inbound request. Never retried, never a
    /// backend failure.
    #[error("invalid request: {0}")]
    ClientFault(String),

    /// A codec produced something it shouldn't have. Internal bug.
    #[error("transform error: {0}")]
    TransformFault(String),

    /// Connection reset, DNS, TLS, 5xx, 408, read timeout, malformed
    /// upstream stream. Counts against the breaker; eligible for
    /// cross-pipeline retry on non-streaming requests.
    #[error("upstream transient failure: {0}")]
    BackendTransient(String),

    /// Auth failure or schema rejection from the upstream. Counts against
    /// the breaker, but retrying the same pipeline within this request is
    /// pointless.
    #[error("upstream permanent failure: {0}")]
    BackendPermanent(String),

    /// The upstream call exceeded the backend deadline.
    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// The credential source could not produce a token for this pipeline.
    /// The backend is marked unhealthy and its breaker opens immediately.
    #[error("credential failure: {0}")]
    CredentialFailure(String),

    /// `max_concurrent` reached on a specific pipeline. Not a backend
    /// failure.
    #[error("pipeline at capacity")]
    CapacityExhausted,

    /// No candidate yielded a lease in one balancing pass.
    #[error("no backend available for category '{0}'")]
    NoBackendAvailable(String),

    /// Caller disconnected. Releases resources, surfaces nothing.
    #[error("request canceled by caller")]
    Canceled,
}

impl GatewayError {
    /// Whether this outcome counts as a backend failure for breaker and
    /// health accounting.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendTransient(_)
                | GatewayError::BackendPermanent(_)
                | GatewayError::UpstreamTimeout(_)
                | GatewayError::CredentialFailure(_)
        )
    }

    /// Whether the orchestrator may re-balance onto a different pipeline
    /// (non-streaming requests only; the orchestrator also checks that no
    /// bytes have been sent).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendTransient(_) | GatewayError::UpstreamTimeout(_)
        )
    }

    /// Stable kind label for metrics and observation events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ClientFault(_) => "client_fault",
            GatewayError::TransformFault(_) => "transform_fault",
            GatewayError::BackendTransient(_) => "backend_transient",
            GatewayError::BackendPermanent(_) => "backend_permanent",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::CredentialFailure(_) => "credential_failure",
            GatewayError::CapacityExhausted => "capacity_exhausted",
            GatewayError::NoBackendAvailable(_) => "no_backend",
            GatewayError::Canceled => "canceled",
        }
    }

    /// Canonical error type string for the response body.
    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::ClientFault(_) => "invalid_request_error",
            GatewayError::TransformFault(_) => "api_error",
            GatewayError::BackendTransient(_) => "upstream_error",
            GatewayError::BackendPermanent(_) | GatewayError::CredentialFailure(_) => {
                "authentication_error"
            }
            GatewayError::UpstreamTimeout(_) => "timeout_error",
            GatewayError::CapacityExhausted | GatewayError::NoBackendAvailable(_) => {
                "overloaded_error"
            }
            GatewayError::Canceled => "request_canceled",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ClientFault(_) => StatusCode::BAD_REQUEST,
            GatewayError::TransformFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BackendTransient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BackendPermanent(_) | GatewayError::CredentialFailure(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::CapacityExhausted | GatewayError::NoBackendAvailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            // 499 is proxy lore, not a constructible status; the connection
            // is gone anyway so the code is never seen.
            GatewayError::Canceled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
            }
        });
        let mut response = (status, Json(body)).into_response();
        if matches!(
            self,
            GatewayError::CapacityExhausted | GatewayError::NoBackendAvailable(_)
        ) {
            response
                .headers_mut()
                .insert("retry-after", "1".parse().expect("static header"));
        }
        response
    }
}

/// Classify an upstream HTTP status plus body into the taxonomy.
///
/// 4xx with a well-formed upstream error body that maps to a client fault
/// (invalid tool schema and friends) is the caller's problem, not the
/// backend's. 429 is handled by the upstream client before this point when
/// a small `Retry-After` is present.
pub fn classify_upstream_status(status: reqwest::StatusCode, body: &str) -> GatewayError {
    let snippet: String = body.chars().take(300).collect();
    if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
        GatewayError::BackendTransient(format!("upstream returned {status}: {snippet}"))
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        GatewayError::BackendTransient(format!("upstream rate limited: {snippet}"))
    } else if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        GatewayError::BackendPermanent(format!("upstream auth rejected ({status}): {snippet}"))
    } else if status.is_client_error() {
        if is_client_fault_body(body) {
            GatewayError::ClientFault(format!("upstream rejected request ({status}): {snippet}"))
        } else {
            GatewayError::BackendPermanent(format!("upstream returned {status}: {snippet}"))
        }
    } else {
        GatewayError::BackendTransient(format!("unexpected upstream status {status}"))
    }
}

/// A 4xx maps back to the caller only when the upstream sent a parseable
/// error body blaming the request itself.
fn is_client_fault_body(body: &str) -> bool {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    let error_type = v
        .get("error")
        .and_then(|e| e.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    matches!(error_type, "invalid_request_error" | "invalid_parameter")
}
