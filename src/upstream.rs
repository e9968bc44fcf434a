//! Upstream HTTP client (chain stage 4).
//!
//! Issues the encoded request under the caller's lease. Non-streaming
//! calls retry on retryable failures within the same pipeline, with
//! exponential backoff, because they are idempotent from the upstream's
//! point of view; streaming calls get exactly one attempt and hand their
//! response body to the SSE engine.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{GatewayConfig, PipelineEntry, ProviderType};
use crate::credentials::{AuthHeader, CredentialStore};
use crate::error::{classify_upstream_status, GatewayError};

/// Base delay for same-pipeline retries.
const RETRY_BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Ceiling for same-pipeline retry backoff.
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// A 429 `Retry-After` above this budget is not worth waiting for; it
/// becomes a transient backend failure instead.
const RETRY_AFTER_BUDGET: Duration = Duration::from_secs(2);

pub struct UpstreamClient {
    config: GatewayConfig,
    credentials: Arc<CredentialStore>,
}

impl UpstreamClient {
    pub fn new(config: GatewayConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            config,
            credentials,
        }
    }

    /// Exponential backoff for attempt n (0-indexed), clamped to the ceiling.
    fn backoff(attempt: u32) -> Duration {
        let ms = RETRY_BASE_BACKOFF.as_millis() as u64;
        Duration::from_millis(ms.saturating_mul(2u64.saturating_pow(attempt))).min(RETRY_MAX_BACKOFF)
    }

    fn build_headers(
        &self,
        entry: &PipelineEntry,
    ) -> Result<HeaderMap, GatewayError> {
        let auth = self.credentials.resolve(&entry.credential_ref).map_err(|e| {
            GatewayError::CredentialFailure(format!("{}: {e}", entry.pipeline_id))
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let header_value = |value: &str| {
            HeaderValue::from_str(value).map_err(|_| {
                GatewayError::CredentialFailure(format!(
                    "{}: credential contains invalid header bytes",
                    entry.pipeline_id
                ))
            })
        };

        match (entry.provider_type, auth) {
            (_, AuthHeader::None) => {}
            (ProviderType::Anthropic, AuthHeader::ApiKey(key) | AuthHeader::Bearer(key)) => {
                headers.insert("x-api-key", header_value(&key)?);
                headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            }
            (ProviderType::Gemini, AuthHeader::ApiKey(key) | AuthHeader::Bearer(key)) => {
                headers.insert("x-goog-api-key", header_value(&key)?);
            }
            (
                ProviderType::OpenaiCompatible | ProviderType::Codewhisperer,
                AuthHeader::ApiKey(key) | AuthHeader::Bearer(key),
            ) => {
                headers.insert("authorization", header_value(&format!("Bearer {key}"))?);
            }
        }
        Ok(headers)
    }

    fn url(entry: &PipelineEntry, path: &str) -> String {
        format!("{}{}", entry.endpoint_url.trim_end_matches('/'), path)
    }

    async fn send_once(
        &self,
        entry: &PipelineEntry,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let headers = self.build_headers(entry)?;
        let response = self
            .config
            .http_client()
            .post(Self::url(entry, path))
            .headers(headers)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::UpstreamTimeout(timeout)
                } else {
                    GatewayError::BackendTransient(format!("upstream connect: {e}"))
                }
            })?;
        Ok(response)
    }

    /// Non-streaming call: full body in, full body out, with same-pipeline
    /// retries up to `entry.max_retries`.
    pub async fn send_json(
        &self,
        entry: &PipelineEntry,
        path: &str,
        body: &Value,
    ) -> Result<Value, GatewayError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_json_attempt(entry, path, body).await {
                Ok(value) => return Ok(value),
                Err(RetryableStep::RetryAfter(wait)) => {
                    // 429 inside the budget: wait it out in place. Does not
                    // consume a retry attempt and never feeds the breaker.
                    debug!(
                        pipeline = %entry.pipeline_id,
                        wait_ms = wait.as_millis() as u64,
                        "honoring upstream retry-after"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(RetryableStep::Fail(err)) => {
                    if err.is_retryable() && attempt < entry.max_retries {
                        let backoff = Self::backoff(attempt);
                        warn!(
                            pipeline = %entry.pipeline_id,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "retrying upstream call"
                        );
                        attempt += 1;
                        tokio::time::sleep(backoff).await;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn send_json_attempt(
        &self,
        entry: &PipelineEntry,
        path: &str,
        body: &Value,
    ) -> Result<Value, RetryableStep> {
        let response = self
            .send_once(entry, path, body, entry.timeout())
            .await
            .map_err(RetryableStep::Fail)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().await.map_err(|e| {
                RetryableStep::Fail(GatewayError::BackendTransient(format!(
                    "upstream body read: {e}"
                )))
            });
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if let Some(wait) = retry_after(response.headers()) {
                if wait <= RETRY_AFTER_BUDGET {
                    return Err(RetryableStep::RetryAfter(wait));
                }
            }
        }

        let text = response.text().await.unwrap_or_default();
        Err(RetryableStep::Fail(classify_upstream_status(status, &text)))
    }

    /// Streaming call: one attempt, the response body goes to the SSE
    /// engine. Streams are never retried mid-flight.
    pub async fn send_stream(
        &self,
        entry: &PipelineEntry,
        path: &str,
        body: &Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self.send_once(entry, path, body, entry.timeout()).await?;

        let status = response.status();
        if !status.is_success() {
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if let Some(wait) = retry_after(response.headers()) {
                    if wait <= RETRY_AFTER_BUDGET {
                        tokio::time::sleep(wait).await;
                        let retried = self.send_once(entry, path, body, entry.timeout()).await?;
                        if retried.status().is_success() {
                            return Ok(retried);
                        }
                        let status = retried.status();
                        let text = retried.text().await.unwrap_or_default();
                        return Err(classify_upstream_status(status, &text));
                    }
                }
            }
            let text = response.text().await.unwrap_or_default();
            return Err(classify_upstream_status(status, &text));
        }
        Ok(response)
    }

    /// Minimal health probe: one tiny non-streaming request under the
    /// probe timeout. Any 2xx counts as alive.
    pub async fn probe(&self, entry: &PipelineEntry, timeout: Duration) -> bool {
        let codec = crate::codec::codec_for(entry.provider_type);
        let probe_request: crate::types::ChatRequest = match serde_json::from_value(
            serde_json::json!({
                "model": entry.upstream_model,
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1
            }),
        ) {
            Ok(req) => req,
            Err(_) => return false,
        };
        let Ok(body) = codec.encode_request(&probe_request, entry) else {
            return false;
        };
        let path = codec.request_path(entry, false);

        match self.send_once(entry, &path, &body, timeout).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

enum RetryableStep {
    /// 429 with an acceptable Retry-After: wait, then try again in place.
    RetryAfter(Duration),
    Fail(GatewayError),
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_clamps() {
        assert_eq!(UpstreamClient::backoff(0), Duration::from_millis(100));
        assert_eq!(UpstreamClient::backoff(1), Duration::from_millis(200));
        assert_eq!(UpstreamClient::backoff(3), Duration::from_millis(800));
        assert_eq!(UpstreamClient::backoff(20), Duration::from_secs(10));
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("1"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(1)));

        headers.insert("retry-after", HeaderValue::from_static("nonsense"));
        assert_eq!(retry_after(&headers), None);

        assert_eq!(retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn url_joins_without_double_slash() {
        let entry: PipelineEntry = serde_json::from_value(serde_json::json!({
            "pipeline_id": "p",
            "provider_id": "p",
            "provider_type": "openai_compatible",
            "endpoint_url": "http://host:1234/",
            "credential_ref": "local",
            "upstream_model": "m"
        }))
        .unwrap();
        assert_eq!(
            UpstreamClient::url(&entry, "/v1/chat/completions"),
            "http://host:1234/v1/chat/completions"
        );
    }
}
