//! Credential resolution for upstream calls.
//!
//! The pipeline holds opaque refs; each request asks the store for a
//! current header value. Token contents are never cached by callers, so a
//! rotated credential takes effect on the next request.

use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

/// One credential as declared in the config file. `${ENV}` references in
/// `value` are expanded at config load, before this struct exists.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSpec {
    /// Plain API key, sent the provider's way (`x-api-key` or bearer).
    ApiKey { value: String },
    /// Bearer token, e.g. an SSO-minted access token maintained by an
    /// external refresher that rewrites the config.
    Bearer { value: String },
    /// No authentication (local upstreams like lmstudio/ollama).
    None,
}

/// How the resolved credential should be attached to the upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthHeader {
    ApiKey(String),
    Bearer(String),
    None,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown credential ref '{0}'")]
    UnknownRef(String),
    #[error("credential '{0}' resolved to an empty value")]
    Empty(String),
}

/// Resolves `credential_ref` values to header material on demand.
pub struct CredentialStore {
    specs: HashMap<String, CredentialSpec>,
}

impl CredentialStore {
    pub fn new(specs: HashMap<String, CredentialSpec>) -> Self {
        Self { specs }
    }

    /// Resolve a ref to its current header value. Failures are permanent
    /// backend errors: the caller marks the backend unhealthy and opens
    /// its breaker.
    pub fn resolve(&self, credential_ref: &str) -> Result<AuthHeader, CredentialError> {
        let spec = self
            .specs
            .get(credential_ref)
            .ok_or_else(|| CredentialError::UnknownRef(credential_ref.to_string()))?;

        match spec {
            CredentialSpec::ApiKey { value } => {
                if value.is_empty() {
                    return Err(CredentialError::Empty(credential_ref.to_string()));
                }
                Ok(AuthHeader::ApiKey(value.clone()))
            }
            CredentialSpec::Bearer { value } => {
                if value.is_empty() {
                    return Err(CredentialError::Empty(credential_ref.to_string()));
                }
                Ok(AuthHeader::Bearer(value.clone()))
            }
            CredentialSpec::None => Ok(AuthHeader::None),
        }
    }
}
