//! relaymux — multi-provider LLM gateway.
//!
//! Accepts Anthropic-format chat requests (plus an OpenAI-compatible
//! alias), classifies them into routing categories, picks a backend under
//! health/breaker-aware load balancing, and translates to and from each
//! provider's wire format, streaming included.

pub mod balance;
pub mod breaker;
pub mod classify;
pub mod codec;
pub mod compat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod frontend;
pub mod metrics;
pub mod observe;
pub mod orchestrator;
pub mod registry;
pub mod stream;
pub mod types;
pub mod upstream;
pub mod validate;

use std::sync::Arc;

use crate::balance::LoadBalancer;
use crate::config::{GatewayConfig, RoutingTable, TableHandle};
use crate::credentials::{CredentialSpec, CredentialStore};
use crate::observe::SinkSet;
use crate::orchestrator::GatewayContext;
use crate::registry::BackendRegistry;
use crate::upstream::UpstreamClient;

/// Wire a full gateway context from parsed configuration. Used by `main`
/// and by the integration tests, which build tables programmatically.
pub fn build_context(
    config: GatewayConfig,
    table: RoutingTable,
    credentials: std::collections::HashMap<String, CredentialSpec>,
) -> GatewayContext {
    let registry = Arc::new(BackendRegistry::new(
        &table,
        config.breaker(),
        config.health(),
    ));
    let credentials = Arc::new(CredentialStore::new(credentials));
    GatewayContext {
        upstream: Arc::new(UpstreamClient::new(config.clone(), credentials)),
        config,
        table: Arc::new(TableHandle::new(table)),
        registry,
        balancer: Arc::new(LoadBalancer::new()),
        observer: Arc::new(SinkSet::standard()),
    }
}

/// The axum router over a gateway context.
pub fn router(ctx: GatewayContext) -> axum::Router {
    use axum::routing::{get, post};
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    axum::Router::new()
        .route("/v1/messages", post(orchestrator::handle_messages))
        .route(
            "/v1/chat/completions",
            post(orchestrator::handle_chat_completions),
        )
        .route("/health", get(orchestrator::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
