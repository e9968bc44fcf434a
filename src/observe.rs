//! Structured observation events.
//!
//! The pipeline emits one [`PipelineEvent`] at each stage boundary through a
//! single [`ObservationSink`]. Sinks are passive consumers: the tracing sink
//! logs, the metrics sink updates Prometheus series. Persisting or shipping
//! events anywhere else is somebody else's job.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::Category;

/// One stage-boundary event for a single request.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RequestReceived {
        request_id: String,
        model_hint: String,
        stream: bool,
    },
    CategoryChosen {
        request_id: String,
        category: Category,
    },
    BackendSelected {
        request_id: String,
        pipeline_id: String,
        attempt: u32,
    },
    UpstreamBegin {
        request_id: String,
        pipeline_id: String,
    },
    UpstreamChunk {
        request_id: String,
        bytes: usize,
    },
    UpstreamEnd {
        request_id: String,
        pipeline_id: String,
        latency: Duration,
    },
    ResponseSent {
        request_id: String,
        status: u16,
    },
    Error {
        request_id: String,
        pipeline_id: Option<String>,
        kind: &'static str,
        message: String,
    },
}

/// The one seam between the pipeline and the outside world's observability.
pub trait ObservationSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Logs events with `tracing` structured fields.
pub struct TracingSink;

impl ObservationSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RequestReceived {
                request_id,
                model_hint,
                stream,
            } => {
                info!(request = %request_id, model = %model_hint, stream, "request received");
            }
            PipelineEvent::CategoryChosen {
                request_id,
                category,
            } => {
                debug!(request = %request_id, category = %category, "category chosen");
            }
            PipelineEvent::BackendSelected {
                request_id,
                pipeline_id,
                attempt,
            } => {
                debug!(request = %request_id, pipeline = %pipeline_id, attempt, "backend selected");
            }
            PipelineEvent::UpstreamBegin {
                request_id,
                pipeline_id,
            } => {
                debug!(request = %request_id, pipeline = %pipeline_id, "upstream call begin");
            }
            PipelineEvent::UpstreamChunk { request_id, bytes } => {
                trace!(request = %request_id, bytes, "upstream chunk");
            }
            PipelineEvent::UpstreamEnd {
                request_id,
                pipeline_id,
                latency,
            } => {
                debug!(
                    request = %request_id,
                    pipeline = %pipeline_id,
                    latency_ms = latency.as_millis() as u64,
                    "upstream call end"
                );
            }
            PipelineEvent::ResponseSent { request_id, status } => {
                info!(request = %request_id, status, "response sent");
            }
            PipelineEvent::Error {
                request_id,
                pipeline_id,
                kind,
                message,
            } => {
                warn!(
                    request = %request_id,
                    pipeline = pipeline_id.as_deref().unwrap_or("-"),
                    kind,
                    %message,
                    "pipeline error"
                );
            }
        }
    }
}

/// Updates the Prometheus series in `metrics`.
pub struct MetricsSink;

impl ObservationSink for MetricsSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::BackendSelected { pipeline_id, .. } => {
                crate::metrics::record_request(pipeline_id);
            }
            PipelineEvent::UpstreamEnd {
                pipeline_id,
                latency,
                ..
            } => {
                crate::metrics::record_upstream_latency(pipeline_id, latency.as_secs_f64());
            }
            PipelineEvent::Error {
                pipeline_id, kind, ..
            } => {
                crate::metrics::record_failure(pipeline_id.as_deref().unwrap_or("none"), kind);
            }
            _ => {}
        }
    }
}

/// Fans one event out to every registered sink.
pub struct SinkSet {
    sinks: Vec<Arc<dyn ObservationSink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn ObservationSink>>) -> Self {
        Self { sinks }
    }

    pub fn standard() -> Self {
        Self::new(vec![Arc::new(TracingSink), Arc::new(MetricsSink)])
    }

    pub fn emit(&self, event: PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }
}
