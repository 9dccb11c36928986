// doc-chat/crates/doc-chat/src/metrics.rs

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_STREAMS: OnceLock<IntGauge> = OnceLock::new();
static DOCUMENT_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static TOKENS: OnceLock<IntCounterVec> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .expect("valid requests_total definition")
    });

    let active_streams = ACTIVE_STREAMS.get_or_init(|| {
        IntGauge::new("active_streams", "Chat turns currently streaming").expect("valid active_streams definition")
    });

    let document_failures = DOCUMENT_FAILURES.get_or_init(|| {
        IntCounter::new("document_failures_total", "Uploaded documents skipped after a processing failure")
            .expect("valid document_failures_total definition")
    });

    let tokens = TOKENS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("tokens_total", "Provider-reported tokens by usage kind"),
            &["kind"],
        )
        .expect("valid tokens_total definition")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(active_streams.clone())).ok();
    REGISTRY.register(Box::new(document_failures.clone())).ok();
    REGISTRY.register(Box::new(tokens.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.inc();
    }
}

pub fn dec_streams() {
    if let Some(gauge) = ACTIVE_STREAMS.get() {
        gauge.dec();
    }
}

pub fn inc_document_failures() {
    if let Some(counter) = DOCUMENT_FAILURES.get() {
        counter.inc();
    }
}

pub fn add_tokens(kind: &str, count: u64) {
    if let Some(counter) = TOKENS.get() {
        counter.with_label_values(&[kind]).inc_by(count);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, [("content-type", "text/plain")], Vec::new());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
