//! Prometheus metrics for the keepsake server.
//!
//! Exposes counters for upload sessions, chunk traffic, verification
//! failures and asset tiers, plus finish latency and arena usage.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Metrics carry no principals, capsule or memory IDs. Restrict the endpoint
//! to scraper addresses at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Registry for all keepsake metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload session metrics
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_RESUMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_resumed_total",
        "Total number of begin calls answered with an existing session",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FINISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_finished_total",
        "Total number of upload sessions finished into an asset",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_aborted_total",
        "Total number of upload sessions aborted by their owner",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_upload_sessions_expired_total",
        "Total number of unfinished upload sessions removed by the expiry sweep",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_chunks_received_total",
        "Total number of chunk writes accepted, including re-sends",
    )
    .expect("metric creation failed")
});

pub static CHUNK_BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_chunk_bytes_received_total",
        "Total chunk bytes accepted",
    )
    .expect("metric creation failed")
});

// Verification failures
pub static CHECKSUM_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_checksum_mismatches_total",
        "Total number of finished payloads whose SHA-256 did not match",
    )
    .expect("metric creation failed")
});

pub static SIZE_MISMATCHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keepsake_size_mismatches_total",
        "Total number of finished payloads whose length did not match",
    )
    .expect("metric creation failed")
});

// Asset metrics
pub static ASSETS_STORED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("keepsake_assets_stored_total", "Total assets stored by tier"),
        &["tier"],
    )
    .expect("metric creation failed")
});

pub static ASSETS_RESOLVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keepsake_assets_resolved_total",
            "Total asset resolutions by the tier that served them",
        ),
        &["tier"],
    )
    .expect("metric creation failed")
});

pub static FINISH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "keepsake_upload_finish_duration_seconds",
            "Time to verify and store a finished upload",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

pub static ARENA_BYTES_IN_USE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "keepsake_arena_bytes_in_use",
        "Arena bytes reserved by chunks and Internal-tier assets",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keepsake_upload_errors_total",
            "Total upload operation failures by error code",
        ),
        &["code"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the registry.
///
/// Idempotent, so integration tests can build any number of routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_RESUMED.clone()),
            Box::new(UPLOAD_SESSIONS_FINISHED.clone()),
            Box::new(UPLOAD_SESSIONS_ABORTED.clone()),
            Box::new(UPLOAD_SESSIONS_EXPIRED.clone()),
            Box::new(CHUNKS_RECEIVED.clone()),
            Box::new(CHUNK_BYTES_RECEIVED.clone()),
            Box::new(CHECKSUM_MISMATCHES.clone()),
            Box::new(SIZE_MISMATCHES.clone()),
            Box::new(ASSETS_STORED.clone()),
            Box::new(ASSETS_RESOLVED.clone()),
            Box::new(FINISH_DURATION.clone()),
            Box::new(ARENA_BYTES_IN_USE.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record a failed upload operation by its error code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
    match code {
        "checksum_mismatch" => CHECKSUM_MISMATCHES.inc(),
        "size_mismatch" => SIZE_MISMATCHES.inc(),
        _ => {}
    }
}

/// Publish the arena's current usage.
pub fn set_arena_bytes_in_use(bytes: u64) {
    ARENA_BYTES_IN_USE.set(i64::try_from(bytes).unwrap_or(i64::MAX));
}
