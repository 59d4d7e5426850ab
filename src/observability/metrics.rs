//! # Metrics
//!
//! Prometheus metrics for monitoring decryption.
//!
//! ## Metrics Exposed
//!
//! - `kustomize_decryptor_sops_decryption_total` - Total number of SOPS document decryptions
//! - `kustomize_decryptor_sops_decryption_errors_total` - Decryption errors by kind
//! - `kustomize_decryptor_sops_decryption_duration_seconds` - Duration of document decryptions
//! - `kustomize_decryptor_integrity_failures_total` - MAC verification failures
//! - `kustomize_decryptor_files_decrypted_total` - Files decrypted in place
//! - `kustomize_decryptor_files_skipped_total` - Files left untouched for lack of a SOPS marker
//! - `kustomize_decryptor_overlays_visited_total` - Overlay directories visited by the walker
//! - `kustomize_decryptor_keys_imported_total` - Credentials imported by backend
//! - `kustomize_decryptor_resources_decrypted_total` - In-memory resources decrypted

use anyhow::Result;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::{LazyLock, OnceLock};

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

static SOPS_DECRYPTION_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_decryptor_sops_decryption_total",
        "Total number of SOPS document decryptions",
    )
    .expect("Failed to create SOPS_DECRYPTION_TOTAL metric - this should never happen")
});

static SOPS_DECRYPTION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kustomize_decryptor_sops_decryption_errors_total",
            "Total number of SOPS decryption errors by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create SOPS_DECRYPTION_ERRORS_TOTAL metric - this should never happen")
});

static SOPS_DECRYPTION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kustomize_decryptor_sops_decryption_duration_seconds",
            "Duration of SOPS document decryption in seconds",
        )
        .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
    )
    .expect("Failed to create SOPS_DECRYPTION_DURATION metric - this should never happen")
});

static INTEGRITY_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_decryptor_integrity_failures_total",
        "Total number of SOPS MAC verification failures",
    )
    .expect("Failed to create INTEGRITY_FAILURES_TOTAL metric - this should never happen")
});

static FILES_DECRYPTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_decryptor_files_decrypted_total",
        "Total number of files decrypted in place",
    )
    .expect("Failed to create FILES_DECRYPTED_TOTAL metric - this should never happen")
});

static FILES_SKIPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_decryptor_files_skipped_total",
        "Total number of files skipped because they carry no SOPS marker",
    )
    .expect("Failed to create FILES_SKIPPED_TOTAL metric - this should never happen")
});

static OVERLAYS_VISITED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_decryptor_overlays_visited_total",
        "Total number of overlay directories visited",
    )
    .expect("Failed to create OVERLAYS_VISITED_TOTAL metric - this should never happen")
});

static KEYS_IMPORTED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kustomize_decryptor_keys_imported_total",
            "Total number of decryption credentials imported by backend",
        ),
        &["backend"],
    )
    .expect("Failed to create KEYS_IMPORTED_TOTAL metric - this should never happen")
});

static RESOURCES_DECRYPTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kustomize_decryptor_resources_decrypted_total",
        "Total number of in-memory resources decrypted",
    )
    .expect("Failed to create RESOURCES_DECRYPTED_TOTAL metric - this should never happen")
});

/// Register every metric with the process registry. Calling it again is a no-op.
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTERED
        .get_or_init(|| register_all().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| anyhow::anyhow!("failed to register metrics: {e}"))
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SOPS_DECRYPTION_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SOPS_DECRYPTION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SOPS_DECRYPTION_DURATION.clone()))?;
    REGISTRY.register(Box::new(INTEGRITY_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FILES_DECRYPTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FILES_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OVERLAYS_VISITED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KEYS_IMPORTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESOURCES_DECRYPTED_TOTAL.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text exposition format
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn gather_text() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn increment_sops_decryption_total() {
    SOPS_DECRYPTION_TOTAL.inc();
}

pub fn increment_sops_decryption_errors(kind: &str) {
    SOPS_DECRYPTION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_sops_decryption_duration(duration: f64) {
    SOPS_DECRYPTION_DURATION.observe(duration);
}

pub fn increment_integrity_failures() {
    INTEGRITY_FAILURES_TOTAL.inc();
}

pub fn increment_files_decrypted() {
    FILES_DECRYPTED_TOTAL.inc();
}

pub fn increment_files_skipped() {
    FILES_SKIPPED_TOTAL.inc();
}

pub fn increment_overlays_visited() {
    OVERLAYS_VISITED_TOTAL.inc();
}

pub fn increment_keys_imported(backend: &str) {
    KEYS_IMPORTED_TOTAL.with_label_values(&[backend]).inc();
}

pub fn increment_resources_decrypted() {
    RESOURCES_DECRYPTED_TOTAL.inc();
}
