/// Prometheus metrics collection for Credential Guard
///
/// This module tracks encryption activity, admission decisions and audit
/// log health. Components also keep per-instance counters; these process-wide
/// series exist for scraping.
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Encryption engine
    /// Successful encryptions, labelled by caller context
    pub static ref ENCRYPTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "credential_guard_encryptions_total",
            "Total number of successful encryptions"
        ),
        &["context"]
    ).unwrap();

    /// Successful decryptions, labelled by caller context
    pub static ref DECRYPTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "credential_guard_decryptions_total",
            "Total number of successful decryptions"
        ),
        &["context"]
    ).unwrap();

    /// Failed encrypt/decrypt operations
    pub static ref CRYPTO_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "credential_guard_crypto_failures_total",
            "Total number of failed encryption or decryption operations"
        ),
        &["operation"]
    ).unwrap();

    // Admission controller
    /// Admission checks evaluated
    pub static ref ADMISSION_REQUESTS: IntCounter = IntCounter::new(
        "credential_guard_admission_requests_total",
        "Total number of admission checks"
    ).unwrap();

    /// Admission denials by reason
    pub static ref ADMISSION_DENIED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "credential_guard_admission_denied_total",
            "Total number of denied admission checks"
        ),
        &["reason"]
    ).unwrap();

    /// Anomaly trips
    pub static ref ANOMALIES: IntCounter = IntCounter::new(
        "credential_guard_anomalies_total",
        "Total number of anomaly-triggered provider blocks"
    ).unwrap();

    // Audit log
    /// Audit events written, by event type
    pub static ref AUDIT_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "credential_guard_audit_events_total",
            "Total number of audit events written"
        ),
        &["event_type"]
    ).unwrap();

    /// Failed audit appends
    pub static ref AUDIT_WRITE_FAILURES: IntCounter = IntCounter::new(
        "credential_guard_audit_write_failures_total",
        "Total number of audit events that could not be written"
    ).unwrap();

    /// Audit file rotations
    pub static ref AUDIT_ROTATIONS: IntCounter = IntCounter::new(
        "credential_guard_audit_rotations_total",
        "Total number of audit log rotations"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize and register all metrics (idempotent - can be called multiple times)
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(ENCRYPTIONS.clone()))
            .expect("Failed to register ENCRYPTIONS metric");
        REGISTRY
            .register(Box::new(DECRYPTIONS.clone()))
            .expect("Failed to register DECRYPTIONS metric");
        REGISTRY
            .register(Box::new(CRYPTO_FAILURES.clone()))
            .expect("Failed to register CRYPTO_FAILURES metric");

        REGISTRY
            .register(Box::new(ADMISSION_REQUESTS.clone()))
            .expect("Failed to register ADMISSION_REQUESTS metric");
        REGISTRY
            .register(Box::new(ADMISSION_DENIED.clone()))
            .expect("Failed to register ADMISSION_DENIED metric");
        REGISTRY
            .register(Box::new(ANOMALIES.clone()))
            .expect("Failed to register ANOMALIES metric");

        REGISTRY
            .register(Box::new(AUDIT_EVENTS.clone()))
            .expect("Failed to register AUDIT_EVENTS metric");
        REGISTRY
            .register(Box::new(AUDIT_WRITE_FAILURES.clone()))
            .expect("Failed to register AUDIT_WRITE_FAILURES metric");
        REGISTRY
            .register(Box::new(AUDIT_ROTATIONS.clone()))
            .expect("Failed to register AUDIT_ROTATIONS metric");
    });
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
