//! Prometheus metrics for relay processes.
//!
//! All metrics follow the naming convention `relay_<component>_<metric>` and
//! carry a `role` label naming the registry (`proxy`, `worker`, ...). The
//! correlation core keeps its own atomic counters; the runtime copies them
//! here with [`observe_registry`].

use lazy_static::lazy_static;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref ENVELOPES_VENTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_registry_envelopes_vented", "Envelopes published since start"),
        &["role"]
    ).expect("metric creation failed");

    pub static ref ENVELOPES_DISPATCHED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_registry_envelopes_dispatched", "Envelopes matched to a handler and acked"),
        &["role"]
    ).expect("metric creation failed");

    pub static ref ENVELOPES_NACKED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_registry_envelopes_nacked", "Envelopes returned to the transport unmatched"),
        &["role"]
    ).expect("metric creation failed");

    pub static ref DECODE_FAILURES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_registry_decode_failures", "Malformed payloads dropped"),
        &["role"]
    ).expect("metric creation failed");

    pub static ref WAIT_TIMEOUTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_registry_wait_timeouts", "Waits that ended without a reply"),
        &["role"]
    ).expect("metric creation failed");

    pub static ref ACTIVE_REGISTRATIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_registry_active_registrations", "Entries in the callback table"),
        &["role"]
    ).expect("metric creation failed");

    pub static ref DISPATCH_RUNNING: IntGaugeVec = IntGaugeVec::new(
        Opts::new("relay_dispatch_running", "1 while the dispatch loop is running"),
        &["role"]
    ).expect("metric creation failed");
}

/// Point-in-time registry figures, as reported by the correlation core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryMetrics {
    pub vented: u64,
    pub dispatched: u64,
    pub nacked: u64,
    pub decode_failures: u64,
    pub wait_timeouts: u64,
    pub registrations: usize,
    pub dispatch_running: bool,
}

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ENVELOPES_VENTED.clone()),
        Box::new(ENVELOPES_DISPATCHED.clone()),
        Box::new(ENVELOPES_NACKED.clone()),
        Box::new(DECODE_FAILURES.clone()),
        Box::new(WAIT_TIMEOUTS.clone()),
        Box::new(ACTIVE_REGISTRATIONS.clone()),
        Box::new(DISPATCH_RUNNING.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Publish a registry snapshot under `role`.
pub fn observe_registry(role: &str, metrics: &RegistryMetrics) {
    ENVELOPES_VENTED.with_label_values(&[role]).set(saturating_i64(metrics.vented));
    ENVELOPES_DISPATCHED.with_label_values(&[role]).set(saturating_i64(metrics.dispatched));
    ENVELOPES_NACKED.with_label_values(&[role]).set(saturating_i64(metrics.nacked));
    DECODE_FAILURES.with_label_values(&[role]).set(saturating_i64(metrics.decode_failures));
    WAIT_TIMEOUTS.with_label_values(&[role]).set(saturating_i64(metrics.wait_timeouts));
    ACTIVE_REGISTRATIONS
        .with_label_values(&[role])
        .set(i64::try_from(metrics.registrations).unwrap_or(i64::MAX));
    DISPATCH_RUNNING
        .with_label_values(&[role])
        .set(i64::from(metrics.dispatch_running));
}

/// Encode all metrics in the Prometheus text format.
pub fn gather_text() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
