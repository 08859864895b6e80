//! Prometheus metrics recording and endpoint.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use rusty_dial_core::types::{CallState, Direction};
use rusty_dial_media::call::CallRecord;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus metrics recorder (once per process) and return the
/// handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))?;
    Ok(HANDLE.get_or_init(|| handle).clone())
}

/// Record an admitted call.
pub fn record_call_opened(direction: Direction) {
    let labels = [("direction", format!("{direction:?}").to_lowercase())];
    metrics::counter!("calls_total", &labels).increment(1);
    metrics::gauge!("calls_active").increment(1.0);
}

/// Record a call leaving the live table, with its barge-ins and duration.
pub fn record_call_ended(record: &CallRecord) {
    metrics::gauge!("calls_active").decrement(1.0);
    let labels = [("reason", record.end_reason.code().to_string())];
    metrics::counter!("calls_ended_total", &labels).increment(1);
    metrics::histogram!("call_duration_seconds").record(record.duration_ms as f64 / 1000.0);

    let barge_ins = record
        .transitions
        .iter()
        .filter(|t| t.to == CallState::Interrupted)
        .count();
    metrics::counter!("barge_ins_total").increment(barge_ins as u64);
}

/// Record a call refused at admission.
pub fn record_call_rejected(reason: &str) {
    let labels = [("reason", reason.to_string())];
    metrics::counter!("calls_rejected_total", &labels).increment(1);
}

/// Record a control-plane action with its duration.
pub fn record_request(action: &str, duration_secs: f64) {
    let labels = [("action", action.to_string())];
    metrics::counter!("control_requests_total", &labels).increment(1);
    metrics::histogram!("control_request_duration_seconds", &labels).record(duration_secs);
}
