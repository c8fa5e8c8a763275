//! Metrics facade + Prometheus exporter (SPEC_FULL.md §2.9), modeled on the
//! teacher's `proxy::metrics` + `http::health_server` pairing but built on
//! the public `metrics`/`metrics-exporter-prometheus` crates since the
//! teacher's own `libs/metrics` crate had no retrievable source.

use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<metrics_exporter_prometheus::PrometheusHandle> = OnceCell::new();

pub fn init() {
    let builder = PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => {
            let _ = HANDLE.set(handle);
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install prometheus recorder");
        }
    }
}

pub fn render() -> String {
    HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_else(|| String::new())
}

pub fn record_request(backend: &str, outcome: &'static str) {
    metrics::counter!("idle_proxy_requests_total", "backend" => backend.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_driver_call(kind: &'static str, outcome: &'static str) {
    metrics::counter!("idle_proxy_driver_calls_total", "op" => kind, "outcome" => outcome)
        .increment(1);
}

pub fn record_stop(backend: &str, reason: &'static str) {
    metrics::counter!("idle_proxy_stops_total", "backend" => backend.to_string(), "reason" => reason)
        .increment(1);
}
