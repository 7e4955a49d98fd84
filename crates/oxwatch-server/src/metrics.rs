use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder once and returns its handle. If
/// another recorder is already installed, a detached recorder is used and
/// `/metrics` only shows what it receives.
pub fn init_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install Prometheus recorder, using a detached one");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}
