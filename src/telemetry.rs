use metrics::{Counter, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

use crate::VitalsError;

/// Handles for everything the analyzer reports.
///
/// Handles are resolved against whatever recorder is installed when the
/// struct is built; with no recorder they are no-ops.
pub struct VitalsMetrics {
    pub analyses_total: Counter,
    pub analyses_failed: Counter,
    pub analysis_duration: Histogram,
    pub network_probe_duration: Histogram,
    pub browser_probe_duration: Histogram,
    pub link_checks_total: Counter,
    pub link_checks_failed: Counter,
    pub link_check_duration: Histogram,
}

impl VitalsMetrics {
    pub fn new() -> Self {
        Self {
            analyses_total: metrics::register_counter!("analyses_total"),
            analyses_failed: metrics::register_counter!("analyses_failed"),
            analysis_duration: metrics::register_histogram!("analysis_duration_seconds"),
            network_probe_duration: metrics::register_histogram!("network_probe_duration_seconds"),
            browser_probe_duration: metrics::register_histogram!("browser_probe_duration_seconds"),
            link_checks_total: metrics::register_counter!("link_checks_total"),
            link_checks_failed: metrics::register_counter!("link_checks_failed"),
            link_check_duration: metrics::register_histogram!("link_check_duration_seconds"),
        }
    }

    pub fn record_analysis(&self, duration: Duration, success: bool) {
        self.analyses_total.increment(1);
        if !success {
            self.analyses_failed.increment(1);
        }

        self.analysis_duration.record(duration.as_secs_f64());
    }

    pub fn record_network_probe(&self, duration: Duration) {
        self.network_probe_duration.record(duration.as_secs_f64());
    }

    pub fn record_browser_probe(&self, duration: Duration) {
        self.browser_probe_duration.record(duration.as_secs_f64());
    }

    pub fn record_link_check(&self, duration: Duration, reachable: bool) {
        self.link_checks_total.increment(1);
        if !reachable {
            self.link_checks_failed.increment(1);
        }

        self.link_check_duration.record(duration.as_secs_f64());
    }
}

impl Default for VitalsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the process-wide Prometheus recorder and return the handle that renders it.
///
/// Must run before any `VitalsMetrics` is built, otherwise those handles stay no-ops.
pub fn install_prometheus() -> Result<PrometheusHandle, VitalsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| VitalsError::Configuration(format!("Failed to install metrics recorder: {e}")))?;

    info!("Prometheus recorder installed");

    Ok(handle)
}
