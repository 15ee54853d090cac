//! Self-observability registry for the controller.
//!
//! Everything here lands in a dedicated registry under the
//! `resource_state_metrics` namespace so the controller's own counters never
//! mix with the user-defined resource metrics served by the main endpoint.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Outcome label values for CEL evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CelOutcome {
    Success,
    Error,
    Timeout,
}

impl CelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CelOutcome::Success => "success",
            CelOutcome::Error => "error",
            CelOutcome::Timeout => "timeout",
        }
    }
}

/// Handle over the telemetry registry and its metric families.
pub struct Telemetry {
    registry: Registry,
    http_request_duration_seconds: HistogramVec,
    resources_monitored_info: IntGaugeVec,
    events_processed_total: IntCounterVec,
    config_parse_errors_total: IntCounterVec,
    cel_evaluations_total: IntCounterVec,
}

impl Telemetry {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some(crate::version::TELEMETRY_NAMESPACE.into()), None)?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "A histogram of requests for the main server's metrics endpoints.",
            ),
            &["method", "code"],
        )?;
        let resources_monitored_info = IntGaugeVec::new(
            Opts::new(
                "resources_monitored_info",
                "ResourceMetricsMonitors currently backed by live stores.",
            ),
            &["namespace", "name"],
        )?;
        let events_processed_total = IntCounterVec::new(
            Opts::new(
                "events_processed_total",
                "Managed-resource events processed, grouped by outcome.",
            ),
            &["namespace", "name", "event_type", "status"],
        )?;
        let config_parse_errors_total = IntCounterVec::new(
            Opts::new(
                "config_parse_errors_total",
                "Configuration payloads that failed to parse.",
            ),
            &["namespace", "name"],
        )?;
        let cel_evaluations_total = IntCounterVec::new(
            Opts::new(
                "cel_evaluations_total",
                "CEL expression evaluations, grouped by result.",
            ),
            &["namespace", "name", "family", "result"],
        )?;

        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "Build information for the controller."),
            &["version", "revision"],
        )?;
        build_info
            .with_label_values(&[crate::version::semver(), crate::version::revision()])
            .set(1);

        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(resources_monitored_info.clone()))?;
        registry.register(Box::new(events_processed_total.clone()))?;
        registry.register(Box::new(config_parse_errors_total.clone()))?;
        registry.register(Box::new(cel_evaluations_total.clone()))?;
        registry.register(Box::new(build_info))?;
        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            http_request_duration_seconds,
            resources_monitored_info,
            events_processed_total,
            config_parse_errors_total,
            cel_evaluations_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the Prometheus text format.
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }

    pub fn observe_request(&self, method: &str, code: u16, seconds: f64) {
        self.http_request_duration_seconds
            .with_label_values(&[method, &code.to_string()])
            .observe(seconds);
    }

    pub fn mark_monitored(&self, namespace: &str, name: &str) {
        self.resources_monitored_info
            .with_label_values(&[namespace, name])
            .set(1);
    }

    pub fn clear_monitored(&self, namespace: &str, name: &str) {
        let _ = self
            .resources_monitored_info
            .remove_label_values(&[namespace, name]);
    }

    pub fn record_event(&self, namespace: &str, name: &str, event_type: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.events_processed_total
            .with_label_values(&[namespace, name, event_type, status])
            .inc();
    }

    pub fn record_parse_error(&self, namespace: &str, name: &str) {
        self.config_parse_errors_total
            .with_label_values(&[namespace, name])
            .inc();
    }

    pub fn record_cel_evaluation(
        &self,
        namespace: &str,
        name: &str,
        family: &str,
        outcome: CelOutcome,
    ) {
        self.cel_evaluations_total
            .with_label_values(&[namespace, name, family, outcome.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_land_under_the_controller_namespace() {
        let telemetry = Telemetry::new().unwrap();
        telemetry.record_event("default", "rmm", "addEvent", true);
        telemetry.mark_monitored("default", "rmm");
        telemetry.record_cel_evaluation("default", "rmm", "fam", CelOutcome::Timeout);

        let text = telemetry.gather_text().unwrap();
        assert!(text.contains("resource_state_metrics_events_processed_total"));
        assert!(text.contains("resource_state_metrics_resources_monitored_info"));
        assert!(text.contains("result=\"timeout\""));
    }

    #[test]
    fn build_info_is_exposed_with_version_labels() {
        let telemetry = Telemetry::new().unwrap();

        let text = telemetry.gather_text().unwrap();
        assert!(text.contains("resource_state_metrics_build_info"));
        assert!(text.contains(&format!("version=\"{}\"", crate::version::semver())));
    }

    #[test]
    fn clearing_a_monitored_resource_drops_the_series() {
        let telemetry = Telemetry::new().unwrap();
        telemetry.mark_monitored("default", "gone");
        telemetry.clear_monitored("default", "gone");

        let text = telemetry.gather_text().unwrap();
        assert!(!text.contains("name=\"gone\""));
    }
}
