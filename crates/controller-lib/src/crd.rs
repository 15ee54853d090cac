//! The `ResourceMetricsMonitor` managed resource.
//!
//! A ResourceMetricsMonitor (RMM) declares, through a YAML payload in its
//! spec, which custom resources to watch and which gauge families to derive
//! from them. The controller consumes RMMs and reports progress back through
//! the `Processed` and `Failed` status conditions.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types surfaced on the RMM status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    /// The event handler has (or has not yet) processed the configuration.
    Processed,
    /// The event handler gave up on the configuration.
    Failed,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Processed => "Processed",
            ConditionType::Failed => "Failed",
        }
    }

    /// Canonical (reason, message) pair for this condition type at the given
    /// status. Callers cannot override these; keeping them centralised makes
    /// the status surface predictable for consumers.
    fn reason_and_message(&self, status: bool) -> (&'static str, &'static str) {
        match (self, status) {
            (ConditionType::Processed, true) => (
                "EventHandlerSucceeded",
                "Resource configuration has been processed successfully",
            ),
            (ConditionType::Processed, false) => (
                "EventHandlerRunning",
                "Resource configuration is yet to be processed",
            ),
            (ConditionType::Failed, true) => ("EventHandlerFailed", "Resource failed to process"),
            (ConditionType::Failed, false) => ("N/A", "N/A"),
        }
    }
}

/// Spec for the `ResourceMetricsMonitor` resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    group = "resource-state-metrics.instrumentation.k8s-sigs.io",
    version = "v1alpha1",
    kind = "ResourceMetricsMonitor",
    plural = "resourcemetricsmonitors",
    singular = "resourcemetricsmonitor",
    shortname = "rmm",
    namespaced,
    status = "ResourceMetricsMonitorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricsMonitorSpec {
    /// YAML configuration describing the stores to derive metrics from.
    pub configuration: String,
}

/// Status for the `ResourceMetricsMonitor` resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricsMonitorStatus {
    /// Conditions associated with the resource, keyed by type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ResourceMetricsMonitorStatus {
    /// Sets the given condition, replacing an existing condition of the same
    /// type in place and appending otherwise. Reason and message are pinned
    /// to the canonical pair for (type, status); the transition time and
    /// observed generation are stamped here.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        observed_generation: Option<i64>,
    ) {
        let (reason, message) = condition_type.reason_and_message(status);
        let condition = Condition {
            type_: condition_type.as_str().to_owned(),
            status: if status { "True" } else { "False" }.to_owned(),
            reason: reason.to_owned(),
            message: message.to_owned(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation,
        };

        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            *existing = condition;
            return;
        }
        self.conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_appends_then_replaces_in_place() {
        let mut status = ResourceMetricsMonitorStatus::default();

        status.set_condition(ConditionType::Processed, false, Some(1));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "False");
        assert_eq!(status.conditions[0].reason, "EventHandlerRunning");

        status.set_condition(ConditionType::Processed, true, Some(2));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
        assert_eq!(status.conditions[0].reason, "EventHandlerSucceeded");
        assert_eq!(status.conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn failed_condition_carries_canonical_reason() {
        let mut status = ResourceMetricsMonitorStatus::default();

        status.set_condition(ConditionType::Failed, true, None);
        status.set_condition(ConditionType::Processed, true, None);

        assert_eq!(status.conditions.len(), 2);
        let failed = status
            .conditions
            .iter()
            .find(|c| c.type_ == "Failed")
            .unwrap();
        assert_eq!(failed.reason, "EventHandlerFailed");
        assert_eq!(failed.message, "Resource failed to process");
    }

    #[test]
    fn spec_round_trips_through_yaml() {
        let spec: ResourceMetricsMonitorSpec =
            serde_yaml::from_str("configuration: \"stores: []\"").unwrap();
        assert_eq!(spec.configuration, "stores: []");
    }
}
