//! Controller identity and build version strings.

/// Canonical controller name, used for the `app.kubernetes.io/managed-by`
/// label, event sources, and the telemetry metric namespace.
pub const CONTROLLER_NAME: &str = "resource-state-metrics";

/// Telemetry namespace derived from the controller name.
pub const TELEMETRY_NAMESPACE: &str = "resource_state_metrics";

/// Build version baked in at compile time.
pub fn version() -> String {
    let revision = option_env!("RSM_BUILD_REVISION").unwrap_or("unknown");
    format!(
        "{} v{} (revision: {})",
        CONTROLLER_NAME,
        env!("CARGO_PKG_VERSION"),
        revision
    )
}

/// The revision component of [`version`], used for the
/// `app.kubernetes.io/version` label.
pub fn revision() -> &'static str {
    option_env!("RSM_BUILD_REVISION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Bare package version, used as the `version` label on build-info metrics.
pub fn semver() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
