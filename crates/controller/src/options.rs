//! Command-line options.
//!
//! Every flag is mirrored by an `RSM_<UPPER_SNAKE>` environment variable
//! that fills the default; an explicitly set flag always wins.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "resource-state-metrics",
    about = "Kubernetes-native metrics generator for custom resources",
    disable_version_flag = true
)]
pub struct Options {
    /// Automatically size the runtime worker pool to the available CPU
    /// quota.
    #[arg(
        long = "auto-gomaxprocs",
        env = "RSM_AUTO_GOMAXPROCS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        require_equals = false,
        default_missing_value = "true"
    )]
    pub auto_gomaxprocs: bool,

    /// Maximum cost budget for CEL expression evaluation. Typical queries
    /// cost well under the default; raise it only if legitimate queries hit
    /// the limit.
    #[arg(
        long = "cel-cost-limit",
        env = "RSM_CEL_COST_LIMIT",
        default_value_t = 1_000_000
    )]
    pub cel_cost_limit: u64,

    /// Maximum time in seconds for CEL expression evaluation.
    #[arg(
        long = "cel-timeout-seconds",
        env = "RSM_CEL_TIMEOUT_SECONDS",
        default_value_t = 5,
        value_parser = clap::value_parser!(i64).range(1..=300)
    )]
    pub cel_timeout_seconds: i64,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "RSM_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Host to expose main metrics on.
    #[arg(long = "main-host", env = "RSM_MAIN_HOST", default_value = "::")]
    pub main_host: String,

    /// Port to expose main metrics on.
    #[arg(long = "main-port", env = "RSM_MAIN_PORT", default_value_t = 9999)]
    pub main_port: u16,

    /// Address of the Kubernetes API server, overriding the kubeconfig.
    /// Only required if out-of-cluster.
    #[arg(long, env = "RSM_MASTER")]
    pub master: Option<String>,

    /// Memory-limit to quota ratio, accepted for deployment-manifest
    /// compatibility.
    #[arg(
        long = "ratio-gomemlimit",
        env = "RSM_RATIO_GOMEMLIMIT",
        default_value_t = 0.9
    )]
    pub ratio_gomemlimit: f64,

    /// Host to expose self (telemetry) metrics on.
    #[arg(long = "self-host", env = "RSM_SELF_HOST", default_value = "::")]
    pub self_host: String,

    /// Port to expose self (telemetry) metrics on.
    #[arg(long = "self-port", env = "RSM_SELF_PORT", default_value_t = 9998)]
    pub self_port: u16,

    /// Print version information and quit.
    #[arg(long)]
    pub version: bool,

    /// Number of workers processing managed resources in the workqueue.
    #[arg(long, env = "RSM_WORKERS", default_value_t = 2)]
    pub workers: usize,
}
