//! Core pipeline for resource-state-metrics.
//!
//! This crate carries everything between the Kubernetes client and the HTTP
//! surface:
//! - Reconciliation of `ResourceMetricsMonitor` declarations into per-GVK
//!   stores fed by dynamic watches
//! - Expression resolution (dot-path and CEL) with composite-label expansion
//! - Pre-rendered Prometheus exposition fragments and the family-grouped
//!   writer
//! - The controller's self-observability registry and HTTP servers

pub mod builder;
pub mod config;
pub mod controller;
pub mod crd;
pub mod events;
pub mod external;
pub mod family;
pub mod probe;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod version;
pub mod workqueue;
pub mod writer;

pub use controller::{Controller, ControllerOptions};
pub use crd::{ResourceMetricsMonitor, ResourceMetricsMonitorSpec, ResourceMetricsMonitorStatus};
pub use registry::StoreRegistry;
pub use telemetry::Telemetry;
