//! Health probes delegating to the Kubernetes API server.
//!
//! The controller is healthy exactly when it can reach its API server, so
//! `/healthz`, `/livez`, and `/readyz` forward to the corresponding API
//! server paths and map any failure to 503.

use axum::http::StatusCode;
use kube::Client;
use tracing::warn;

pub const HEALTHZ: &str = "/healthz";
pub const LIVEZ: &str = "/livez";
pub const READYZ: &str = "/readyz";

/// Issues the probe against the API server and renders the verdict.
pub async fn delegate(client: &Client, path: &'static str) -> (StatusCode, &'static str) {
    let request = match http::Request::builder().uri(path).body(Vec::new()) {
        Ok(request) => request,
        Err(err) => {
            warn!(path, error = %err, "error building probe request");
            return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
        }
    };

    match client.request_text(request).await {
        Ok(_) => (StatusCode::OK, "OK"),
        Err(err) => {
            warn!(path, error = %err, "probe delegation failed");
            (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
        }
    }
}
