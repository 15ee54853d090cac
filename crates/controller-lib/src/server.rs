//! HTTP servers.
//!
//! The main server exposes the user-defined resource metrics (`/metrics`),
//! the hand-written collector surface (`/external`), and API-delegating
//! health endpoints. The telemetry server exposes the controller's own
//! registry, readiness, and the `/debug/pprof` surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use kube::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::external::ExternalCollectors;
use crate::probe;
use crate::registry::StoreRegistry;
use crate::telemetry::Telemetry;
use crate::writer;

/// Exposition content type served by both servers.
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

const DEFAULT_PROFILE_SECONDS: u64 = 30;
const MAX_PROFILE_SECONDS: u64 = 300;

#[derive(Clone)]
pub struct MainState {
    registry: Arc<StoreRegistry>,
    external: Arc<ExternalCollectors>,
    telemetry: Arc<Telemetry>,
    client: Client,
    /// Taken (shared) once per scrape, so a scrape observes one generation
    /// of the registry.
    scrape_lock: Arc<RwLock<()>>,
}

impl MainState {
    pub fn new(
        registry: Arc<StoreRegistry>,
        external: Arc<ExternalCollectors>,
        telemetry: Arc<Telemetry>,
        client: Client,
    ) -> Self {
        Self {
            registry,
            external,
            telemetry,
            client,
            scrape_lock: Arc::new(RwLock::new(())),
        }
    }
}

#[derive(Clone)]
pub struct SelfState {
    telemetry: Arc<Telemetry>,
    client: Client,
}

impl SelfState {
    pub fn new(telemetry: Arc<Telemetry>, client: Client) -> Self {
        Self { telemetry, client }
    }
}

pub fn main_router(state: MainState) -> Router {
    Router::new()
        .route("/metrics", get(resource_metrics))
        .route("/external", get(external_metrics))
        .route(probe::HEALTHZ, get(healthz))
        .route(probe::LIVEZ, get(livez))
        .with_state(state)
}

pub fn self_router(state: SelfState) -> Router {
    Router::new()
        .route("/metrics", get(telemetry_metrics))
        .route(probe::READYZ, get(readyz))
        .route("/debug/pprof", get(pprof_index))
        .route("/debug/pprof/", get(pprof_index))
        .route("/debug/pprof/cmdline", get(pprof_cmdline))
        .route("/debug/pprof/profile", get(pprof_profile))
        .with_state(state)
}

/// Serves a router until the shutdown token fires.
pub async fn serve(
    name: &'static str,
    addr: String,
    router: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| anyhow::anyhow!("error binding {name} server to {addr}: {err}"))?;
    info!(%addr, "starting {name} server");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("stopped {name} server");

    Ok(())
}

/// Joins a host and port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

async fn resource_metrics(State(state): State<MainState>) -> Response {
    let started = Instant::now();
    let _scrape = state.scrape_lock.read().await;

    let stores = state.registry.stores();
    let mut body = String::new();
    writer::write_stores(&stores, &mut body).await;

    state
        .telemetry
        .observe_request("GET", StatusCode::OK.as_u16(), started.elapsed().as_secs_f64());
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
}

async fn external_metrics(State(state): State<MainState>) -> Response {
    let started = Instant::now();
    let _scrape = state.scrape_lock.read().await;

    let mut body = String::new();
    state.external.write_all(&mut body).await;

    state
        .telemetry
        .observe_request("GET", StatusCode::OK.as_u16(), started.elapsed().as_secs_f64());
    ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
}

async fn healthz(State(state): State<MainState>) -> impl IntoResponse {
    probe::delegate(&state.client, probe::HEALTHZ).await
}

async fn livez(State(state): State<MainState>) -> impl IntoResponse {
    probe::delegate(&state.client, probe::LIVEZ).await
}

async fn telemetry_metrics(State(state): State<SelfState>) -> Response {
    match state.telemetry.gather_text() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "error gathering telemetry metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn readyz(State(state): State<SelfState>) -> impl IntoResponse {
    probe::delegate(&state.client, probe::READYZ).await
}

/// Index page listing the profiles this process can serve.
async fn pprof_index() -> Response {
    const BODY: &str = "<html>\n<head><title>/debug/pprof/</title></head>\n<body>\n\
        <p>Available profiles:</p>\n<ul>\n\
        <li><a href=\"/debug/pprof/profile\">profile</a></li>\n\
        <li><a href=\"/debug/pprof/cmdline\">cmdline</a></li>\n\
        </ul>\n</body>\n</html>\n";

    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], BODY).into_response()
}

/// The process command line, NUL-separated.
async fn pprof_cmdline() -> Response {
    let cmdline = std::env::args().collect::<Vec<_>>().join("\0");

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        cmdline,
    )
        .into_response()
}

#[derive(Deserialize)]
struct ProfileParams {
    seconds: Option<u64>,
}

/// Collects a CPU profile for the requested window and returns it in the
/// pprof protobuf format.
async fn pprof_profile(Query(params): Query<ProfileParams>) -> Response {
    use pprof::protos::Message as _;

    let seconds = params
        .seconds
        .unwrap_or(DEFAULT_PROFILE_SECONDS)
        .min(MAX_PROFILE_SECONDS);

    let guard = match pprof::ProfilerGuardBuilder::default()
        .frequency(100)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
    {
        Ok(guard) => guard,
        Err(err) => {
            error!(error = %err, "error starting profiler");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let report = match guard.report().build() {
        Ok(report) => report,
        Err(err) => {
            error!(error = %err, "error building profile report");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let profile = match report.pprof() {
        Ok(profile) => profile,
        Err(err) => {
            error!(error = %err, "error encoding profile");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let mut body = Vec::new();
    if let Err(err) = profile.write_to_vec(&mut body) {
        error!(error = %err, "error serialising profile");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}
