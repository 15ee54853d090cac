//! resource-state-metrics: Kubernetes-native metrics generator for custom
//! resources.
//!
//! Watches `ResourceMetricsMonitor` declarations, derives per-GVK metric
//! stores from them, and serves the rendered Prometheus text.

mod options;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use controller_lib::external::ExternalCollectors;
use controller_lib::server::{self, MainState, SelfState};
use controller_lib::{version, Controller, ControllerOptions, StoreRegistry, Telemetry};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use options::Options;

fn main() -> Result<()> {
    let options = Options::parse();
    if options.version {
        println!("{}", version::version());
        return Ok(());
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if options.auto_gomaxprocs {
        // available_parallelism honours cgroup CPU quotas on Linux.
        if let Ok(parallelism) = std::thread::available_parallelism() {
            builder.worker_threads(parallelism.get());
        }
    }
    let runtime = builder.build()?;

    runtime.block_on(run(options))
}

async fn run(options: Options) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = %version::version(), "starting");
    info!(
        ratio_gomemlimit = options.ratio_gomemlimit,
        "memory-limit ratio accepted; no runtime memory knob applies"
    );

    let client = build_client(&options).await?;
    let telemetry = Arc::new(Telemetry::new()?);
    let registry = Arc::new(StoreRegistry::new());
    let external = Arc::new(ExternalCollectors::new());

    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    let controller = Arc::new(Controller::new(
        client.clone(),
        Arc::clone(&registry),
        Arc::clone(&telemetry),
        ControllerOptions {
            workers: options.workers,
            cel_cost_limit: options.cel_cost_limit,
            cel_timeout: std::time::Duration::from_secs(options.cel_timeout_seconds as u64),
        },
        root.clone(),
    ));

    let main_addr = server::join_host_port(&options.main_host, options.main_port);
    let self_addr = server::join_host_port(&options.self_host, options.self_port);
    let main_state = MainState::new(registry, external, Arc::clone(&telemetry), client.clone());
    let self_state = SelfState::new(telemetry, client);

    tokio::try_join!(
        server::serve(
            "main",
            main_addr,
            server::main_router(main_state),
            root.clone(),
        ),
        server::serve(
            "telemetry",
            self_addr,
            server::self_router(self_state),
            root.clone(),
        ),
        controller.run(root.clone()),
    )?;

    info!("shut down cleanly");
    Ok(())
}

async fn build_client(options: &Options) -> Result<Client> {
    let mut config = match &options.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?
        }
        None => kube::Config::infer().await?,
    };
    if let Some(master) = &options.master {
        config.cluster_url = master.parse()?;
    }

    Ok(Client::try_from(config)?)
}

fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("received shutdown signal");
        root.cancel();
    });
}
