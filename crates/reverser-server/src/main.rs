//! `reverser-server`: the controller binary. Loads configuration, builds a
//! `kube::Client`, wires the nine core components together, spawns the CRD
//! reconcilers and the Branch Worker fault listener, and serves the HTTP
//! surface until a shutdown signal arrives.

mod controllers;
mod error;
mod http;
mod validate;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use reverser_config::ReverserConfig;
use reverser_core::{AdmissionCollector, CorrelationStore, EventRouter, Metrics, ReconcilerManager, RuleStore, WatchManager};

/// Command line arguments for the gitops-reverser controller.
#[derive(Parser, Debug)]
#[command(name = "reverser-server")]
#[command(about = "Mirrors watched Kubernetes resources into Git, branch-segregated per destination")]
struct Args {
    /// Path to `.reverser.toml` (optional; defaults are used when absent).
    #[arg(long, env = "REVERSER_CONFIG_PATH", default_value = ".reverser.toml")]
    config: PathBuf,

    /// Path to a kubeconfig file (falls back to in-cluster config, then `~/.kube/config`).
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Directory Git working copies are cloned into.
    #[arg(long, env = "REVERSER_DATA_DIR", default_value = "/var/lib/reverser")]
    data_dir: PathBuf,

    /// Overrides `[server].bind_addr` from the config file.
    #[arg(long, env = "REVERSER_BIND_ADDR")]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "reverser_server=info,reverser_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ReverserConfig::load(&args.config)?;
    if let Some(bind_addr) = args.bind_addr {
        config.server.bind_addr = bind_addr;
    }
    let config = Arc::new(config);
    info!("configuration loaded");

    if let Some(path) = &args.kubeconfig {
        unsafe {
            std::env::set_var("KUBECONFIG", path);
        }
    }
    let client = Client::try_default().await?;
    info!("kubernetes client initialized");

    let metrics = Arc::new(Metrics::new());
    let rule_store = Arc::new(RuleStore::new());
    let correlation_metrics = metrics.clone();
    let correlation = Arc::new(
        CorrelationStore::new(config.correlation.capacity, config.correlation.ttl)
            .with_eviction_callback(Arc::new(move || correlation_metrics.inc_correlation_evictions())),
    );
    let router = Arc::new(EventRouter::new(rule_store.clone()));
    let watch = Arc::new(WatchManager::new(client.clone(), rule_store.clone(), correlation.clone(), router.clone(), metrics.clone()));
    let reconciler = Arc::new(ReconcilerManager::new(router.clone(), watch.clone(), config.reconciler.reconcile_interval));
    let admission = Arc::new(AdmissionCollector::new(correlation.clone()));

    let root_cancel = CancellationToken::new();
    let (fault_tx, fault_rx) = tokio::sync::mpsc::channel(config.worker.overflow_capacity.max(1));

    tokio::spawn(correlation.clone().run_sweeper(root_cancel.clone()));

    let ctx = Arc::new(controllers::Context::new(
        client,
        config.clone(),
        rule_store,
        correlation,
        router,
        watch,
        reconciler.clone(),
        metrics,
        fault_tx,
        args.data_dir,
        root_cancel.clone(),
    ));

    controllers::spawn_controllers(ctx.clone(), root_cancel.clone()).await;
    tokio::spawn(controllers::run_fault_listener(fault_rx, reconciler.clone(), root_cancel.clone()));
    tokio::spawn(reconciler.clone().run_periodic(root_cancel.clone()));

    let state = http::AppState { ctx: ctx.clone(), admission };
    let app = http::create_app(state);
    let addr: SocketAddr = config.server.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving http surface");

    let serve_cancel = root_cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(serve_cancel.cancelled_owned())
            .await
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    root_cancel.cancel();

    if let Err(err) = server.await {
        warn!(error = %err, "http server task ended with an error");
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
