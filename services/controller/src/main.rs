//! tagsync controller
//!
//! Watches the digests behind the image tags running in the cluster and
//! triggers a rolling restart of every Deployment whose tag moved.

use std::sync::Arc;

use anyhow::{Context, Result};
use tagsync_controller::{
    Config, ControllerWorker, DigestResolver, KubeWorkloadApi, Reconciler, RegistryConfig,
    RegistryResolver, WorkloadApi,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TAGSYNC_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tagsync controller");
    info!(
        poll_interval_secs = config.poll_interval.as_secs(),
        max_concurrent_resolves = config.max_concurrent_resolves,
        max_retry_attempts = config.max_retry_attempts,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        label_selector = config.label_selector.as_deref().unwrap_or(""),
        named_workloads = config.workloads.len(),
        registry_hosts = ?config.registry_hosts,
        "Configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let api: Arc<dyn WorkloadApi> = Arc::new(KubeWorkloadApi::new(client, config.api_timeout));

    let resolver: Arc<dyn DigestResolver> = Arc::new(
        RegistryResolver::new(RegistryConfig {
            auth_token: config.registry_token.clone(),
            insecure_registries: config.insecure_registries.clone(),
        })
        .context("failed to build registry client")?,
    );

    let reconciler = Reconciler::new(api, resolver, config.scope(), config.reconciler_config());
    let mut worker = ControllerWorker::new(reconciler, config.poll_interval);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller worker panicked");
            }
            return Ok(());
        }
    }

    // Signal shutdown and let an in-flight cycle finish its restarts
    let _ = shutdown_tx.send(true);
    info!("Waiting for controller worker to stop...");
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Controller worker panicked");
    }

    info!("Controller shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
