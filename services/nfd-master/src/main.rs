//! Node feature label service entry point.
//!
//! # Purpose
//! Loads configuration, starts the metrics endpoint, and runs the label server until the
//! process receives SIGINT or SIGTERM.
use anyhow::Result;
use nfd_master::{NfdMasterConfig, observability, server};
use std::future::Future;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NfdMasterConfig::from_env_or_yaml()?;
    let result = run_with_shutdown(config, shutdown_signal()).await;
    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "nfd master failed");
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_with_shutdown<F>(config: NfdMasterConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("nfd-master")?;
    tracing::info!("nfd master starting");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown.await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let metrics_cancel = cancel.clone();
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
        async move { metrics_cancel.cancelled().await },
    ));

    let result = server::run(config, cancel.clone()).await;
    cancel.cancel();
    match metrics_task.await {
        Ok(Err(err)) => tracing::warn!(error = %format!("{err:#}"), "metrics endpoint failed"),
        Err(err) => tracing::warn!(error = %err, "metrics task panicked"),
        Ok(Ok(())) => {}
    }
    result
}
