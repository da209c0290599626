use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use lib_gateway::loggers::setup_logging;
use lib_gateway::{DriverRuntime, GatewayService};
use tokio::net::TcpListener;
use tokio::signal;

mod focas_logic;
use focas_logic::{backends, config, routes};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let _log_guard = setup_logging(&config.log_settings())?;

    let settings = config.gateway_settings()?;
    let repo = backends::build_repository(&config).await?;
    let sink = backends::build_sink(&config).await?;
    let driver = backends::build_driver(&config)?;
    let driver_log = config
        .driver_log_path
        .clone()
        .unwrap_or_else(|| "./focas2.log".to_string());
    let runtime = Arc::new(DriverRuntime::new(driver, driver_log));

    let service = Arc::new(GatewayService::new(runtime, repo, sink, settings));
    let report = service
        .start()
        .await
        .context("FOCAS driver could not be started")?;
    tracing::info!(
        "Recovered {} session(s): {} healthy, {} polling resumed, {} skipped",
        report.restored,
        report.healthy,
        report.polling_resumed,
        report.skipped.len()
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(8082)));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Session API listening on http://{addr}");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let app = routes::router(Arc::clone(&service));
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!("Cannot listen for SIGTERM: {e}");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    let _ = shutdown_tx.send(());
    service.shutdown().await;

    match server_handle.await {
        Ok(Err(e)) => tracing::error!("HTTP server stopped with error: {e}"),
        Err(e) => tracing::error!("HTTP server task failed: {e}"),
        Ok(Ok(())) => {}
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}
