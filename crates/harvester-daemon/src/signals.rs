//! Signal handling for graceful shutdown.

use tokio::sync::broadcast;

/// Wait for shutdown signal (Ctrl+C, SIGTERM or a shutdown request)
pub async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = shutdown_rx.recv() => {
            tracing::info!("Received shutdown command");
        }
        _ = wait_for_sigterm() => {
            tracing::info!("Received SIGTERM");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
