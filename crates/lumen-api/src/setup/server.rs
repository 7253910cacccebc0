//! Server startup and graceful shutdown

use crate::setup::BackgroundTasks;
use anyhow::{Context, Result};
use axum::Router;
use lumen_core::Config;

/// Serve until Ctrl-C or SIGTERM, then stop the background tasks.
pub async fn start_server(config: &Config, app: Router, background: BackgroundTasks) -> Result<()> {
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(
        addr = %addr,
        max_image_mb = config.media.max_image_bytes / 1024 / 1024,
        max_video_mb = config.media.max_video_bytes / 1024 / 1024,
        extensions = %config.media.allowed_extensions.join(","),
        ffmpeg_path = %config.media.ffmpeg_path,
        workers = config.derivation.worker_count,
        "Server ready and accepting connections"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    background.shutdown().await;
    served?;
    Ok(())
}

/// Resolves on Ctrl+C (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }

    tracing::info!("Shutting down gracefully...");
}
