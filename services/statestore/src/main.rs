// State store component entry point.
//
// Binds the pluggable state-store service to a Unix domain socket under the
// sidecar's sockets directory and serves until SIGINT/SIGTERM. The backend
// itself is constructed later, when the sidecar calls Init with the
// component's properties.

use anyhow::{Context, Result};
use burrow_statestore::config::HostConfig;
use burrow_statestore::service::StateService;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = HostConfig::from_env().context("load host configuration")?;
    std::fs::create_dir_all(config.sockets_folder()).with_context(|| {
        format!(
            "create sockets folder {}",
            config.sockets_folder().display()
        )
    })?;

    let socket_path = config.socket_path();
    // A stale socket from a crashed run would make bind fail.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    tracing::info!(
        socket = %socket_path.display(),
        backend = ?config.backend,
        "state store component listening"
    );

    let service = StateService::new(config.backend);
    tonic::transport::Server::builder()
        .add_service(service.clone().into_service())
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
        .await
        .context("serve state store component")?;

    // Drain order: the server has stopped accepting RPCs, so stopping the
    // janitor and closing the pool cannot strand an in-flight operation.
    service.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("state store component stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable; using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");
}
