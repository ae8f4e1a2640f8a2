//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::service::{RouterService, wait_for_shutdown};

use super::routes::routes;

/// Serve the health endpoint on `addr` until the service shuts down.
pub async fn serve(addr: SocketAddr, service: Arc<RouterService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, service).await
}

/// Serve on an already-bound listener.
pub async fn serve_listener(listener: TcpListener, service: Arc<RouterService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service);

    let actual_addr = listener.local_addr()?;
    info!("Starting health endpoint on {}", actual_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;

    info!("Health endpoint stopped");
    Ok(())
}
