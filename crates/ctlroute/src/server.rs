//! Control socket server.
//!
//! One task per accepted connection. Each connection reads frames in order
//! and dispatches every frame on its own task, bounded by a per-connection
//! semaphore. Replies funnel through a single writer task so frames never
//! interleave; completion order is free because peers correlate by id.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::transport::bind_socket;
use crate::config::RouterConfig;
use crate::connection::{ConnectionContext, ConnectionId};
use crate::health::Health;
use crate::service::{RouterService, wait_for_shutdown};

/// How long a closing connection waits for in-flight handlers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind control socket {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-connection limits copied out of [`RouterConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_frame_bytes: usize,
    pub max_in_flight: usize,
    /// Budget for in-flight handlers and queued replies once the
    /// connection stops reading.
    pub drain_timeout: Duration,
}

impl From<&RouterConfig> for ConnectionLimits {
    fn from(config: &RouterConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            max_in_flight: config.max_in_flight.max(1),
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

pub struct ControlServer {
    config: RouterConfig,
    service: Arc<RouterService>,
}

impl ControlServer {
    pub fn new(config: RouterConfig, service: Arc<RouterService>) -> Self {
        Self { config, service }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Bind the configured socket and serve until shutdown is requested on
    /// the service. The socket file is removed on return.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let path = &self.config.socket_path;
        let (listener, _guard) = bind_socket(path).map_err(|source| ServerError::Bind {
            path: path.clone(),
            source,
        })?;

        tracing::info!(path = %path.display(), "Control socket listening");
        self.serve_listener(listener).await;
        Ok(())
    }

    /// Serve an already-bound listener until shutdown.
    pub async fn serve_listener(&self, listener: UnixListener) {
        let limits = ConnectionLimits::from(&self.config);
        let mut connections = JoinSet::new();

        let shutdown = wait_for_shutdown(self.service.shutdown_rx());
        tokio::pin!(shutdown);

        self.service.set_health(Health::Ready).await;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let id = ConnectionId::new();
                        tracing::info!(conn = %id, "Control connection accepted");
                        let service = Arc::clone(&self.service);
                        connections.spawn(run_connection(id, stream, service, limits));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept control connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        self.service.set_health(Health::Draining).await;
        tracing::info!(open = connections.len(), "Control server draining");

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Connection task failed");
            }
        }
        tracing::info!("Control server stopped");
    }
}

/// Drive one connection until EOF, a frame error, or shutdown.
///
/// `id` is the key under which the connection appears in the service's
/// [`ConnectionTracker`](crate::connection::ConnectionTracker).
pub async fn run_connection(
    id: ConnectionId,
    stream: UnixStream,
    service: Arc<RouterService>,
    limits: ConnectionLimits,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::with_max_frame_length(limits.max_frame_bytes));
    let mut writer = FramedWrite::new(write_half, FrameCodec::with_max_frame_length(limits.max_frame_bytes));

    let (conn, ready) = ConnectionContext::new(id);
    let tracker = Arc::clone(service.connections());
    tracker.insert(id);

    let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(limits.max_in_flight * 2);
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                tracing::warn!(conn = %id, error = %e, "Failed to write reply, closing writer");
                break;
            }
        }
    });

    let dispatcher = service.dispatcher();
    let limiter = Arc::new(Semaphore::new(limits.max_in_flight));
    let mut in_flight = JoinSet::new();
    // A frame is only read once a dispatch slot is held for it.
    let mut permit: Option<OwnedSemaphorePermit> = None;

    let shutdown = wait_for_shutdown(service.shutdown_rx());
    tokio::pin!(shutdown);
    let ready_wait = ready.wait();
    tokio::pin!(ready_wait);
    let mut awaiting_ready = true;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                tracing::debug!(conn = %id, "Shutdown requested, closing connection");
                break;
            }

            is_ready = &mut ready_wait, if awaiting_ready => {
                awaiting_ready = false;
                if is_ready {
                    tracker.mark_ready(id);
                    tracing::info!(conn = %id, "Peer ready");
                }
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(conn = %id, error = %e, "Dispatch task failed");
                }
            }

            acquired = Arc::clone(&limiter).acquire_owned(), if permit.is_none() => match acquired {
                Ok(acquired) => permit = Some(acquired),
                Err(_) => break,
            },

            frame = reader.next(), if permit.is_some() => match frame {
                Some(Ok(frame)) => {
                    let permit = permit.take();
                    let dispatcher = dispatcher.clone();
                    let conn = conn.clone();
                    let reply_tx = reply_tx.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        if let Some(reply) = dispatcher.handle(&frame, &conn).await
                            && reply_tx.send(Bytes::from(reply)).await.is_err()
                        {
                            tracing::debug!(conn = %conn.id(), "Writer gone, dropping reply");
                        }
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(conn = %id, error = %e, "Control frame error, closing connection");
                    break;
                }
                None => {
                    tracing::debug!(conn = %id, "Peer closed control connection");
                    break;
                }
            },
        }
    }

    drop(reader);
    drop(permit);
    let deadline = Instant::now() + limits.drain_timeout;

    let drained = tokio::time::timeout_at(deadline, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(conn = %id, abandoned = in_flight.len(), "In-flight handlers did not finish, aborting");
        in_flight.abort_all();
    }

    drop(reply_tx);
    match tokio::time::timeout_at(deadline, &mut writer_task).await {
        Ok(Err(e)) => tracing::error!(conn = %id, error = %e, "Writer task failed"),
        Ok(Ok(())) => {}
        Err(_) => {
            tracing::warn!(conn = %id, "Peer is not reading, dropping queued replies");
            writer_task.abort();
        }
    }

    tracker.remove(id);
    tracing::info!(conn = %id, "Control connection closed");
}

/// Wait for SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
