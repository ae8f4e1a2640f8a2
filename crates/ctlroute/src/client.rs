//! Client side of the control channel.
//!
//! Requests are correlated by a generated UUID id. Each pending request owns a
//! oneshot slot in a DashMap; the reader task completes the slot when the
//! matching response arrives. Timeouts are enforced here, never on the server.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::envelope::{Envelope, MessageType, decode};
use crate::config::ClientConfig;
use crate::system::{PING_ACTION, PingRequest, PongResponse, READY_ACTION, ReadyEvent, SYSTEM_CATEGORY};
use crate::version::PROTOCOL_VERSION;

/// Outbound frames buffered before `send` waits on the writer.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("control socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control connection closed")]
    Closed,

    #[error("request {route} timed out after {timeout:?}")]
    Timeout { route: String, timeout: Duration },

    /// The peer answered with an error envelope.
    #[error("{0}")]
    Remote(String),

    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },
}

/// State shared between the client handle and its background tasks.
#[derive(Debug, Default)]
struct Shared {
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail every pending request. Dropping a slot's sender wakes its waiter
    /// with a receive error.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.clear();
    }
}

struct ClientInner {
    outbound: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    config: ClientConfig,
    reader: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.close();
        self.reader.abort();
    }
}

/// Handle to one control connection. Cheap to clone; the connection closes
/// when the last clone is dropped.
#[derive(Clone)]
pub struct ControlClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("pending", &self.inner.shared.pending.len())
            .field("closed", &self.inner.shared.is_closed())
            .finish()
    }
}

impl ControlClient {
    pub async fn connect(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        tracing::debug!(path = %path.display(), "Connected to control socket");
        Ok(Self::from_stream(stream, config))
    }

    /// Wrap an already-connected stream. Must be called within a tokio runtime.
    pub fn from_stream(stream: UnixStream, config: ClientConfig) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared::default());

        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_BUFFER);
        let mut writer =
            FramedWrite::new(write_half, FrameCodec::with_max_frame_length(config.max_frame_bytes));
        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(error = %e, "Failed to write control frame");
                    writer_shared.close();
                    break;
                }
            }
        });

        let reader = FramedRead::new(read_half, FrameCodec::with_max_frame_length(config.max_frame_bytes));
        let reader = tokio::spawn(read_responses(reader, Arc::clone(&shared)));

        Self {
            inner: Arc::new(ClientInner {
                outbound,
                shared,
                config,
                reader,
            }),
        }
    }

    /// Send a request and wait for its response payload.
    pub async fn request(&self, category: &str, action: &str, payload: Value) -> Result<Value, ClientError> {
        let shared = &self.inner.shared;
        let id = uuid::Uuid::new_v4().to_string();
        let envelope = Envelope::request(id.clone(), category, action).with_payload(payload);

        let (tx, rx) = oneshot::channel();
        shared.pending.insert(id.clone(), tx);
        if shared.is_closed() {
            shared.pending.remove(&id);
            return Err(ClientError::Closed);
        }
        if let Err(e) = self.send(&envelope).await {
            shared.pending.remove(&id);
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(ClientError::Remote(error)),
                None => Ok(response.payload.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                shared.pending.remove(&id);
                let route = format!("{category}.{action}");
                tracing::warn!(%id, %route, ?timeout, "Control request timed out");
                Err(ClientError::Timeout { route, timeout })
            }
        }
    }

    /// [`ControlClient::request`] with the payload decoded into `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        category: &str,
        action: &str,
        payload: Value,
    ) -> Result<T, ClientError> {
        let value = self.request(category, action, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send an event. Nothing comes back.
    pub async fn notify(&self, category: &str, action: &str, payload: Value) -> Result<(), ClientError> {
        self.send(&Envelope::event(category, action).with_payload(payload)).await
    }

    /// Complete the ready handshake.
    pub async fn send_ready(&self) -> Result<(), ClientError> {
        let event = ReadyEvent {
            client: Some(format!("ctlroute/{}", crate::version::CTLROUTE_VERSION)),
            protocol: Some(PROTOCOL_VERSION),
        };
        self.notify(SYSTEM_CATEGORY, READY_ACTION, serde_json::to_value(event)?)
            .await
    }

    /// Round-trip latency of one `system.ping`.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let ping = PingRequest::now();
        let _pong: PongResponse = self
            .request_as(SYSTEM_CATEGORY, PING_ACTION, serde_json::to_value(ping)?)
            .await?;
        Ok(started.elapsed())
    }

    /// Ping every `interval` until the client is dropped or the connection
    /// closes.
    pub fn spawn_keepalive(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("Client dropped, stopping keepalive");
                    break;
                };
                let client = ControlClient { inner };
                match client.ping().await {
                    Ok(latency) => tracing::debug!(?latency, "Keepalive ping"),
                    Err(ClientError::Closed) => {
                        tracing::debug!("Connection closed, stopping keepalive");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "Keepalive ping failed"),
                }
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.pending.len()
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let frame = envelope.encode();
        let max = self.inner.config.max_frame_bytes;
        if frame.len() > max {
            return Err(ClientError::FrameTooLarge {
                size: frame.len(),
                max,
            });
        }
        self.inner
            .outbound
            .send(Bytes::from(frame))
            .await
            .map_err(|_| ClientError::Closed)
    }
}

async fn read_responses(mut reader: FramedRead<OwnedReadHalf, FrameCodec>, shared: Arc<Shared>) {
    while let Some(frame) = reader.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Control frame error, closing client");
                break;
            }
        };
        let envelope = match decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame from server");
                continue;
            }
        };
        if envelope.kind != MessageType::Response {
            tracing::debug!(
                kind = %envelope.kind,
                category = %envelope.category,
                action = %envelope.action,
                "Ignoring non-response message"
            );
            continue;
        }
        let Some(id) = envelope.id.clone() else {
            tracing::warn!("Dropping response without id");
            continue;
        };
        match shared.pending.remove(&id) {
            Some((_, slot)) => {
                // The waiter may have timed out in between.
                let _ = slot.send(envelope);
            }
            None => tracing::warn!(%id, "Dropping response for unknown request"),
        }
    }
    tracing::debug!("Control connection reader exiting");
    shared.close();
}
