//! Per-connection state: identity, the one-shot ready handshake, and the
//! process-wide table of live connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending side of the ready handshake. Fires at most once.
#[derive(Debug)]
pub struct ReadySignal {
    tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl ReadySignal {
    /// Returns `true` only for the call that fired the signal.
    pub fn fire(&self) -> bool {
        let mut guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Ready signal mutex poisoned - recovering");
                poisoned.into_inner()
            }
        };
        match guard.take() {
            Some(tx) => {
                // The receiver may already be gone; the handshake still happened.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// Receiving side of the ready handshake, held by connection setup code.
#[derive(Debug)]
pub struct ReadyReceiver {
    rx: oneshot::Receiver<()>,
}

impl ReadyReceiver {
    /// Resolves `true` once the peer is ready, `false` if the connection went
    /// away first.
    pub async fn wait(self) -> bool {
        self.rx.await.is_ok()
    }
}

pub fn ready_channel() -> (ReadySignal, ReadyReceiver) {
    let (tx, rx) = oneshot::channel();
    (
        ReadySignal {
            tx: StdMutex::new(Some(tx)),
        },
        ReadyReceiver { rx },
    )
}

#[derive(Debug)]
struct ConnectionInner {
    id: ConnectionId,
    ready: ReadySignal,
    is_ready: AtomicBool,
}

/// Handle to the connection a message arrived on, passed to every handler.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    inner: Arc<ConnectionInner>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId) -> (Self, ReadyReceiver) {
        let (ready, receiver) = ready_channel();
        let context = Self {
            inner: Arc::new(ConnectionInner {
                id,
                ready,
                is_ready: AtomicBool::new(false),
            }),
        };
        (context, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Complete the handshake. Returns `false` if it had already completed.
    pub fn mark_ready(&self) -> bool {
        let fired = self.inner.ready.fire();
        if fired {
            self.inner.is_ready.store(true, Ordering::Release);
        }
        fired
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready.load(Ordering::Acquire)
    }
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub ready: bool,
}

/// Live connections, shared between the server and health reporting.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: DashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: ConnectionId) {
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                connected_at: Utc::now(),
                ready: false,
            },
        );
    }

    pub fn mark_ready(&self, id: ConnectionId) {
        if let Some(mut info) = self.connections.get_mut(&id) {
            info.ready = true;
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.remove(&id).map(|(_, info)| info)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.connections.iter().filter(|entry| entry.ready).count()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }
}
