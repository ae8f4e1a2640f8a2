//! RouterService: transport-agnostic router state.
//!
//! This service owns:
//! - The handler registry shared by every connection
//! - Connection tracking
//! - Health tracking
//! - Shutdown coordination (bidirectional)
//!
//! The socket server and the HTTP health endpoint both hold an
//! `Arc<RouterService>`; either side can request shutdown and both observe it.

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::connection::ConnectionTracker;
use crate::dispatcher::Dispatcher;
use crate::health::{Health, HealthSnapshot};
use crate::registry::HandlerRegistry;
use crate::version::VersionInfo;

pub struct RouterService {
    registry: Arc<HandlerRegistry>,
    connections: Arc<ConnectionTracker>,

    health: RwLock<Health>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    version: VersionInfo,
}

impl std::fmt::Debug for RouterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterService")
            .field("routes", &self.registry.len())
            .field("connections", &self.connections.len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl RouterService {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            registry,
            connections: Arc::new(ConnectionTracker::new()),
            health: RwLock::new(Health::Starting),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.registry))
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    pub async fn health(&self) -> HealthSnapshot {
        let status = *self.health.read().await;
        HealthSnapshot {
            status,
            connections: self.connections.len(),
            ready_peers: self.connections.ready_count(),
            routes: self
                .registry
                .routes()
                .iter()
                .map(ToString::to_string)
                .collect(),
            peers: self.connections.snapshot(),
            version: self.version.clone(),
        }
    }

    /// Set health state. A draining router never goes back to READY.
    pub async fn set_health(&self, health: Health) {
        let mut current = self.health.write().await;
        if *current == Health::Draining && health != Health::Draining {
            tracing::warn!(requested = ?health, "Router is draining, ignoring health change");
            return;
        }
        *current = health;
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Resolve once `rx` reports shutdown. A dropped sender never resolves.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::system::register_system_handlers;
    use std::time::Duration;

    fn service() -> RouterService {
        let registry = Arc::new(HandlerRegistry::new());
        register_system_handlers(&registry).unwrap();
        RouterService::new(registry)
    }

    #[tokio::test]
    async fn starts_in_starting_state() {
        let svc = service();
        let snapshot = svc.health().await;
        assert_eq!(snapshot.status, Health::Starting);
        assert_eq!(snapshot.connections, 0);
        assert_eq!(snapshot.routes, ["system.ping", "system.ready"]);
    }

    #[tokio::test]
    async fn snapshot_counts_connections() {
        let svc = service();
        let a = ConnectionId::new();
        svc.connections().insert(a);
        svc.connections().insert(ConnectionId::new());
        svc.connections().mark_ready(a);

        let snapshot = svc.health().await;
        assert_eq!(snapshot.connections, 2);
        assert_eq!(snapshot.ready_peers, 1);
        assert_eq!(snapshot.peers.len(), 2);
    }

    #[tokio::test]
    async fn draining_is_terminal() {
        let svc = service();
        svc.set_health(Health::Ready).await;
        svc.set_health(Health::Draining).await;
        svc.set_health(Health::Ready).await;
        assert_eq!(svc.health().await.status, Health::Draining);
    }

    #[tokio::test]
    async fn trigger_shutdown_notifies_receivers() {
        let svc = service();
        let rx = svc.shutdown_rx();
        assert!(!svc.is_shutting_down());

        svc.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(rx))
            .await
            .unwrap();
        assert!(svc.is_shutting_down());
    }

    #[tokio::test]
    async fn late_receiver_sees_shutdown() {
        let svc = service();
        svc.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(svc.shutdown_rx()))
            .await
            .unwrap();
    }
}
