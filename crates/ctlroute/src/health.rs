//! Health status types for the router.

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionInfo;
use crate::version::VersionInfo;

/// Health status of the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Socket not bound yet
    #[default]
    Starting,
    /// Accepting connections
    Ready,
    /// Shutdown requested, finishing in-flight work
    Draining,
}

/// Point-in-time view of the router, served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: Health,
    /// Open control connections.
    pub connections: usize,
    /// Connections that completed the ready handshake.
    pub ready_peers: usize,
    /// Registered routes as `category.action`.
    pub routes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<ConnectionInfo>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == Health::Ready
    }
}
