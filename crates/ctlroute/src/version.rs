//! Version information for ctlroute.

/// ctlroute version from Cargo.toml
pub const CTLROUTE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Envelope protocol revision. Peers may announce theirs in `system.ready`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information reported by health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    /// Router version.
    pub ctlroute: &'static str,
    /// Envelope protocol revision.
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            ctlroute: CTLROUTE_VERSION,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
