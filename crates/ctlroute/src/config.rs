//! Router and client configuration.
//!
//! Defaults are compiled in; [`RouterConfig::from_env`] and
//! [`ClientConfig::from_env`] overlay the `CTLROUTE_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::transport::default_socket_path;

/// Largest frame accepted on the control socket (8 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Concurrent dispatches per connection.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const SOCKET_ENV: &str = "CTLROUTE_SOCKET";
pub const MAX_FRAME_BYTES_ENV: &str = "CTLROUTE_MAX_FRAME_BYTES";
pub const MAX_IN_FLIGHT_ENV: &str = "CTLROUTE_MAX_IN_FLIGHT";
pub const HEALTH_ADDR_ENV: &str = "CTLROUTE_HEALTH_ADDR";
pub const REQUEST_TIMEOUT_ENV: &str = "CTLROUTE_REQUEST_TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub socket_path: PathBuf,
    pub max_frame_bytes: usize,
    /// 1 means strictly sequential processing per connection.
    pub max_in_flight: usize,
    /// Bind address for the HTTP health endpoint; disabled when `None`.
    pub health_addr: Option<SocketAddr>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            health_addr: None,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup(SOCKET_ENV).filter(|s| !s.is_empty()) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(MAX_FRAME_BYTES_ENV) {
            config.max_frame_bytes = parse_positive(MAX_FRAME_BYTES_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_IN_FLIGHT_ENV) {
            config.max_in_flight = parse_positive(MAX_IN_FLIGHT_ENV, &value)?;
        }
        if let Some(value) = lookup(HEALTH_ADDR_ENV).filter(|s| !s.is_empty()) {
            let addr = value
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::invalid(HEALTH_ADDR_ENV, &value, e))?;
            config.health_addr = Some(addr);
        }

        Ok(config)
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    /// Clamped to at least 1.
    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    pub fn with_health_addr(mut self, addr: SocketAddr) -> Self {
        self.health_addr = Some(addr);
        self
    }
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// How long `request` waits for the correlated response.
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(REQUEST_TIMEOUT_ENV) {
            let secs = value
                .parse::<f64>()
                .map_err(|e| ConfigError::invalid(REQUEST_TIMEOUT_ENV, &value, e))?;
            config.request_timeout = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero())
                .ok_or_else(|| {
                    ConfigError::invalid(REQUEST_TIMEOUT_ENV, &value, "must be a positive number of seconds")
                })?;
        }
        if let Some(value) = lookup(MAX_FRAME_BYTES_ENV) {
            config.max_frame_bytes = parse_positive(MAX_FRAME_BYTES_ENV, &value)?;
        }

        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::invalid(var, value, "must be at least 1")),
        Ok(n) => Ok(n),
        Err(e) => Err(ConfigError::invalid(var, value, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn router_defaults() {
        let config = RouterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RouterConfig::default());
        assert_eq!(config.max_frame_bytes, 8 * 1024 * 1024);
        assert_eq!(config.max_in_flight, 16);
        assert!(config.health_addr.is_none());
        assert!(config.socket_path.ends_with("ctlroute/control.sock"));
    }

    #[test]
    fn router_reads_environment() {
        let config = RouterConfig::from_lookup(lookup(&[
            (SOCKET_ENV, "/run/app/ctl.sock"),
            (MAX_FRAME_BYTES_ENV, "4096"),
            (MAX_IN_FLIGHT_ENV, "1"),
            (HEALTH_ADDR_ENV, "127.0.0.1:4021"),
        ]))
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/app/ctl.sock"));
        assert_eq!(config.max_frame_bytes, 4096);
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.health_addr, Some("127.0.0.1:4021".parse().unwrap()));
    }

    #[test]
    fn router_rejects_bad_values() {
        let err = RouterConfig::from_lookup(lookup(&[(MAX_IN_FLIGHT_ENV, "0")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid CTLROUTE_MAX_IN_FLIGHT=\"0\": must be at least 1"
        );

        assert!(RouterConfig::from_lookup(lookup(&[(MAX_FRAME_BYTES_ENV, "lots")])).is_err());
        assert!(RouterConfig::from_lookup(lookup(&[(HEALTH_ADDR_ENV, "localhost")])).is_err());
    }

    #[test]
    fn empty_socket_env_keeps_default() {
        let config = RouterConfig::from_lookup(lookup(&[(SOCKET_ENV, "")])).unwrap();
        assert_eq!(config.socket_path, default_socket_path());
    }

    #[test]
    fn builder_clamps_in_flight() {
        let config = RouterConfig::default()
            .with_socket_path("/tmp/x.sock")
            .with_max_in_flight(0);
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.socket_path, PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn client_timeout_from_seconds() {
        let config = ClientConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "2.5")])).unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(2500));

        assert!(ClientConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "0")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "-1")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[(REQUEST_TIMEOUT_ENV, "soon")])).is_err());
    }

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }
}
