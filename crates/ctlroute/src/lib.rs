//! ctlroute: local control-channel message router.
//!
//! A host application and a background service exchange JSON envelopes over a
//! Unix domain socket. Inbound frames are decoded, routed by
//! `(category, action)` to a registered [`Handler`], and answered with a
//! response correlated by `id`. Events are never answered.

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod power;
pub mod registry;
pub mod server;
pub mod service;
pub mod system;
pub mod telemetry;
pub mod transport;
mod version;

pub use bridge::envelope::{DecodeError, Envelope, MessageType, decode, encode};
pub use bridge::error_envelope::build_error_envelope;
pub use client::{ClientError, ControlClient};
pub use config::{ClientConfig, ConfigError, RouterConfig};
pub use connection::{ConnectionContext, ConnectionId, ConnectionTracker, ReadyReceiver, ReadySignal};
pub use dispatcher::Dispatcher;
pub use error::{HandlerError, RouteError};
pub use health::{Health, HealthSnapshot};
pub use power::{NoopInhibitor, PowerManager, SleepInhibitor, register_power_handlers};
pub use registry::{Handler, HandlerRegistry, HandlerResult, RegistryError, RouteKey, handler_fn};
pub use server::{ControlServer, ServerError, shutdown_signal};
pub use service::RouterService;
pub use system::{PingRequest, PongResponse, ReadyEvent, SystemMessage, register_system_handlers};
pub use version::{CTLROUTE_VERSION, PROTOCOL_VERSION, VersionInfo};
