//! Built-in `system` category: the ready handshake and liveness pings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::bridge::envelope::Envelope;
use crate::connection::ConnectionContext;
use crate::error::HandlerError;
use crate::registry::{Handler, HandlerRegistry, HandlerResult, RegistryError};
use crate::version::PROTOCOL_VERSION;

pub const SYSTEM_CATEGORY: &str = "system";
pub const READY_ACTION: &str = "ready";
pub const PING_ACTION: &str = "ping";

/// Payload of `system.ready`. Usually empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadyEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u32>,
}

/// Payload of `system.ping`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingRequest {
    /// Caller's clock, seconds since the epoch. Kept as sent, integer or
    /// float, so the pong echoes it unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Number>,
}

impl PingRequest {
    pub fn now() -> Self {
        Self {
            timestamp: Number::from_f64(now_seconds()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongResponse {
    /// The caller's timestamp, or the server's when none was sent.
    pub timestamp: Number,
    pub server_time: f64,
}

impl PongResponse {
    pub fn reply_to(ping: &PingRequest) -> Self {
        let server_time = now_seconds();
        let timestamp = match &ping.timestamp {
            Some(sent) => sent.clone(),
            None => Number::from_f64(server_time).unwrap_or_else(|| Number::from(0)),
        };
        Self {
            timestamp,
            server_time,
        }
    }
}

/// A decoded `system` message.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemMessage {
    Ready(ReadyEvent),
    Ping(PingRequest),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemDecodeError {
    #[error("Failed to process ready: {0}")]
    Ready(String),

    #[error("Failed to process ping: {0}")]
    Ping(#[source] serde_json::Error),

    #[error("Unknown system action: {0}")]
    UnknownAction(String),
}

impl SystemMessage {
    pub fn parse(envelope: &Envelope) -> Result<Self, SystemDecodeError> {
        match envelope.action.as_str() {
            READY_ACTION => {
                let event: ReadyEvent = envelope
                    .payload_as()
                    .map_err(|e| SystemDecodeError::Ready(e.to_string()))?;
                if let Some(protocol) = event.protocol
                    && protocol != PROTOCOL_VERSION
                {
                    return Err(SystemDecodeError::Ready(format!(
                        "protocol {protocol} is not supported (expected {PROTOCOL_VERSION})"
                    )));
                }
                Ok(Self::Ready(event))
            }
            PING_ACTION => envelope
                .payload_as()
                .map(Self::Ping)
                .map_err(SystemDecodeError::Ping),
            other => Err(SystemDecodeError::UnknownAction(other.to_string())),
        }
    }
}

/// Handles every `system` action.
#[derive(Debug, Default)]
pub struct SystemHandler;

#[async_trait]
impl Handler for SystemHandler {
    async fn handle(&self, conn: &ConnectionContext, envelope: &Envelope) -> HandlerResult {
        match SystemMessage::parse(envelope) {
            Ok(SystemMessage::Ready(event)) => {
                if conn.mark_ready() {
                    tracing::info!(
                        conn = %conn.id(),
                        client = event.client.as_deref().unwrap_or("unknown"),
                        "Peer completed handshake"
                    );
                } else {
                    tracing::debug!(conn = %conn.id(), "Ignoring repeated ready");
                }
                Ok(Value::Null)
            }
            Ok(SystemMessage::Ping(ping)) => {
                let pong = PongResponse::reply_to(&ping);
                tracing::trace!(conn = %conn.id(), timestamp = %pong.timestamp, "Pong");
                Ok(serde_json::to_value(pong)?)
            }
            Err(e @ SystemDecodeError::Ready(_)) => {
                // Readiness is best-effort; a bad handshake is not retried.
                tracing::warn!(conn = %conn.id(), error = %e, "Ignoring undecodable ready");
                Ok(Value::Null)
            }
            Err(e) => Err(HandlerError::failed(e.to_string())),
        }
    }
}

/// Register `system.ready` and `system.ping`.
pub fn register_system_handlers(registry: &HandlerRegistry) -> Result<(), RegistryError> {
    let handler: Arc<dyn Handler> = Arc::new(SystemHandler);
    registry.register(SYSTEM_CATEGORY, READY_ACTION, Arc::clone(&handler))?;
    registry.register(SYSTEM_CATEGORY, PING_ACTION, handler)?;
    Ok(())
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use serde_json::json;

    fn connection() -> (ConnectionContext, crate::connection::ReadyReceiver) {
        ConnectionContext::new(ConnectionId::new())
    }

    #[test]
    fn parses_known_actions() {
        let ready = Envelope::event(SYSTEM_CATEGORY, READY_ACTION);
        assert_eq!(
            SystemMessage::parse(&ready).unwrap(),
            SystemMessage::Ready(ReadyEvent::default())
        );

        let ping = Envelope::request("1", SYSTEM_CATEGORY, PING_ACTION)
            .with_payload(json!({"timestamp": 1730000000.5}));
        assert_eq!(
            SystemMessage::parse(&ping).unwrap(),
            SystemMessage::Ping(PingRequest {
                timestamp: Number::from_f64(1730000000.5)
            })
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        let env = Envelope::request("1", SYSTEM_CATEGORY, "frobnicate");
        let err = SystemMessage::parse(&env).unwrap_err();
        assert_eq!(err.to_string(), "Unknown system action: frobnicate");
    }

    #[test]
    fn mismatched_protocol_fails_ready_decode() {
        let env = Envelope::event(SYSTEM_CATEGORY, READY_ACTION)
            .with_payload(json!({"protocol": PROTOCOL_VERSION + 1}));
        assert!(matches!(
            SystemMessage::parse(&env),
            Err(SystemDecodeError::Ready(_))
        ));
    }

    #[tokio::test]
    async fn ping_echoes_timestamp() {
        let (conn, _ready) = connection();
        let env = Envelope::request("1", SYSTEM_CATEGORY, PING_ACTION)
            .with_payload(json!({"timestamp": 1730000000}));
        let value = SystemHandler.handle(&conn, &env).await.unwrap();
        assert_eq!(value["timestamp"], json!(1730000000));
        assert_eq!(value["timestamp"].as_i64(), Some(1730000000));
        let pong: PongResponse = serde_json::from_value(value).unwrap();
        assert!(pong.server_time > 1730000000.0);
    }

    #[tokio::test]
    async fn ping_echoes_float_timestamp() {
        let (conn, _ready) = connection();
        let env = Envelope::request("1", SYSTEM_CATEGORY, PING_ACTION)
            .with_payload(json!({"timestamp": 1730000000.25}));
        let value = SystemHandler.handle(&conn, &env).await.unwrap();
        assert_eq!(value["timestamp"], json!(1730000000.25));
    }

    #[tokio::test]
    async fn ping_without_payload_uses_server_time() {
        let (conn, _ready) = connection();
        let env = Envelope::request("1", SYSTEM_CATEGORY, PING_ACTION);
        let value = SystemHandler.handle(&conn, &env).await.unwrap();
        let pong: PongResponse = serde_json::from_value(value).unwrap();
        assert_eq!(pong.timestamp.as_f64(), Some(pong.server_time));
    }

    #[tokio::test]
    async fn bad_ping_payload_fails() {
        let (conn, _ready) = connection();
        let env = Envelope::request("1", SYSTEM_CATEGORY, PING_ACTION)
            .with_payload(json!({"timestamp": "yesterday"}));
        let err = SystemHandler.handle(&conn, &env).await.unwrap_err();
        assert!(
            err.to_string().starts_with("Failed to process ping: "),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn ready_fires_once() {
        let (conn, receiver) = connection();
        let env = Envelope::event(SYSTEM_CATEGORY, READY_ACTION)
            .with_payload(json!({"client": "menubar"}));

        assert_eq!(SystemHandler.handle(&conn, &env).await.unwrap(), Value::Null);
        assert_eq!(SystemHandler.handle(&conn, &env).await.unwrap(), Value::Null);
        assert!(conn.is_ready());
        assert!(receiver.wait().await);
    }

    #[tokio::test]
    async fn undecodable_ready_is_swallowed() {
        let (conn, _ready) = connection();
        let env = Envelope::event(SYSTEM_CATEGORY, READY_ACTION).with_payload(json!("not an object"));

        assert_eq!(SystemHandler.handle(&conn, &env).await.unwrap(), Value::Null);
        assert!(!conn.is_ready());
    }

    #[test]
    fn registers_both_routes_once() {
        let registry = HandlerRegistry::new();
        register_system_handlers(&registry).unwrap();
        assert!(registry.contains(SYSTEM_CATEGORY, READY_ACTION));
        assert!(registry.contains(SYSTEM_CATEGORY, PING_ACTION));
        assert!(register_system_handlers(&registry).is_err());
    }
}
