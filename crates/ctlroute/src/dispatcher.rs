//! Routes one inbound frame to its handler and produces the reply frame.
//!
//! The dispatcher never fails: every recoverable problem becomes an error
//! response, and everything else (malformed bytes, uncorrelatable requests,
//! events) yields no bytes at all.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;

use crate::bridge::envelope::{Envelope, MessageType, parse_document};
use crate::bridge::error_envelope::{build_error_envelope, is_event_document};
use crate::connection::ConnectionContext;
use crate::error::{HandlerError, RouteError};
use crate::registry::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Process one raw frame. `None` means nothing is written back.
    pub async fn handle(&self, raw: &[u8], conn: &ConnectionContext) -> Option<Vec<u8>> {
        self.dispatch(raw, conn).await.map(|reply| reply.encode())
    }

    /// Like [`Dispatcher::handle`] but returns the reply unencoded.
    pub async fn dispatch(&self, raw: &[u8], conn: &ConnectionContext) -> Option<Envelope> {
        let document = match parse_document(raw) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(conn = %conn.id(), error = %e, bytes = raw.len(), "Dropping malformed frame");
                return None;
            }
        };

        let envelope = match Envelope::from_document(&document) {
            Ok(envelope) => envelope,
            Err(e) => return reject_invalid(&document, RouteError::from(e), conn),
        };

        match envelope.kind {
            MessageType::Response => {
                tracing::warn!(
                    conn = %conn.id(),
                    id = envelope.id.as_deref().unwrap_or_default(),
                    category = %envelope.category,
                    action = %envelope.action,
                    "Dropping unsolicited response"
                );
                return None;
            }
            MessageType::Request if envelope.id.is_none() => {
                tracing::warn!(
                    conn = %conn.id(),
                    category = %envelope.category,
                    action = %envelope.action,
                    "Dropping request without id"
                );
                return None;
            }
            _ => {}
        }

        tracing::trace!(
            conn = %conn.id(),
            id = envelope.id.as_deref().unwrap_or_default(),
            kind = %envelope.kind,
            category = %envelope.category,
            action = %envelope.action,
            "Dispatching"
        );

        let outcome = self.route(&envelope, conn).await;

        if !envelope.kind.expects_reply() {
            if let Err(e) = outcome {
                tracing::warn!(
                    conn = %conn.id(),
                    category = %envelope.category,
                    action = %envelope.action,
                    error = %e,
                    "Event handling failed"
                );
            }
            return None;
        }

        Some(match outcome {
            Ok(payload) => Envelope::response_to(&envelope, payload),
            Err(e) => Envelope::error_response_to(&envelope, e.to_string()),
        })
    }

    async fn route(&self, envelope: &Envelope, conn: &ConnectionContext) -> Result<Value, RouteError> {
        let Some(handler) = self.registry.lookup(&envelope.category, &envelope.action) else {
            let err = RouteError::unknown_route(&envelope.category, &envelope.action);
            tracing::error!(
                conn = %conn.id(),
                id = envelope.id.as_deref().unwrap_or_default(),
                error = %err,
                "No handler registered"
            );
            return Err(err);
        };

        // A panicking handler must not take the connection down with it.
        match AssertUnwindSafe(handler.handle(conn, envelope))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(RouteError::from),
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(
                    conn = %conn.id(),
                    category = %envelope.category,
                    action = %envelope.action,
                    panic = %message,
                    "Handler panicked"
                );
                Err(HandlerError::internal(format!("handler panicked: {message}")).into())
            }
        }
    }
}

/// Answer a document that parsed as JSON but is not a valid envelope.
fn reject_invalid(document: &Value, err: RouteError, conn: &ConnectionContext) -> Option<Envelope> {
    if !err.is_recoverable() {
        tracing::warn!(conn = %conn.id(), error = %err, "Dropping non-object frame");
        return None;
    }
    if is_event_document(document) {
        tracing::warn!(conn = %conn.id(), error = %err, "Dropping invalid event");
        return None;
    }

    let reply = build_error_envelope(document, err.to_string());
    match &reply {
        Some(reply) => tracing::warn!(
            conn = %conn.id(),
            id = reply.id.as_deref().unwrap_or_default(),
            error = %err,
            "Rejecting invalid message"
        ),
        None => tracing::warn!(
            conn = %conn.id(),
            error = %err,
            "Dropping invalid message without id"
        ),
    }
    reply
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
