//! Error replies for messages that never became a typed [`Envelope`].
//!
//! Works on the raw JSON document: a request can be too broken to decode yet
//! still carry an `id` worth answering.

use serde_json::Value;

use super::envelope::{Envelope, MessageType};

/// Placeholder for a route component the document did not provide.
pub const UNKNOWN_ROUTE_PART: &str = "unknown";

/// Build a `response` carrying `error`, correlated to the raw document's `id`.
///
/// Returns `None` when no `id` can be recovered; such a message cannot be
/// answered.
pub fn build_error_envelope(document: &Value, error: impl Into<String>) -> Option<Envelope> {
    let id = recover_id(document)?;

    Some(Envelope {
        id: Some(id),
        kind: MessageType::Response,
        category: string_field(document, "category"),
        action: string_field(document, "action"),
        payload: None,
        error: Some(error.into()),
    })
}

/// Whether the raw document declares itself an event.
pub fn is_event_document(document: &Value) -> bool {
    document.get("type").and_then(Value::as_str) == Some(MessageType::Event.as_str())
}

fn recover_id(document: &Value) -> Option<String> {
    match document.get("id")? {
        Value::String(id) => Some(id.clone()),
        // Peers that number their requests still deserve an answer.
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn string_field(document: &Value, name: &str) -> String {
    document
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_ROUTE_PART)
        .to_string()
}
