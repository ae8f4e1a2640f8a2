//! Error taxonomy for routing and handlers.
//!
//! Everything except [`RouteError::MalformedInput`] is recoverable into an
//! error response. Handler authors only see [`HandlerError`].

use crate::bridge::envelope::DecodeError;

/// Failure reported by a handler.
///
/// The display string becomes the `error` field of the reply.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload did not match the action's schema.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// Domain failure; the message is sent verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Why a message could not be routed to a successful reply.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Undecodable bytes; no correlation id can be recovered.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Invalid message: missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid message: field '{field}' {reason}")]
    InvalidFormat { field: &'static str, reason: String },

    #[error("Unknown {category} action: {action}")]
    UnknownRoute { category: String, action: String },

    #[error(transparent)]
    HandlerFailure(#[from] HandlerError),
}

impl RouteError {
    pub fn unknown_route(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self::UnknownRoute {
            category: category.into(),
            action: action.into(),
        }
    }

    /// Whether an error reply can be built for this failure.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::MalformedInput(_))
    }
}

impl From<DecodeError> for RouteError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::MalformedJson(message) => Self::MalformedInput(message),
            DecodeError::MissingField(field) => Self::MissingField(field),
            DecodeError::InvalidField { field, reason } => Self::InvalidFormat { field, reason },
        }
    }
}
