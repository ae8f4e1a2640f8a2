//! Handler registry keyed by (category, action).
//!
//! Built once at startup and shared as `Arc<HandlerRegistry>` by every
//! connection. Backed by DashMap, so lookups from many connections never
//! contend on a single lock and registration stays safe after startup.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::bridge::envelope::Envelope;
use crate::connection::ConnectionContext;
use crate::error::HandlerError;

pub type HandlerResult = Result<Value, HandlerError>;

/// Composite routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub category: String,
    pub action: String,
}

impl RouteKey {
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            action: action.into(),
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.category, self.action)
    }
}

/// A function from an inbound envelope to a reply payload or a failure.
///
/// The handler owns decoding of `envelope.payload` into its action-specific
/// type. For events the returned value is discarded.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, conn: &ConnectionContext, envelope: &Envelope) -> HandlerResult;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(ConnectionContext, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, conn: &ConnectionContext, envelope: &Envelope) -> HandlerResult {
        (self.0)(conn.clone(), envelope.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(ConnectionContext, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler is already registered for {0}")]
    Duplicate(RouteKey),
}

/// Maps (category, action) to handlers.
///
/// Duplicate registration is rejected; use [`HandlerRegistry::replace`] to
/// swap a handler deliberately.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<RouteKey, Arc<dyn Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routes", &self.routes())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the key is taken.
    pub fn register(
        &self,
        category: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        match self.handlers.entry(RouteKey::new(category, action)) {
            Entry::Occupied(entry) => Err(RegistryError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(route = %entry.key(), "Registered handler");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Install a handler, returning the one it displaced.
    pub fn replace(
        &self,
        category: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        let key = RouteKey::new(category, action);
        tracing::debug!(route = %key, "Replacing handler");
        self.handlers.insert(key, handler)
    }

    pub fn unregister(&self, category: &str, action: &str) -> Option<Arc<dyn Handler>> {
        let removed = self
            .handlers
            .remove(&RouteKey::new(category, action))
            .map(|(_, handler)| handler);
        if removed.is_some() {
            tracing::debug!(category, action, "Unregistered handler");
        }
        removed
    }

    /// `None` means no route: the dispatcher answers with an unknown-action
    /// error.
    pub fn lookup(&self, category: &str, action: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&RouteKey::new(category, action))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, category: &str, action: &str) -> bool {
        self.handlers.contains_key(&RouteKey::new(category, action))
    }

    /// Registered keys, sorted.
    pub fn routes(&self) -> Vec<RouteKey> {
        let mut keys: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
