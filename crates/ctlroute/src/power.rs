//! `power` category: keep the machine awake while sessions are running.
//!
//! The OS-specific assertion lives behind [`SleepInhibitor`]; the router only
//! tracks whether sleep is currently prevented and makes the transitions
//! idempotent.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bridge::envelope::Envelope;
use crate::connection::ConnectionContext;
use crate::error::HandlerError;
use crate::registry::{Handler, HandlerRegistry, HandlerResult, RegistryError};

pub const POWER_CATEGORY: &str = "power";
pub const PREVENT_SLEEP_ACTION: &str = "prevent_sleep";
pub const ALLOW_SLEEP_ACTION: &str = "allow_sleep";
pub const STATUS_ACTION: &str = "status";
pub const SESSIONS_ACTION: &str = "sessions";

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("failed to prevent sleep: {0}")]
    Inhibit(String),

    #[error("failed to allow sleep: {0}")]
    Release(String),
}

impl From<PowerError> for HandlerError {
    fn from(error: PowerError) -> Self {
        HandlerError::failed(error.to_string())
    }
}

/// Platform hook that actually holds or drops the sleep assertion.
pub trait SleepInhibitor: Send + Sync + 'static {
    fn inhibit(&self) -> Result<(), PowerError>;
    fn release(&self) -> Result<(), PowerError>;
}

/// Inhibitor for platforms without a power API; only tracks state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn inhibit(&self) -> Result<(), PowerError> {
        tracing::debug!("No sleep inhibitor on this platform");
        Ok(())
    }

    fn release(&self) -> Result<(), PowerError> {
        Ok(())
    }
}

/// Idempotent sleep prevention. Releases the assertion on drop.
pub struct PowerManager {
    inhibitor: Box<dyn SleepInhibitor>,
    prevented: StdMutex<bool>,
}

impl std::fmt::Debug for PowerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerManager")
            .field("prevented", &self.is_sleep_prevented())
            .finish_non_exhaustive()
    }
}

impl Default for PowerManager {
    fn default() -> Self {
        Self::new(NoopInhibitor)
    }
}

impl PowerManager {
    pub fn new(inhibitor: impl SleepInhibitor) -> Self {
        Self {
            inhibitor: Box::new(inhibitor),
            prevented: StdMutex::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        match self.prevented.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Power state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn prevent_sleep(&self) -> Result<(), PowerError> {
        let mut prevented = self.state();
        if *prevented {
            tracing::debug!("Sleep is already prevented");
            return Ok(());
        }
        self.inhibitor.inhibit()?;
        *prevented = true;
        tracing::info!("System sleep prevention enabled");
        Ok(())
    }

    pub fn allow_sleep(&self) -> Result<(), PowerError> {
        let mut prevented = self.state();
        if !*prevented {
            tracing::debug!("Sleep is already allowed");
            return Ok(());
        }
        self.inhibitor.release()?;
        *prevented = false;
        tracing::info!("System sleep prevention disabled");
        Ok(())
    }

    pub fn is_sleep_prevented(&self) -> bool {
        *self.state()
    }

    /// Prevent sleep while any session runs and the user opted in.
    pub fn update_for_sessions(&self, session_count: usize, enabled: bool) -> Result<(), PowerError> {
        if enabled && session_count > 0 {
            self.prevent_sleep()
        } else {
            self.allow_sleep()
        }
    }
}

impl Drop for PowerManager {
    fn drop(&mut self) {
        if let Err(e) = self.allow_sleep() {
            tracing::warn!(error = %e, "Failed to release sleep assertion on shutdown");
        }
    }
}

/// Reply to every `power` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub prevented: bool,
}

/// Payload of the `power.sessions` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionsUpdate {
    pub count: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerCommand {
    PreventSleep,
    AllowSleep,
    Status,
    Sessions(SessionsUpdate),
}

impl PowerCommand {
    pub fn parse(envelope: &Envelope) -> Result<Self, HandlerError> {
        match envelope.action.as_str() {
            PREVENT_SLEEP_ACTION => Ok(Self::PreventSleep),
            ALLOW_SLEEP_ACTION => Ok(Self::AllowSleep),
            STATUS_ACTION => Ok(Self::Status),
            SESSIONS_ACTION => Ok(Self::Sessions(envelope.payload_as()?)),
            other => Err(HandlerError::failed(format!("Unknown power action: {other}"))),
        }
    }
}

pub struct PowerHandler {
    manager: Arc<PowerManager>,
}

impl PowerHandler {
    pub fn new(manager: Arc<PowerManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Handler for PowerHandler {
    async fn handle(&self, conn: &ConnectionContext, envelope: &Envelope) -> HandlerResult {
        match PowerCommand::parse(envelope)? {
            PowerCommand::PreventSleep => self.manager.prevent_sleep()?,
            PowerCommand::AllowSleep => self.manager.allow_sleep()?,
            PowerCommand::Status => {}
            PowerCommand::Sessions(update) => {
                tracing::debug!(conn = %conn.id(), count = update.count, enabled = update.enabled, "Session count changed");
                self.manager.update_for_sessions(update.count, update.enabled)?;
            }
        }
        let status = PowerStatus {
            prevented: self.manager.is_sleep_prevented(),
        };
        Ok(serde_json::to_value(status)?)
    }
}

/// Register every `power` action against `manager`.
pub fn register_power_handlers(
    registry: &HandlerRegistry,
    manager: Arc<PowerManager>,
) -> Result<(), RegistryError> {
    let handler: Arc<dyn Handler> = Arc::new(PowerHandler::new(manager));
    for action in [
        PREVENT_SLEEP_ACTION,
        ALLOW_SLEEP_ACTION,
        STATUS_ACTION,
        SESSIONS_ACTION,
    ] {
        registry.register(POWER_CATEGORY, action, Arc::clone(&handler))?;
    }
    Ok(())
}
