//! Host events published on the bus
//!
//! Registry transitions are forwarded as [`PluginLifecycleEvent`]s, and the
//! update scheduler reports what it found as [`UpdateAvailableEvent`]s.
//! Plugins and host code subscribe through
//! [`EventSystem::subscribe`](plexus_bus::EventSystem::subscribe).

use chrono::{DateTime, Utc};
use plexus_bus::{Event, MessageBus, MessagePriority};
use plexus_core::{PluginState, Version, VersionBump};
use plexus_remote::UpdateCandidate;
use plexus_runtime::{LifecycleEvent, LifecycleObserver};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sender id of events published by the host itself
pub const HOST_SENDER: &str = "plexus.host";

/// A plugin changed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginLifecycleEvent {
    /// Plugin id
    pub plugin_id: String,
    /// Previous state
    pub from: PluginState,
    /// New state
    pub to: PluginState,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

impl Event for PluginLifecycleEvent {
    const EVENT_TYPE: &'static str = "plexus.lifecycle";

    fn priority(&self) -> MessagePriority {
        if self.to == PluginState::Error {
            MessagePriority::High
        } else {
            MessagePriority::Normal
        }
    }
}

impl From<&LifecycleEvent> for PluginLifecycleEvent {
    fn from(event: &LifecycleEvent) -> Self {
        Self {
            plugin_id: event.plugin_id.clone(),
            from: event.from,
            to: event.to,
            timestamp: event.timestamp,
        }
    }
}

/// A newer version of an installed plugin was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAvailableEvent {
    /// Plugin id
    pub plugin_id: String,
    /// Installed version
    pub current: Version,
    /// Published version
    pub available: Version,
    /// Size of the increase
    pub bump: VersionBump,
    /// Repository offering it
    pub repository: String,
    /// Whether the scheduler applied it
    pub applied: bool,
}

impl Event for UpdateAvailableEvent {
    const EVENT_TYPE: &'static str = "plexus.update_available";
}

impl UpdateAvailableEvent {
    pub(crate) fn new(candidate: &UpdateCandidate, applied: bool) -> Self {
        Self {
            plugin_id: candidate.plugin_id.clone(),
            current: candidate.current,
            available: candidate.available,
            bump: candidate.bump,
            repository: candidate.repository.clone(),
            applied,
        }
    }
}

/// Registry observer that republishes transitions on the bus
pub(crate) struct LifecycleForwarder {
    bus: Arc<MessageBus>,
}

impl LifecycleForwarder {
    pub(crate) fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

impl fmt::Debug for LifecycleForwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleForwarder").finish_non_exhaustive()
    }
}

impl LifecycleObserver for LifecycleForwarder {
    fn on_lifecycle_event(&self, event: &LifecycleEvent) {
        let event = PluginLifecycleEvent::from(event);
        match self.bus.events().publish(HOST_SENDER, &event) {
            Ok(id) => debug!(plugin = %event.plugin_id, to = %event.to, message_id = %id, "Lifecycle event published"),
            Err(e) => warn!(plugin = %event.plugin_id, error = %e, "Failed to publish lifecycle event"),
        }
    }
}
