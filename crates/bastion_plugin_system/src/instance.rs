//! Plugin instance state.

use crate::definition::{Plugin, PluginDefinition};
use crate::sandbox::SandboxHandle;
use bastion_events::{EventType, PluginInstanceId, ServerId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// One configured plugin on one server.
///
/// The boxed plugin value is exclusively owned behind an async mutex: all
/// lifecycle calls and event deliveries serialize through it, so plugin
/// implementations need no internal locking for their own state.
pub struct PluginInstance {
    pub id: PluginInstanceId,
    pub plugin_id: String,
    pub server_id: ServerId,
    pub(crate) config: serde_json::Value,
    pub(crate) subscribed_events: HashSet<EventType>,
    pub(crate) sandboxed: bool,
    status: std::sync::Mutex<PluginStatus>,
    pub(crate) plugin: Mutex<Box<dyn Plugin>>,
    pub(crate) sandbox: Arc<SandboxHandle>,
    pub(crate) cancel: CancellationToken,
}

impl PluginInstance {
    pub(crate) fn new(
        definition: &PluginDefinition,
        server_id: ServerId,
        config: serde_json::Value,
        plugin: Box<dyn Plugin>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: PluginInstanceId::new(),
            plugin_id: definition.plugin_id.to_string(),
            server_id,
            config,
            subscribed_events: definition.subscribed_events.clone(),
            sandboxed: definition.sandboxed,
            status: std::sync::Mutex::new(PluginStatus::Stopped),
            plugin: Mutex::new(plugin),
            sandbox: Arc::new(SandboxHandle::new()),
            cancel,
        }
    }

    pub fn status(&self) -> PluginStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: PluginStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// True if this instance wants the given event type.
    pub fn subscribes_to(&self, event_type: &EventType) -> bool {
        self.subscribed_events.contains(event_type)
    }

    /// The instance's sandbox accounting handle.
    pub fn sandbox(&self) -> Arc<SandboxHandle> {
        Arc::clone(&self.sandbox)
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("server_id", &self.server_id)
            .field("status", &self.status())
            .finish()
    }
}
