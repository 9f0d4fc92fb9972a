//! Plugin traits and static definitions.

use crate::api::PluginApis;
use crate::error::PluginError;
use crate::manager::CommandOutcome;
use bastion_events::{ConfigSchema, EventType, NormalizedEvent};
use std::collections::HashSet;
use std::sync::Arc;

/// Capability surfaces a plugin can request.
///
/// Features name the API groups; a plugin only receives the APIs whose
/// features it declared. Permissions (checked per call) name authorizations
/// to exercise them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ServerInfo,
    Rcon,
    Storage,
    Admin,
    Events,
    Connectors,
    Log,
}

/// The reactor behavior every plugin implements.
///
/// # Lifecycle
///
/// 1. **Initialize** — receives validated config and the capability bundle.
/// 2. **Start** — transition to running; long-running plugins may spawn
///    background work through [`PluginApis::spawn_background`].
/// 3. **HandleEvent** — called on the event-delivery task for every
///    subscribed event. Must not block; offload heavy work to a background
///    task owned by the instance.
/// 4. **Shutdown** — cleanup; called with the instance context already
///    cancelled.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    async fn initialize(
        &mut self,
        config: &serde_json::Value,
        apis: PluginApis,
    ) -> Result<(), PluginError>;

    async fn start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn handle_event(&mut self, event: &NormalizedEvent) -> Result<(), PluginError>;

    /// Dispatches a user-invoked operation exposed by the plugin.
    async fn execute_command(
        &mut self,
        command_id: &str,
        _params: &serde_json::Value,
    ) -> Result<CommandOutcome, PluginError> {
        Err(PluginError::NotFound(format!("command '{command_id}'")))
    }

    async fn shutdown(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Immutable descriptor of one plugin type, registered at startup.
#[derive(Clone)]
pub struct PluginDefinition {
    pub plugin_id: &'static str,
    pub version: &'static str,
    pub author: &'static str,
    pub config_schema: ConfigSchema,
    /// API groups the plugin may obtain. Everything else is gated off.
    pub required_features: HashSet<Feature>,
    /// Connector ids (by type) the plugin expects to resolve at runtime.
    pub required_connectors: Vec<&'static str>,
    /// Events delivered to instances; anything else never reaches them.
    pub subscribed_events: HashSet<EventType>,
    pub allow_multiple_instances: bool,
    /// Long-running plugins get background work tied to their context.
    pub long_running: bool,
    /// Dynamic user plugins run under the sandbox monitor; built-ins do not.
    pub sandboxed: bool,
    pub factory: PluginFactory,
}

impl PluginDefinition {
    pub fn new(
        plugin_id: &'static str,
        version: &'static str,
        author: &'static str,
        factory: impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    ) -> Self {
        Self {
            plugin_id,
            version,
            author,
            config_schema: ConfigSchema::new(),
            required_features: HashSet::new(),
            required_connectors: Vec::new(),
            subscribed_events: HashSet::new(),
            allow_multiple_instances: false,
            long_running: false,
            sandboxed: false,
            factory: Arc::new(factory),
        }
    }

    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.required_features = features.into_iter().collect();
        self
    }

    pub fn with_connectors(mut self, connectors: impl IntoIterator<Item = &'static str>) -> Self {
        self.required_connectors = connectors.into_iter().collect();
        self
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.subscribed_events = events.into_iter().collect();
        self
    }

    pub fn allow_multiple(mut self) -> Self {
        self.allow_multiple_instances = true;
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    pub fn sandboxed(mut self) -> Self {
        self.sandboxed = true;
        self
    }
}

impl std::fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("plugin_id", &self.plugin_id)
            .field("version", &self.version)
            .field("subscribed_events", &self.subscribed_events)
            .field("required_features", &self.required_features)
            .finish()
    }
}
