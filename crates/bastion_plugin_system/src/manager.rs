//! Plugin manager: registry, lifecycle, event delivery and commands.

use crate::api::{ApiSet, PluginApis};
use crate::definition::PluginDefinition;
use crate::error::PluginError;
use crate::instance::{PluginInstance, PluginStatus};
use crate::sandbox::{MemorySampler, SandboxLimits};
use bastion_events::{NormalizedEvent, PluginInstanceId, ServerId, Subscription};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What a plugin command produced.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// The command ran synchronously and produced this result.
    Completed(serde_json::Value),
    /// The command is not finished; callers poll by execution id.
    Accepted,
}

/// Tracked state of one asynchronous command run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandExecution {
    pub execution_id: String,
    pub instance_id: PluginInstanceId,
    pub command_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builds the API wiring for one instance. The composition root uses this
/// to bake the plugin identity into every production API as the permission
/// principal; tests usually ignore the arguments and return a shared
/// recording set. Arguments: plugin id, instance id, server id.
pub type ApiSetFactory =
    Arc<dyn Fn(&str, PluginInstanceId, ServerId) -> ApiSet + Send + Sync>;

/// The per-server plugin instance registry and its event pump.
pub struct PluginManager {
    definitions: DashMap<String, Arc<PluginDefinition>>,
    instances: DashMap<PluginInstanceId, Arc<PluginInstance>>,
    api_factory: ApiSetFactory,
    sandbox_limits: SandboxLimits,
    command_executions: Arc<DashMap<String, CommandExecution>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("definitions", &self.definitions.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl PluginManager {
    pub fn new(api_set: ApiSet) -> Self {
        Self::with_factory(
            Arc::new(move |_, _, _| api_set.clone()),
            SandboxLimits::default(),
        )
    }

    pub fn with_factory(api_factory: ApiSetFactory, sandbox_limits: SandboxLimits) -> Self {
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            api_factory,
            sandbox_limits,
            command_executions: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a plugin definition. Built-ins register at startup; dynamic
    /// plugins register after their library passes verification.
    pub fn register_definition(&self, definition: PluginDefinition) {
        info!(
            "🔌 Registered plugin '{}' v{} by {}",
            definition.plugin_id, definition.version, definition.author
        );
        self.definitions
            .insert(definition.plugin_id.to_string(), Arc::new(definition));
    }

    pub fn definition(&self, plugin_id: &str) -> Option<Arc<PluginDefinition>> {
        self.definitions.get(plugin_id).map(|d| Arc::clone(&d))
    }

    pub fn definition_ids(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.key().clone()).collect()
    }

    /// Creates an instance: validates config against the plugin's schema,
    /// fills defaults, constructs the plugin and runs `Initialize` with the
    /// feature-gated API bundle.
    ///
    /// Validation failures reject the create outright. An `Initialize`
    /// failure registers the instance in `error` state (visible, not
    /// retried) and surfaces the error.
    pub async fn create_instance(
        &self,
        plugin_id: &str,
        server_id: ServerId,
        config: &serde_json::Value,
    ) -> Result<Arc<PluginInstance>, PluginError> {
        let definition = self
            .definition(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;

        if !definition.allow_multiple_instances {
            let duplicate = self.instances.iter().any(|entry| {
                entry.plugin_id == definition.plugin_id && entry.server_id == server_id
            });
            if duplicate {
                return Err(PluginError::InstanceExists(plugin_id.to_string()));
            }
        }

        let config = definition.config_schema.validate_and_fill(config)?;
        let plugin = (definition.factory)();
        let cancel = self.cancel.child_token();
        let instance = Arc::new(PluginInstance::new(
            &definition,
            server_id,
            config,
            plugin,
            cancel.clone(),
        ));

        let apis = PluginApis::new(
            instance.id,
            server_id,
            definition.required_features.clone(),
            (self.api_factory)(definition.plugin_id, instance.id, server_id),
            instance.sandbox(),
            cancel,
        );

        let init_result = {
            let mut plugin = instance.plugin.lock().await;
            plugin.initialize(instance.config(), apis).await
        };
        match init_result {
            Ok(()) => {
                self.instances.insert(instance.id, Arc::clone(&instance));
                info!(
                    "🔌 Plugin instance {} ({plugin_id}) created on server {server_id}",
                    instance.id
                );
                Ok(instance)
            }
            Err(e) => {
                instance.set_status(PluginStatus::Error);
                self.instances.insert(instance.id, Arc::clone(&instance));
                error!("❌ Plugin '{plugin_id}' failed to initialize: {e}");
                Err(e)
            }
        }
    }

    /// Starts a stopped instance: `stopped → starting → running`. A failing
    /// start transitions to `error` and is not retried.
    pub async fn start(&self, instance_id: PluginInstanceId) -> Result<(), PluginError> {
        let instance = self.instance(instance_id)?;
        if instance.status() != PluginStatus::Stopped {
            return Err(PluginError::ExecutionError(format!(
                "instance {instance_id} is {:?}, expected stopped",
                instance.status()
            )));
        }
        instance.set_status(PluginStatus::Starting);
        let result = {
            let mut plugin = instance.plugin.lock().await;
            plugin.start().await
        };
        match result {
            Ok(()) => {
                instance.set_status(PluginStatus::Running);
                info!("▶️ Plugin instance {instance_id} running");
                Ok(())
            }
            Err(e) => {
                instance.set_status(PluginStatus::Error);
                error!("❌ Plugin instance {instance_id} failed to start: {e}");
                Err(e)
            }
        }
    }

    /// Stops an instance: cancels its context, runs `Shutdown`, transitions
    /// to `stopped`.
    pub async fn stop(&self, instance_id: PluginInstanceId) -> Result<(), PluginError> {
        let instance = self.instance(instance_id)?;
        instance.set_status(PluginStatus::Stopping);
        instance.cancel.cancel();
        let result = {
            let mut plugin = instance.plugin.lock().await;
            plugin.shutdown().await
        };
        instance.set_status(PluginStatus::Stopped);
        if let Err(e) = &result {
            warn!("Plugin instance {instance_id} shutdown reported: {e}");
        }
        info!("⏹️ Plugin instance {instance_id} stopped");
        result
    }

    /// Removes a stopped instance from the registry.
    pub async fn destroy(&self, instance_id: PluginInstanceId) -> Result<(), PluginError> {
        if self.instance(instance_id)?.status() == PluginStatus::Running {
            self.stop(instance_id).await?;
        }
        self.instances.remove(&instance_id);
        Ok(())
    }

    /// Delivers one event to every running instance on the event's server
    /// that declared its type.
    ///
    /// Delivery is synchronous on the caller's task; plugins must not block
    /// here (heavy work goes to background tasks via the sandbox handle). A
    /// failing handler is logged, the instance stays running, and the event
    /// is not redelivered.
    pub async fn handle_event(&self, event: &NormalizedEvent) {
        let targets: Vec<Arc<PluginInstance>> = self
            .instances
            .iter()
            .filter(|entry| {
                entry.server_id == event.server_id
                    && entry.status() == PluginStatus::Running
                    && entry.subscribes_to(&event.event_type)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for instance in targets {
            let started = Instant::now();
            let result = {
                let mut plugin = instance.plugin.lock().await;
                plugin.handle_event(event).await
            };
            instance.sandbox.record_busy(started.elapsed());
            if let Err(e) = result {
                warn!(
                    "Plugin instance {} failed handling {}: {e}",
                    instance.id, event.event_type
                );
            }
        }
    }

    /// Spawns the event pump draining a bus subscription into
    /// [`Self::handle_event`].
    pub fn spawn_event_pump(self: &Arc<Self>, mut subscription: Subscription) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        manager.handle_event(&event).await;
                    }
                }
            }
            debug!("Plugin event pump exited");
        });
    }

    /// Dispatches a user-invoked plugin command.
    ///
    /// With `background = false` the command runs inline and returns its
    /// result. With `background = true` an execution id is returned at once;
    /// progress is visible through [`Self::command_execution_status`].
    pub async fn execute_command(
        &self,
        instance_id: PluginInstanceId,
        command_id: &str,
        params: serde_json::Value,
        background: bool,
    ) -> Result<CommandExecution, PluginError> {
        let instance = self.instance(instance_id)?;
        if instance.status() != PluginStatus::Running {
            return Err(PluginError::ExecutionError(format!(
                "instance {instance_id} is not running"
            )));
        }

        let execution_id = Uuid::new_v4().to_string();
        let mut execution = CommandExecution {
            execution_id: execution_id.clone(),
            instance_id,
            command_id: command_id.to_string(),
            status: "running".to_string(),
            result: None,
            error: None,
        };

        if background {
            self.command_executions
                .insert(execution_id.clone(), execution.clone());
            let instance = Arc::clone(&instance);
            let executions = Arc::clone(&self.command_executions);
            let command_id = command_id.to_string();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = {
                    let mut plugin = instance.plugin.lock().await;
                    plugin.execute_command(&command_id, &params).await
                };
                instance.sandbox.record_busy(started.elapsed());
                if let Some(mut tracked) = executions.get_mut(&execution_id) {
                    match outcome {
                        Ok(CommandOutcome::Completed(value)) => {
                            tracked.status = "completed".to_string();
                            tracked.result = Some(value);
                        }
                        Ok(CommandOutcome::Accepted) => {
                            tracked.status = "completed".to_string();
                        }
                        Err(e) => {
                            tracked.status = "failed".to_string();
                            tracked.error = Some(e.to_string());
                        }
                    }
                }
            });
            execution.status = "accepted".to_string();
            return Ok(execution);
        }

        let started = Instant::now();
        let outcome = {
            let mut plugin = instance.plugin.lock().await;
            plugin.execute_command(command_id, &params).await
        };
        instance.sandbox.record_busy(started.elapsed());
        match outcome? {
            CommandOutcome::Completed(value) => {
                execution.status = "completed".to_string();
                execution.result = Some(value);
            }
            CommandOutcome::Accepted => {
                execution.status = "accepted".to_string();
            }
        }
        Ok(execution)
    }

    /// Status of an asynchronous command run.
    pub fn command_execution_status(&self, execution_id: &str) -> Option<CommandExecution> {
        self.command_executions
            .get(execution_id)
            .map(|e| e.clone())
    }

    /// Spawns the sandbox monitor: samples sandboxed instances on the limit
    /// period and stops any instance over a ceiling.
    pub fn spawn_sandbox_monitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut sampler = MemorySampler::new();
            let mut ticker = tokio::time::interval(manager.sandbox_limits.sample_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let memory_growth = sampler.as_mut().map(|s| s.growth()).unwrap_or(0);
                let over_memory = memory_growth > manager.sandbox_limits.max_memory_bytes;

                let sandboxed: Vec<Arc<PluginInstance>> = manager
                    .instances
                    .iter()
                    .filter(|entry| entry.sandboxed && entry.status() == PluginStatus::Running)
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();

                for instance in sandboxed {
                    let breach = instance.sandbox.check(&manager.sandbox_limits).or_else(|| {
                        over_memory.then(|| {
                            format!(
                                "process memory growth {memory_growth}B exceeds limit {}B",
                                manager.sandbox_limits.max_memory_bytes
                            )
                        })
                    });
                    if let Some(reason) = breach {
                        error!(
                            "🚨 Sandbox breach on plugin instance {}: {reason}",
                            instance.id
                        );
                        instance.set_status(PluginStatus::Error);
                        instance.cancel.cancel();
                        let mut plugin = instance.plugin.lock().await;
                        if let Err(e) = plugin.shutdown().await {
                            warn!("Breached instance {} shutdown failed: {e}", instance.id);
                        }
                    }
                }
            }
            debug!("Sandbox monitor exited");
        });
    }

    /// Stops every instance and cancels the manager context.
    pub async fn shutdown_all(&self) {
        info!("🛑 Stopping {} plugin instances", self.instances.len());
        let ids: Vec<PluginInstanceId> = self.instances.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                warn!("Plugin instance {id} stop during shutdown failed: {e}");
            }
        }
        self.cancel.cancel();
    }

    pub fn instance(&self, id: PluginInstanceId) -> Result<Arc<PluginInstance>, PluginError> {
        self.instances
            .get(&id)
            .map(|i| Arc::clone(&i))
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn instances_for(&self, server_id: ServerId) -> Vec<Arc<PluginInstance>> {
        self.instances
            .iter()
            .filter(|e| e.server_id == server_id)
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Feature, Plugin, PluginDefinition};
    use crate::testing::{recording_api_set, RecorderPlugin, RecorderState};
    use bastion_events::{EventSource, EventType};
    use serde_json::json;

    fn recorder_definition(state: Arc<RecorderState>) -> PluginDefinition {
        PluginDefinition::new("recorder", "1.0.0", "tests", move || {
            Box::new(RecorderPlugin::new(Arc::clone(&state))) as Box<dyn Plugin>
        })
        .with_events([EventType::ChatMessage])
        .with_features([Feature::Log])
    }

    fn chat_event(server_id: ServerId) -> NormalizedEvent {
        NormalizedEvent::from_value(
            server_id,
            EventSource::Rcon,
            EventType::ChatMessage,
            json!({"message": "hello"}),
            None,
        )
    }

    fn died_event(server_id: ServerId) -> NormalizedEvent {
        NormalizedEvent::from_value(
            server_id,
            EventSource::Log,
            EventType::PlayerDied,
            json!({}),
            None,
        )
    }

    #[tokio::test]
    async fn lifecycle_reaches_running_and_delivers_subscribed_events() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        manager.register_definition(recorder_definition(Arc::clone(&state)));

        let server = ServerId::new();
        let instance = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        assert_eq!(instance.status(), PluginStatus::Stopped);

        manager.start(instance.id).await.unwrap();
        assert_eq!(instance.status(), PluginStatus::Running);

        manager.handle_event(&chat_event(server)).await;
        assert_eq!(state.events(), vec!["CHAT_MESSAGE".to_string()]);

        manager.stop(instance.id).await.unwrap();
        assert_eq!(instance.status(), PluginStatus::Stopped);
        assert!(state.was_shut_down());
    }

    #[tokio::test]
    async fn undeclared_event_types_are_never_delivered() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        manager.register_definition(recorder_definition(Arc::clone(&state)));

        let server = ServerId::new();
        let instance = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        manager.handle_event(&died_event(server)).await;
        assert!(state.events().is_empty());
    }

    #[tokio::test]
    async fn events_from_other_servers_are_not_delivered() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        manager.register_definition(recorder_definition(Arc::clone(&state)));

        let server = ServerId::new();
        let instance = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        manager.handle_event(&chat_event(ServerId::new())).await;
        assert!(state.events().is_empty());
    }

    #[tokio::test]
    async fn single_instance_plugins_reject_duplicates() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        manager.register_definition(recorder_definition(state));

        let server = ServerId::new();
        manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        let err = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InstanceExists(_)));
    }

    #[tokio::test]
    async fn failing_handler_keeps_the_instance_running() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        state.fail_next_event();
        manager.register_definition(recorder_definition(Arc::clone(&state)));

        let server = ServerId::new();
        let instance = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        manager.handle_event(&chat_event(server)).await;
        assert_eq!(instance.status(), PluginStatus::Running);

        // The next event is delivered normally - no redelivery of the failed one.
        manager.handle_event(&chat_event(server)).await;
        assert_eq!(state.events().len(), 1);
    }

    #[tokio::test]
    async fn background_commands_are_pollable() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        manager.register_definition(recorder_definition(state));

        let server = ServerId::new();
        let instance = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        let execution = manager
            .execute_command(instance.id, "echo", json!({"value": 7}), true)
            .await
            .unwrap();
        assert_eq!(execution.status, "accepted");

        // Poll until the background task finishes.
        let mut status = None;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            status = manager.command_execution_status(&execution.execution_id);
            if status.as_ref().map(|s| s.status == "completed").unwrap_or(false) {
                break;
            }
        }
        let status = status.unwrap();
        assert_eq!(status.status, "completed");
        assert_eq!(status.result, Some(json!({"value": 7})));
    }

    #[tokio::test]
    async fn unknown_command_fails_inline() {
        let (api_set, _recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        let state = RecorderState::new();
        manager.register_definition(recorder_definition(state));

        let server = ServerId::new();
        let instance = manager
            .create_instance("recorder", server, &json!({}))
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        let err = manager
            .execute_command(instance.id, "nope", json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }
}
