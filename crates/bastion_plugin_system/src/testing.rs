//! Recording test doubles for the capability APIs.
//!
//! Manager, built-in plugin and downstream wiring tests all need an
//! [`ApiSet`]; this module provides one whose implementations record calls
//! instead of reaching real subsystems. Lives in the crate proper (not
//! behind `cfg(test)`) so dependent crates can reuse it in their own tests.

use crate::api::{
    AdminApi, ApiError, ApiSet, ConnectorApi, EventApi, PluginApis, PluginLogApi, PluginStoreApi,
    RconApi, ServerInfoApi,
};
use crate::definition::Plugin;
use crate::error::PluginError;
use crate::manager::CommandOutcome;
use bastion_events::{NormalizedEvent, PluginInstanceId, ServerId, ServerRecord};
use bastion_connectors::ConnectorInstance;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared recorder behind every API trait in the set.
#[derive(Default)]
pub struct ApiRecorder {
    pub rcon_commands: Mutex<Vec<(ServerId, String)>>,
    pub published_events: Mutex<Vec<NormalizedEvent>>,
    pub log_lines: Mutex<Vec<String>>,
    pub store: DashMap<(PluginInstanceId, String), serde_json::Value>,
}

impl ApiRecorder {
    pub fn rcon_commands(&self) -> Vec<String> {
        self.rcon_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.log_lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct Recording(Arc<ApiRecorder>);

#[async_trait::async_trait]
impl ServerInfoApi for Recording {
    async fn server(&self, server_id: ServerId) -> Result<ServerRecord, ApiError> {
        Ok(ServerRecord {
            id: server_id,
            name: "test server".to_string(),
            host: "127.0.0.1".to_string(),
            game_port: 7787,
            rcon_port: 21114,
            rcon_password: String::new(),
        })
    }

    async fn player_names(&self, _server_id: ServerId) -> Result<Vec<String>, ApiError> {
        Ok(vec!["Alice".to_string(), "Bob".to_string()])
    }
}

#[async_trait::async_trait]
impl RconApi for Recording {
    async fn execute(&self, server_id: ServerId, command: &str) -> Result<String, ApiError> {
        self.0
            .rcon_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((server_id, command.to_string()));
        Ok(String::new())
    }

    async fn broadcast(&self, server_id: ServerId, message: &str) -> Result<(), ApiError> {
        self.execute(server_id, &format!("AdminBroadcast {message}"))
            .await
            .map(|_| ())
    }

    async fn warn(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<(), ApiError> {
        self.execute(server_id, &format!("AdminWarn \"{player}\" {message}"))
            .await
            .map(|_| ())
    }

    async fn kick(
        &self,
        server_id: ServerId,
        player: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        self.execute(server_id, &format!("AdminKick \"{player}\" {reason}"))
            .await
            .map(|_| ())
    }

    async fn ban(
        &self,
        server_id: ServerId,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        self.execute(server_id, &format!("AdminBan \"{player}\" {interval} {reason}"))
            .await
            .map(|_| ())
    }

    async fn chat_message(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<(), ApiError> {
        self.warn(server_id, player, message).await
    }
}

#[async_trait::async_trait]
impl PluginStoreApi for Recording {
    async fn get(
        &self,
        instance_id: PluginInstanceId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ApiError> {
        Ok(self.0.store.get(&(instance_id, key.to_string())).map(|v| v.clone()))
    }

    async fn set(
        &self,
        instance_id: PluginInstanceId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), ApiError> {
        self.0.store.insert((instance_id, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, instance_id: PluginInstanceId, key: &str) -> Result<(), ApiError> {
        self.0.store.remove(&(instance_id, key.to_string()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdminApi for Recording {
    async fn is_admin(&self, _server_id: ServerId, _platform_id: &str) -> Result<bool, ApiError> {
        Ok(false)
    }
}

impl EventApi for Recording {
    fn publish(&self, event: NormalizedEvent) -> Result<(), ApiError> {
        self.0
            .published_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

impl ConnectorApi for Recording {
    fn acquire(
        &self,
        _server_id: ServerId,
        connector_id: &str,
    ) -> Result<Arc<ConnectorInstance>, ApiError> {
        Err(ApiError::Unavailable(format!(
            "no connector '{connector_id}' in the recording set"
        )))
    }
}

#[async_trait::async_trait]
impl PluginLogApi for Recording {
    async fn log(
        &self,
        _instance_id: PluginInstanceId,
        _server_id: ServerId,
        level: &str,
        message: &str,
        _error: Option<String>,
        _fields: serde_json::Value,
    ) -> Result<(), ApiError> {
        self.0
            .log_lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("[{level}] {message}"));
        Ok(())
    }
}

/// Builds an [`ApiSet`] whose every trait records into the returned recorder.
pub fn recording_api_set() -> (ApiSet, Arc<ApiRecorder>) {
    let recorder = Arc::new(ApiRecorder::default());
    let set = ApiSet {
        server_info: Arc::new(Recording(Arc::clone(&recorder))),
        rcon: Arc::new(Recording(Arc::clone(&recorder))),
        store: Arc::new(Recording(Arc::clone(&recorder))),
        admin: Arc::new(Recording(Arc::clone(&recorder))),
        events: Arc::new(Recording(Arc::clone(&recorder))),
        connectors: Arc::new(Recording(Arc::clone(&recorder))),
        log: Arc::new(Recording(Arc::clone(&recorder))),
    };
    (set, recorder)
}

// ============================================================================
// Recorder Plugin
// ============================================================================

/// Observable state shared between a [`RecorderPlugin`] and its test.
#[derive(Default)]
pub struct RecorderState {
    events: Mutex<Vec<String>>,
    shut_down: AtomicBool,
    fail_next: AtomicBool,
    fail_initialize: AtomicBool,
}

impl RecorderState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Relaxed)
    }

    pub fn fail_next_event(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::Relaxed);
    }
}

/// A plugin that records what happens to it. The `echo` command completes
/// with its own params, which background-command tests poll for.
pub struct RecorderPlugin {
    state: Arc<RecorderState>,
}

impl RecorderPlugin {
    pub fn new(state: Arc<RecorderState>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl Plugin for RecorderPlugin {
    async fn initialize(
        &mut self,
        _config: &serde_json::Value,
        _apis: PluginApis,
    ) -> Result<(), PluginError> {
        if self.state.fail_initialize.load(Ordering::Relaxed) {
            return Err(PluginError::InitializationFailed("requested by test".into()));
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: &NormalizedEvent) -> Result<(), PluginError> {
        if self.state.fail_next.swap(false, Ordering::Relaxed) {
            return Err(PluginError::ExecutionError("requested by test".into()));
        }
        self.state
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.event_type.as_str().to_string());
        Ok(())
    }

    async fn execute_command(
        &mut self,
        command_id: &str,
        params: &serde_json::Value,
    ) -> Result<CommandOutcome, PluginError> {
        match command_id {
            "echo" => Ok(CommandOutcome::Completed(params.clone())),
            other => Err(PluginError::NotFound(format!("command '{other}'"))),
        }
    }

    async fn shutdown(&mut self) -> Result<(), PluginError> {
        self.state.shut_down.store(true, Ordering::Relaxed);
        Ok(())
    }
}
