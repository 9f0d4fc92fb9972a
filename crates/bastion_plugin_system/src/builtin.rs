//! Built-in plugins registered at startup.

use crate::api::PluginApis;
use crate::definition::{Feature, Plugin, PluginDefinition};
use crate::error::PluginError;
use bastion_events::{
    ChatMessagePayload, ConfigSchema, EventType, FieldKind, NormalizedEvent,
};
use serde_json::json;

/// Registers every built-in plugin definition.
pub fn register_builtin_plugins(manager: &crate::manager::PluginManager) {
    manager.register_definition(chat_logger_definition());
    manager.register_definition(seeding_broadcast_definition());
}

// ============================================================================
// Chat Logger
// ============================================================================

/// Persists every chat line through the plugin log API.
pub fn chat_logger_definition() -> PluginDefinition {
    PluginDefinition::new("chat_logger", "1.1.0", "bastion", || {
        Box::new(ChatLoggerPlugin::default())
    })
    .with_events([EventType::ChatMessage, EventType::ChatCommand])
    .with_features([Feature::Log])
    .with_schema(
        ConfigSchema::new().optional("level", FieldKind::String, json!("info")),
    )
}

#[derive(Default)]
struct ChatLoggerPlugin {
    apis: Option<PluginApis>,
    level: String,
}

#[async_trait::async_trait]
impl Plugin for ChatLoggerPlugin {
    async fn initialize(
        &mut self,
        config: &serde_json::Value,
        apis: PluginApis,
    ) -> Result<(), PluginError> {
        self.level = config["level"].as_str().unwrap_or("info").to_string();
        // Fail fast if the log feature got stripped from the definition.
        apis.log()?;
        self.apis = Some(apis);
        Ok(())
    }

    async fn handle_event(&mut self, event: &NormalizedEvent) -> Result<(), PluginError> {
        let apis = self
            .apis
            .as_ref()
            .ok_or_else(|| PluginError::Runtime("handle_event before initialize".into()))?;
        let payload: ChatMessagePayload = event
            .payload()
            .map_err(|e| PluginError::ExecutionError(e.to_string()))?;
        apis.log()?
            .log(
                apis.instance_id(),
                event.server_id,
                &self.level,
                &format!("[{}] {}: {}", payload.channel, payload.player_name, payload.message),
                None,
                json!({ "steam_id": payload.steam_id, "eos_id": payload.eos_id }),
            )
            .await
            .map_err(|e| PluginError::ExecutionError(e.to_string()))
    }
}

// ============================================================================
// Seeding Broadcast
// ============================================================================

/// Greets each new match with a configurable broadcast. The classic use is a
/// seeding-rules reminder while the server fills.
pub fn seeding_broadcast_definition() -> PluginDefinition {
    PluginDefinition::new("seeding_broadcast", "1.0.2", "bastion", || {
        Box::new(SeedingBroadcastPlugin::default())
    })
    .with_events([EventType::NewGame])
    .with_features([Feature::Rcon])
    .with_schema(ConfigSchema::new().optional(
        "message",
        FieldKind::String,
        json!("Seeding rules are in effect: no main camping, fight mid cap only."),
    ))
}

#[derive(Default)]
struct SeedingBroadcastPlugin {
    apis: Option<PluginApis>,
    message: String,
}

#[async_trait::async_trait]
impl Plugin for SeedingBroadcastPlugin {
    async fn initialize(
        &mut self,
        config: &serde_json::Value,
        apis: PluginApis,
    ) -> Result<(), PluginError> {
        self.message = config["message"].as_str().unwrap_or_default().to_string();
        apis.rcon()?;
        self.apis = Some(apis);
        Ok(())
    }

    async fn handle_event(&mut self, event: &NormalizedEvent) -> Result<(), PluginError> {
        let apis = self
            .apis
            .as_ref()
            .ok_or_else(|| PluginError::Runtime("handle_event before initialize".into()))?;
        apis.rcon()?
            .broadcast(event.server_id, &self.message)
            .await
            .map_err(|e| PluginError::ExecutionError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PluginManager;
    use crate::testing::recording_api_set;
    use bastion_events::{EventSource, ServerId};
    use std::sync::Arc;

    #[tokio::test]
    async fn chat_logger_writes_one_log_line_per_chat() {
        let (api_set, recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        register_builtin_plugins(&manager);

        let server = ServerId::new();
        let instance = manager
            .create_instance("chat_logger", server, &json!({}))
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        let event = NormalizedEvent::from_payload(
            server,
            EventSource::Rcon,
            EventType::ChatMessage,
            &ChatMessagePayload {
                player_name: "Alice".into(),
                steam_id: None,
                eos_id: None,
                channel: "ChatAll".into(),
                message: "gg".into(),
            },
            None,
        )
        .unwrap();
        manager.handle_event(&event).await;

        let lines = recorder.log_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Alice: gg"));
    }

    #[tokio::test]
    async fn seeding_broadcast_fires_on_new_game_only() {
        let (api_set, recorder) = recording_api_set();
        let manager = Arc::new(PluginManager::new(api_set));
        register_builtin_plugins(&manager);

        let server = ServerId::new();
        let instance = manager
            .create_instance(
                "seeding_broadcast",
                server,
                &json!({"message": "Seeding: cap the middle"}),
            )
            .await
            .unwrap();
        manager.start(instance.id).await.unwrap();

        let new_game = NormalizedEvent::from_value(
            server,
            EventSource::Log,
            EventType::NewGame,
            json!({"map_name": "Narva", "layer_name": "Narva_AAS_v1"}),
            None,
        );
        manager.handle_event(&new_game).await;

        let round_ended = NormalizedEvent::from_value(
            server,
            EventSource::Log,
            EventType::RoundEnded,
            json!({"layer": "Narva_AAS_v1"}),
            None,
        );
        manager.handle_event(&round_ended).await;

        let commands = recorder.rcon_commands();
        assert_eq!(commands, vec!["AdminBroadcast Seeding: cap the middle".to_string()]);
    }
}
