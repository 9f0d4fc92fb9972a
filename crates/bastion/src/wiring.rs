//! Production capability implementations.
//!
//! This is where the abstract seams meet the live subsystems: the plugin
//! [`ApiSet`] backed by the console manager, permission service, connector
//! registry and telemetry sink; and the workflow [`ActionDispatcher`] backed
//! by the same console manager plus an HTTP client.
//!
//! Every privileged call runs a permission check first — plugins act as
//! `plugin:<plugin_id>`, the workflow engine as `workflow-engine` — and a
//! denial surfaces as an authorization error to the caller, never a silent
//! no-op.

use bastion_access::PermissionService;
use bastion_connectors::{ConnectorManager, DiscordWebhookConnector};
use bastion_events::{EventBus, EventSource, NormalizedEvent, PluginInstanceId, ServerId, ServerRecord};
use bastion_plugin_system::{
    AdminApi, ApiError, ApiSet, ConnectorApi, EventApi, PluginLogApi, PluginStoreApi, RconApi,
    ServerInfoApi,
};
use bastion_rcon::ConnectionManager;
use bastion_telemetry::{PluginLogRecord, TelemetrySink};
use bastion_workflow::{ActionDispatcher, WorkflowError};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shared infrastructure handed to every production API value.
#[derive(Clone)]
pub struct CoreServices {
    pub bus: Arc<EventBus>,
    pub connections: Arc<ConnectionManager>,
    pub permissions: Arc<PermissionService>,
    pub connectors: Arc<ConnectorManager>,
    pub sink: Arc<dyn TelemetrySink>,
    pub servers: Arc<DashMap<ServerId, ServerRecord>>,
    /// In-memory plugin KV storage, namespaced per instance.
    pub plugin_store: Arc<DashMap<(PluginInstanceId, String), Value>>,
}

/// Builds the per-instance API set with the plugin as acting principal.
pub fn plugin_api_factory(services: CoreServices) -> bastion_plugin_system::ApiSetFactory {
    Arc::new(move |plugin_id, _instance_id, _server_id| {
        let apis = Arc::new(PanelApis {
            services: services.clone(),
            principal: format!("plugin:{plugin_id}"),
        });
        ApiSet {
            server_info: apis.clone(),
            rcon: apis.clone(),
            store: apis.clone(),
            admin: apis.clone(),
            events: apis.clone(),
            connectors: apis.clone(),
            log: apis,
        }
    })
}

/// One value implementing the whole capability surface for one principal.
struct PanelApis {
    services: CoreServices,
    principal: String,
}

impl PanelApis {
    fn authorize(&self, server_id: ServerId, required: &str) -> Result<(), ApiError> {
        self.services
            .permissions
            .require(&self.principal, server_id, required)
            .map_err(ApiError::from)
    }

    async fn console(&self, server_id: ServerId, command: &str) -> Result<String, ApiError> {
        self.services
            .connections
            .execute(server_id, command)
            .await
            .map_err(|e| ApiError::Call(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ServerInfoApi for PanelApis {
    async fn server(&self, server_id: ServerId) -> Result<ServerRecord, ApiError> {
        self.authorize(server_id, "server:info")?;
        self.services
            .servers
            .get(&server_id)
            .map(|s| s.clone())
            .ok_or_else(|| ApiError::Unavailable(format!("unknown server {server_id}")))
    }

    async fn player_names(&self, server_id: ServerId) -> Result<Vec<String>, ApiError> {
        self.authorize(server_id, "server:info")?;
        let listing = self.console(server_id, "ListPlayers").await?;
        Ok(parse_player_names(&listing))
    }
}

#[async_trait::async_trait]
impl RconApi for PanelApis {
    async fn execute(&self, server_id: ServerId, command: &str) -> Result<String, ApiError> {
        self.authorize(server_id, "rcon:execute")?;
        self.console(server_id, command).await
    }

    async fn broadcast(&self, server_id: ServerId, message: &str) -> Result<(), ApiError> {
        self.authorize(server_id, "rcon:broadcast")?;
        self.console(server_id, &format!("AdminBroadcast {message}"))
            .await
            .map(|_| ())
    }

    async fn warn(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<(), ApiError> {
        self.authorize(server_id, "rcon:warn")?;
        self.console(server_id, &format!("AdminWarn \"{player}\" {message}"))
            .await
            .map(|_| ())
    }

    async fn kick(
        &self,
        server_id: ServerId,
        player: &str,
        reason: &str,
    ) -> Result<(), ApiError> {
        self.authorize(server_id, "rcon:kick")?;
        self.console(server_id, &format!("AdminKick \"{player}\" {reason}"))
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
        self.authorize(server_id, "rcon:ban")?;
        self.console(
            server_id,
            &format!("AdminBan \"{player}\" {interval} {reason}"),
        )
        .await
        .map(|_| ())
    }

    async fn chat_message(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<(), ApiError> {
        self.authorize(server_id, "rcon:chat")?;
        // The console has no whisper; a targeted warn renders as a direct
        // message box on the player's screen.
        self.console(server_id, &format!("AdminWarn \"{player}\" {message}"))
            .await
            .map(|_| ())
    }
}

#[async_trait::async_trait]
impl PluginStoreApi for PanelApis {
    async fn get(
        &self,
        instance_id: PluginInstanceId,
        key: &str,
    ) -> Result<Option<Value>, ApiError> {
        Ok(self
            .services
            .plugin_store
            .get(&(instance_id, key.to_string()))
            .map(|v| v.clone()))
    }

    async fn set(
        &self,
        instance_id: PluginInstanceId,
        key: &str,
        value: Value,
    ) -> Result<(), ApiError> {
        self.services
            .plugin_store
            .insert((instance_id, key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, instance_id: PluginInstanceId, key: &str) -> Result<(), ApiError> {
        self.services
            .plugin_store
            .remove(&(instance_id, key.to_string()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdminApi for PanelApis {
    async fn is_admin(&self, server_id: ServerId, platform_id: &str) -> Result<bool, ApiError> {
        self.authorize(server_id, "server:info")?;
        Ok(self
            .services
            .permissions
            .check(&format!("user:{platform_id}"), server_id, "rcon:admin"))
    }
}

impl EventApi for PanelApis {
    fn publish(&self, mut event: NormalizedEvent) -> Result<(), ApiError> {
        self.authorize(event.server_id, "events:publish")?;
        event.source = EventSource::Plugin;
        self.services.bus.publish(event);
        Ok(())
    }
}

impl ConnectorApi for PanelApis {
    fn acquire(
        &self,
        server_id: ServerId,
        connector_id: &str,
    ) -> Result<Arc<bastion_connectors::ConnectorInstance>, ApiError> {
        self.authorize(server_id, "connectors:acquire")?;
        self.services
            .connectors
            .resolve(server_id, connector_id)
            .ok_or_else(|| ApiError::Unavailable(format!("no connector '{connector_id}'")))
    }
}

#[async_trait::async_trait]
impl PluginLogApi for PanelApis {
    async fn log(
        &self,
        instance_id: PluginInstanceId,
        server_id: ServerId,
        level: &str,
        message: &str,
        error: Option<String>,
        fields: Value,
    ) -> Result<(), ApiError> {
        let record = PluginLogRecord {
            timestamp: Utc::now(),
            server_id,
            plugin_instance_id: instance_id.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            error,
            fields,
        };
        self.services
            .sink
            .write_plugin_log(&record)
            .await
            .map_err(|e| ApiError::Call(e.to_string()))
    }
}

/// Pulls player names out of a `ListPlayers` console reply.
fn parse_player_names(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            // "ID: 3 | Online IDs: ... | Name: Bravo Six | ..."
            line.split('|')
                .map(str::trim)
                .find_map(|part| part.strip_prefix("Name: "))
                .map(str::to_string)
        })
        .collect()
}

// ============================================================================
// Workflow Action Dispatcher
// ============================================================================

/// Principal the workflow engine acts as.
const WORKFLOW_PRINCIPAL: &str = "workflow-engine";

/// The production dispatcher behind workflow `action` steps and script host
/// calls.
pub struct PanelDispatcher {
    services: CoreServices,
    http: reqwest::Client,
}

impl PanelDispatcher {
    pub fn new(services: CoreServices) -> Result<Self, Box<dyn std::error::Error>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { services, http })
    }

    fn authorize(&self, server_id: ServerId, required: &str) -> Result<(), WorkflowError> {
        self.services
            .permissions
            .require(WORKFLOW_PRINCIPAL, server_id, required)
            .map_err(|e| WorkflowError::Unauthorized(e.to_string()))
    }

    async fn console(&self, server_id: ServerId, command: &str) -> Result<Value, WorkflowError> {
        let response = self
            .services
            .connections
            .execute(server_id, command)
            .await
            .map_err(|e| WorkflowError::ActionFailed(e.to_string()))?;
        Ok(json!({ "command": command, "response": response }))
    }
}

#[async_trait::async_trait]
impl ActionDispatcher for PanelDispatcher {
    async fn rcon_command(
        &self,
        server_id: ServerId,
        command: &str,
    ) -> Result<Value, WorkflowError> {
        self.authorize(server_id, "rcon:execute")?;
        self.console(server_id, command).await
    }

    async fn admin_broadcast(
        &self,
        server_id: ServerId,
        message: &str,
    ) -> Result<Value, WorkflowError> {
        self.authorize(server_id, "rcon:broadcast")?;
        self.console(server_id, &format!("AdminBroadcast {message}")).await
    }

    async fn chat_message(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<Value, WorkflowError> {
        self.authorize(server_id, "rcon:chat")?;
        self.console(server_id, &format!("AdminWarn \"{player}\" {message}"))
            .await
    }

    async fn kick_player(
        &self,
        server_id: ServerId,
        player: &str,
        reason: &str,
    ) -> Result<Value, WorkflowError> {
        self.authorize(server_id, "rcon:kick")?;
        self.console(server_id, &format!("AdminKick \"{player}\" {reason}"))
            .await
    }

    async fn ban_player(
        &self,
        server_id: ServerId,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<Value, WorkflowError> {
        self.authorize(server_id, "rcon:ban")?;
        self.console(
            server_id,
            &format!("AdminBan \"{player}\" {interval} {reason}"),
        )
        .await
    }

    async fn warn_player(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<Value, WorkflowError> {
        self.authorize(server_id, "rcon:warn")?;
        self.console(server_id, &format!("AdminWarn \"{player}\" {message}"))
            .await
    }

    async fn http_request(
        &self,
        method: &str,
        url: &str,
        headers: &Value,
        body: Option<String>,
    ) -> Result<Value, WorkflowError> {
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| WorkflowError::ActionFailed(format!("bad HTTP method '{method}'")))?;
        let mut request = self.http.request(method, url);
        if let Some(headers) = headers.as_object() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| WorkflowError::ActionFailed(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| WorkflowError::ActionFailed(e.to_string()))?;
        Ok(json!({ "status": status, "body": text }))
    }

    async fn webhook(&self, url: &str, payload: &Value) -> Result<Value, WorkflowError> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| WorkflowError::ActionFailed(e.to_string()))?;
        Ok(json!({ "status": response.status().as_u16() }))
    }

    async fn discord_message(
        &self,
        server_id: ServerId,
        content: &str,
    ) -> Result<Value, WorkflowError> {
        let instance = self
            .services
            .connectors
            .resolve(server_id, "discord")
            .ok_or_else(|| {
                WorkflowError::ActionFailed("no 'discord' connector configured".to_string())
            })?;
        let guard = instance.connector().await;
        let webhook = guard
            .as_any()
            .downcast_ref::<DiscordWebhookConnector>()
            .ok_or_else(|| {
                WorkflowError::ActionFailed("'discord' connector has the wrong type".to_string())
            })?;
        webhook
            .send_message(content)
            .await
            .map_err(|e| WorkflowError::ActionFailed(e.to_string()))?;
        Ok(json!({ "sent": true }))
    }

    async fn log_message(&self, level: &str, message: &str) -> Result<Value, WorkflowError> {
        match level {
            "error" => error!("[workflow] {message}"),
            "warn" => warn!("[workflow] {message}"),
            "debug" => debug!("[workflow] {message}"),
            _ => info!("[workflow] {message}"),
        }
        Ok(json!({ "logged": true }))
    }
}
