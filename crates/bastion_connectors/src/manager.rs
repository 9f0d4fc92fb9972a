//! Connector instance lifecycle and lookup.

use crate::definition::{
    Connector, ConnectorContext, ConnectorDefinition, ConnectorError, ConnectorStatus, ScopeKey,
};
use bastion_events::{EventBus, ServerId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Persisted configuration for one connector instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectorConfigRecord {
    /// Instance id, stable across config updates.
    pub id: String,
    /// The connector type name (`discord_webhook`, `kv_store`, ...).
    pub connector_type: String,
    /// `None` for global scope, `Some` for per-server instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ConnectorConfigRecord {
    pub fn scope_key(&self) -> ScopeKey {
        match self.server_id {
            Some(id) => ScopeKey::Server(id),
            None => ScopeKey::Global,
        }
    }
}

/// A live connector instance.
pub struct ConnectorInstance {
    pub id: String,
    pub connector_type: String,
    pub scope_key: ScopeKey,
    config: std::sync::Mutex<serde_json::Value>,
    status: std::sync::Mutex<ConnectorStatus>,
    handle: Mutex<Box<dyn Connector>>,
}

impl ConnectorInstance {
    /// Locks the underlying connector for a typed call. Callers downcast the
    /// guard via `as_any()`.
    pub async fn connector(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Connector>> {
        self.handle.lock().await
    }

    pub fn status(&self) -> ConnectorStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> serde_json::Value {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_status(&self, status: ConnectorStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

impl std::fmt::Debug for ConnectorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorInstance")
            .field("id", &self.id)
            .field("connector_type", &self.connector_type)
            .field("scope_key", &self.scope_key)
            .field("status", &self.status())
            .finish()
    }
}

/// Registry of connector definitions and live instances.
pub struct ConnectorManager {
    definitions: DashMap<String, Arc<ConnectorDefinition>>,
    instances: DashMap<(ScopeKey, String), Arc<ConnectorInstance>>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for ConnectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorManager")
            .field("definitions", &self.definitions.len())
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl ConnectorManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            definitions: DashMap::new(),
            instances: DashMap::new(),
            bus,
        }
    }

    /// Registers a connector type. Built-ins register at startup.
    pub fn register_definition(&self, definition: ConnectorDefinition) {
        info!("🔗 Registered connector type '{}'", definition.connector_type);
        self.definitions
            .insert(definition.connector_type.to_string(), Arc::new(definition));
    }

    pub fn definition(&self, connector_type: &str) -> Option<Arc<ConnectorDefinition>> {
        self.definitions.get(connector_type).map(|d| Arc::clone(&d))
    }

    /// Creates and initializes one instance from a persisted record.
    pub async fn create_instance(
        &self,
        record: &ConnectorConfigRecord,
    ) -> Result<Arc<ConnectorInstance>, ConnectorError> {
        let definition = self
            .definition(&record.connector_type)
            .ok_or_else(|| ConnectorError::UnknownType(record.connector_type.clone()))?;

        let scope_key = record.scope_key();
        if !scope_key.fits(definition.scope) {
            return Err(ConnectorError::ScopeMismatch {
                key: scope_key.to_string(),
                scope: definition.scope,
            });
        }
        let key = (scope_key, record.id.clone());
        if self.instances.contains_key(&key) {
            return Err(ConnectorError::AlreadyExists(record.id.clone()));
        }

        let config = definition.schema.validate_and_fill(&record.config)?;
        let mut connector = (definition.factory)();
        let ctx = ConnectorContext {
            scope_key,
            bus: definition.implements_events.then(|| Arc::clone(&self.bus)),
        };
        connector.initialize(ctx, &config).await?;

        let instance = Arc::new(ConnectorInstance {
            id: record.id.clone(),
            connector_type: record.connector_type.clone(),
            scope_key,
            config: std::sync::Mutex::new(config),
            status: std::sync::Mutex::new(ConnectorStatus::Running),
            handle: Mutex::new(connector),
        });
        self.instances.insert(key, Arc::clone(&instance));
        info!(
            "🔗 Connector '{}' ({}) running at {scope_key}",
            instance.id, instance.connector_type
        );
        Ok(instance)
    }

    /// Looks up an instance by exact scope key and id.
    pub fn get(&self, scope_key: ScopeKey, id: &str) -> Option<Arc<ConnectorInstance>> {
        self.instances
            .get(&(scope_key, id.to_string()))
            .map(|i| Arc::clone(&i))
    }

    /// Resolves an instance for a server: the server's own slot first, the
    /// global slot as fallback. This is the lookup plugins use.
    pub fn resolve(&self, server_id: ServerId, id: &str) -> Option<Arc<ConnectorInstance>> {
        self.get(ScopeKey::Server(server_id), id)
            .or_else(|| self.get(ScopeKey::Global, id))
    }

    /// Applies a config update by restarting the instance in place: the old
    /// connector is shut down, a fresh one is built from the new config, and
    /// the instance id is preserved so existing references remain valid.
    pub async fn update_config(
        &self,
        scope_key: ScopeKey,
        id: &str,
        new_config: &serde_json::Value,
    ) -> Result<(), ConnectorError> {
        let instance = self
            .get(scope_key, id)
            .ok_or_else(|| ConnectorError::InstanceNotFound(id.to_string()))?;
        let definition = self
            .definition(&instance.connector_type)
            .ok_or_else(|| ConnectorError::UnknownType(instance.connector_type.clone()))?;
        let config = definition.schema.validate_and_fill(new_config)?;

        let mut handle = instance.handle.lock().await;
        if let Err(e) = handle.shutdown().await {
            warn!("Connector '{id}' shutdown during reconfigure failed: {e}");
        }
        let mut fresh = (definition.factory)();
        let ctx = ConnectorContext {
            scope_key,
            bus: definition.implements_events.then(|| Arc::clone(&self.bus)),
        };
        match fresh.initialize(ctx, &config).await {
            Ok(()) => {
                *handle = fresh;
                *instance.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
                instance.set_status(ConnectorStatus::Running);
                info!("🔗 Connector '{id}' reconfigured");
                Ok(())
            }
            Err(e) => {
                instance.set_status(ConnectorStatus::Error);
                Err(e)
            }
        }
    }

    /// Shuts down and removes one instance.
    pub async fn remove_instance(&self, scope_key: ScopeKey, id: &str) -> Result<(), ConnectorError> {
        let (_, instance) = self
            .instances
            .remove(&(scope_key, id.to_string()))
            .ok_or_else(|| ConnectorError::InstanceNotFound(id.to_string()))?;
        let mut handle = instance.handle.lock().await;
        instance.set_status(ConnectorStatus::Stopped);
        handle.shutdown().await
    }

    /// Creates every instance from the persisted records. Failures are
    /// logged and do not abort the batch.
    pub async fn boot_from_store(&self, records: &[ConnectorConfigRecord]) -> usize {
        let mut created = 0;
        for record in records {
            match self.create_instance(record).await {
                Ok(_) => created += 1,
                Err(e) => error!(
                    "❌ Connector '{}' ({}) failed to start: {e}",
                    record.id, record.connector_type
                ),
            }
        }
        info!(
            "🔗 Connector bring-up complete: {created}/{} instances running",
            records.len()
        );
        created
    }

    /// Shuts down every instance and clears the registry.
    pub async fn shutdown_all(&self) {
        info!("🛑 Shutting down {} connector instances", self.instances.len());
        let keys: Vec<(ScopeKey, String)> =
            self.instances.iter().map(|e| e.key().clone()).collect();
        for (scope_key, id) in keys {
            if let Err(e) = self.remove_instance(scope_key, &id).await {
                warn!("Connector '{id}' shutdown failed: {e}");
            }
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ConnectorScope;
    use bastion_events::{ConfigSchema, FieldKind};
    use serde_json::json;
    use std::any::Any;

    #[derive(Default)]
    struct EchoConnector {
        greeting: String,
        shutdowns: u32,
    }

    #[async_trait::async_trait]
    impl Connector for EchoConnector {
        async fn initialize(
            &mut self,
            _ctx: ConnectorContext,
            config: &serde_json::Value,
        ) -> Result<(), ConnectorError> {
            self.greeting = config["greeting"].as_str().unwrap_or_default().to_string();
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), ConnectorError> {
            self.shutdowns += 1;
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn echo_definition(scope: ConnectorScope) -> ConnectorDefinition {
        ConnectorDefinition::new(
            "echo",
            scope,
            ConfigSchema::new().optional("greeting", FieldKind::String, json!("hello")),
            || Box::<EchoConnector>::default(),
        )
    }

    fn manager_with(scope: ConnectorScope) -> ConnectorManager {
        let manager = ConnectorManager::new(Arc::new(EventBus::new()));
        manager.register_definition(echo_definition(scope));
        manager
    }

    fn record(id: &str, server_id: Option<ServerId>) -> ConnectorConfigRecord {
        ConnectorConfigRecord {
            id: id.to_string(),
            connector_type: "echo".to_string(),
            server_id,
            config: json!({}),
        }
    }

    #[tokio::test]
    async fn create_and_typed_lookup() {
        let manager = manager_with(ConnectorScope::Global);
        manager.create_instance(&record("chat", None)).await.unwrap();

        let instance = manager.get(ScopeKey::Global, "chat").unwrap();
        assert_eq!(instance.status(), ConnectorStatus::Running);
        let guard = instance.connector().await;
        let echo = guard.as_any().downcast_ref::<EchoConnector>().unwrap();
        assert_eq!(echo.greeting, "hello");
    }

    #[tokio::test]
    async fn per_server_resolution_falls_back_to_global() {
        let manager = ConnectorManager::new(Arc::new(EventBus::new()));
        manager.register_definition(echo_definition(ConnectorScope::Global));
        manager.create_instance(&record("shared", None)).await.unwrap();

        let server = ServerId::new();
        let resolved = manager.resolve(server, "shared").unwrap();
        assert_eq!(resolved.scope_key, ScopeKey::Global);
    }

    #[tokio::test]
    async fn scope_mismatch_is_rejected() {
        let manager = manager_with(ConnectorScope::PerServer);
        let err = manager.create_instance(&record("chat", None)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ScopeMismatch { .. }));
    }

    #[tokio::test]
    async fn duplicate_instance_is_rejected() {
        let manager = manager_with(ConnectorScope::Global);
        manager.create_instance(&record("chat", None)).await.unwrap();
        let err = manager.create_instance(&record("chat", None)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn reconfigure_restarts_in_place_preserving_the_handle() {
        let manager = manager_with(ConnectorScope::Global);
        manager.create_instance(&record("chat", None)).await.unwrap();
        let held = manager.get(ScopeKey::Global, "chat").unwrap();

        manager
            .update_config(ScopeKey::Global, "chat", &json!({"greeting": "howdy"}))
            .await
            .unwrap();

        // The previously-held reference sees the new configuration.
        let guard = held.connector().await;
        let echo = guard.as_any().downcast_ref::<EchoConnector>().unwrap();
        assert_eq!(echo.greeting, "howdy");
        assert_eq!(held.config()["greeting"], "howdy");
    }

    #[tokio::test]
    async fn event_capable_connectors_receive_a_bus_publisher() {
        struct EmittingConnector {
            saw_bus: bool,
        }

        #[async_trait::async_trait]
        impl Connector for EmittingConnector {
            async fn initialize(
                &mut self,
                ctx: ConnectorContext,
                _config: &serde_json::Value,
            ) -> Result<(), ConnectorError> {
                self.saw_bus = ctx.bus.is_some();
                Ok(())
            }
            async fn shutdown(&mut self) -> Result<(), ConnectorError> {
                Ok(())
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let manager = ConnectorManager::new(Arc::new(EventBus::new()));
        manager.register_definition(
            ConnectorDefinition::new("emitter", ConnectorScope::Global, ConfigSchema::new(), || {
                Box::new(EmittingConnector { saw_bus: false })
            })
            .with_events(),
        );
        let mut record = record("bridge", None);
        record.connector_type = "emitter".to_string();
        manager.create_instance(&record).await.unwrap();

        let instance = manager.get(ScopeKey::Global, "bridge").unwrap();
        let guard = instance.connector().await;
        let emitter = guard.as_any().downcast_ref::<EmittingConnector>().unwrap();
        assert!(emitter.saw_bus);
    }

    #[tokio::test]
    async fn invalid_config_never_creates_an_instance() {
        let manager = manager_with(ConnectorScope::Global);
        let mut bad = record("chat", None);
        bad.config = json!({"greeting": 42});
        assert!(manager.create_instance(&bad).await.is_err());
        assert_eq!(manager.instance_count(), 0);
    }
}
