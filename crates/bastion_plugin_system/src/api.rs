//! # Capability API Injection
//!
//! The interfaces a plugin instance can call into the host through, and the
//! feature gateway that decides which of them it may obtain.
//!
//! Trait objects keep plugins decoupled from the concrete subsystems: the
//! composition root wires an [`ApiSet`] from the live connection manager,
//! permission service, connector manager and telemetry sink, and tests wire
//! recorders instead (see [`crate::testing`]). Every privileged method on a
//! production implementation runs a permission check with the plugin
//! instance as principal; denials surface as [`ApiError::Permission`],
//! never as silent no-ops.

use crate::definition::Feature;
use crate::error::PluginError;
use crate::sandbox::SandboxHandle;
use bastion_events::{NormalizedEvent, PluginInstanceId, ServerId, ServerRecord};
use bastion_connectors::ConnectorInstance;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by capability API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The permission service rejected the call.
    #[error(transparent)]
    Permission(#[from] bastion_access::AccessError),

    /// The backing subsystem cannot serve the call right now.
    #[error("API unavailable: {0}")]
    Unavailable(String),

    /// The call reached the subsystem and failed there.
    #[error("API call failed: {0}")]
    Call(String),
}

/// Read-only server, player and squad data.
#[async_trait::async_trait]
pub trait ServerInfoApi: Send + Sync {
    async fn server(&self, server_id: ServerId) -> Result<ServerRecord, ApiError>;
    async fn player_names(&self, server_id: ServerId) -> Result<Vec<String>, ApiError>;
}

/// The restricted console operation set offered to plugins and scripts.
#[async_trait::async_trait]
pub trait RconApi: Send + Sync {
    async fn execute(&self, server_id: ServerId, command: &str) -> Result<String, ApiError>;
    async fn broadcast(&self, server_id: ServerId, message: &str) -> Result<(), ApiError>;
    async fn warn(&self, server_id: ServerId, player: &str, message: &str)
        -> Result<(), ApiError>;
    async fn kick(&self, server_id: ServerId, player: &str, reason: &str)
        -> Result<(), ApiError>;
    async fn ban(
        &self,
        server_id: ServerId,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<(), ApiError>;
    async fn chat_message(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<(), ApiError>;
}

/// Keyed plugin storage, namespaced per instance.
#[async_trait::async_trait]
pub trait PluginStoreApi: Send + Sync {
    async fn get(
        &self,
        instance_id: PluginInstanceId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ApiError>;
    async fn set(
        &self,
        instance_id: PluginInstanceId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), ApiError>;
    async fn delete(&self, instance_id: PluginInstanceId, key: &str) -> Result<(), ApiError>;
}

/// Admin roster queries.
#[async_trait::async_trait]
pub trait AdminApi: Send + Sync {
    async fn is_admin(&self, server_id: ServerId, platform_id: &str) -> Result<bool, ApiError>;
}

/// Publish back onto the event bus as `source = "plugin"`.
pub trait EventApi: Send + Sync {
    fn publish(&self, event: NormalizedEvent) -> Result<(), ApiError>;
}

/// Acquire a connector instance by id (per-server slot, global fallback).
pub trait ConnectorApi: Send + Sync {
    fn acquire(
        &self,
        server_id: ServerId,
        connector_id: &str,
    ) -> Result<Arc<ConnectorInstance>, ApiError>;
}

impl std::fmt::Debug for dyn RconApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn RconApi")
    }
}

impl std::fmt::Debug for dyn ConnectorApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn ConnectorApi")
    }
}

/// Structured plugin logging, persisted through the telemetry sink.
#[async_trait::async_trait]
pub trait PluginLogApi: Send + Sync {
    async fn log(
        &self,
        instance_id: PluginInstanceId,
        server_id: ServerId,
        level: &str,
        message: &str,
        error: Option<String>,
        fields: serde_json::Value,
    ) -> Result<(), ApiError>;
}

/// The full API wiring, built once at the composition root.
#[derive(Clone)]
pub struct ApiSet {
    pub server_info: Arc<dyn ServerInfoApi>,
    pub rcon: Arc<dyn RconApi>,
    pub store: Arc<dyn PluginStoreApi>,
    pub admin: Arc<dyn AdminApi>,
    pub events: Arc<dyn EventApi>,
    pub connectors: Arc<dyn ConnectorApi>,
    pub log: Arc<dyn PluginLogApi>,
}

/// The per-instance capability bundle handed to `Plugin::initialize`.
///
/// Accessors enforce the feature gateway: an API group the definition never
/// declared returns [`PluginError::FeatureNotDeclared`] instead of the
/// handle. The bundle also carries the instance identity the production API
/// implementations use as the permission principal, and the sandbox handle
/// for background work.
#[derive(Clone)]
pub struct PluginApis {
    instance_id: PluginInstanceId,
    server_id: ServerId,
    features: HashSet<Feature>,
    set: ApiSet,
    sandbox: Arc<SandboxHandle>,
    cancel: CancellationToken,
}

impl PluginApis {
    pub fn new(
        instance_id: PluginInstanceId,
        server_id: ServerId,
        features: HashSet<Feature>,
        set: ApiSet,
        sandbox: Arc<SandboxHandle>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            server_id,
            features,
            set,
            sandbox,
            cancel,
        }
    }

    pub fn instance_id(&self) -> PluginInstanceId {
        self.instance_id
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    fn gate(&self, feature: Feature) -> Result<(), PluginError> {
        if self.features.contains(&feature) {
            Ok(())
        } else {
            Err(PluginError::FeatureNotDeclared(feature))
        }
    }

    pub fn server_info(&self) -> Result<Arc<dyn ServerInfoApi>, PluginError> {
        self.gate(Feature::ServerInfo)?;
        Ok(Arc::clone(&self.set.server_info))
    }

    pub fn rcon(&self) -> Result<Arc<dyn RconApi>, PluginError> {
        self.gate(Feature::Rcon)?;
        Ok(Arc::clone(&self.set.rcon))
    }

    pub fn store(&self) -> Result<Arc<dyn PluginStoreApi>, PluginError> {
        self.gate(Feature::Storage)?;
        Ok(Arc::clone(&self.set.store))
    }

    pub fn admin(&self) -> Result<Arc<dyn AdminApi>, PluginError> {
        self.gate(Feature::Admin)?;
        Ok(Arc::clone(&self.set.admin))
    }

    pub fn events(&self) -> Result<Arc<dyn EventApi>, PluginError> {
        self.gate(Feature::Events)?;
        Ok(Arc::clone(&self.set.events))
    }

    pub fn connectors(&self) -> Result<Arc<dyn ConnectorApi>, PluginError> {
        self.gate(Feature::Connectors)?;
        Ok(Arc::clone(&self.set.connectors))
    }

    pub fn log(&self) -> Result<Arc<dyn PluginLogApi>, PluginError> {
        self.gate(Feature::Log)?;
        Ok(Arc::clone(&self.set.log))
    }

    /// Spawns background work owned by this instance: tracked by the sandbox
    /// monitor and cancelled with the instance context.
    pub fn spawn_background<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.sandbox.spawn(self.cancel.clone(), future);
    }

    /// The instance's cancellation token, for plugins that select on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxHandle;
    use crate::testing::recording_api_set;

    #[test]
    fn undeclared_feature_is_refused() {
        let (set, _recorder) = recording_api_set();
        let apis = PluginApis::new(
            PluginInstanceId::new(),
            ServerId::new(),
            [Feature::Log].into_iter().collect(),
            set,
            Arc::new(SandboxHandle::new()),
            CancellationToken::new(),
        );
        assert!(apis.log().is_ok());
        let err = apis.rcon().unwrap_err();
        assert!(matches!(err, PluginError::FeatureNotDeclared(Feature::Rcon)));
        assert!(matches!(
            apis.connectors().unwrap_err(),
            PluginError::FeatureNotDeclared(Feature::Connectors)
        ));
    }

    #[tokio::test]
    async fn spawn_background_is_tracked_and_cancellable() {
        let (set, _recorder) = recording_api_set();
        let sandbox = Arc::new(SandboxHandle::new());
        let cancel = CancellationToken::new();
        let apis = PluginApis::new(
            PluginInstanceId::new(),
            ServerId::new(),
            HashSet::new(),
            set,
            Arc::clone(&sandbox),
            cancel.clone(),
        );

        apis.spawn_background(async {
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        assert_eq!(sandbox.task_count(), 1);

        cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sandbox.task_count(), 0);
    }
}
