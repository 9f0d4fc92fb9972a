//! Connector traits, scopes and definitions.

use bastion_events::{ConfigSchema, EventBus, SchemaError, ServerId};
use std::any::Any;
use std::sync::Arc;

/// Whether one instance serves all servers or each server gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorScope {
    Global,
    PerServer,
}

/// Instance key: the global singleton slot or one server's slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Global,
    Server(ServerId),
}

impl ScopeKey {
    /// True if this key is legal for a definition's scope.
    pub fn fits(&self, scope: ConnectorScope) -> bool {
        matches!(
            (self, scope),
            (ScopeKey::Global, ConnectorScope::Global)
                | (ScopeKey::Server(_), ConnectorScope::PerServer)
        )
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeKey::Global => write!(f, "global"),
            ScopeKey::Server(id) => write!(f, "server:{id}"),
        }
    }
}

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Stopped,
    Running,
    Error,
}

/// Context handed to a connector at initialize time.
#[derive(Clone)]
pub struct ConnectorContext {
    pub scope_key: ScopeKey,
    /// Present only for definitions that declare `implements_events`.
    pub bus: Option<Arc<EventBus>>,
}

/// Errors from connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Unknown connector type '{0}'")]
    UnknownType(String),

    #[error("Connector instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("Connector instance '{0}' already exists")]
    AlreadyExists(String),

    #[error("Scope key {key} does not fit connector scope {scope:?}")]
    ScopeMismatch { key: String, scope: ConnectorScope },

    #[error("Invalid connector config: {0}")]
    InvalidConfig(#[from] SchemaError),

    #[error("Connector call failed: {0}")]
    CallFailed(String),
}

/// The behavior every connector implements.
///
/// `as_any` is the typed-API seam: callers that hold a
/// [`crate::manager::ConnectorInstance`] downcast to the concrete connector
/// to reach its capability methods.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn initialize(
        &mut self,
        ctx: ConnectorContext,
        config: &serde_json::Value,
    ) -> Result<(), ConnectorError>;

    async fn shutdown(&mut self) -> Result<(), ConnectorError>;

    fn as_any(&self) -> &dyn Any;
}

type ConnectorFactory = Arc<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

/// Static descriptor of one connector type.
#[derive(Clone)]
pub struct ConnectorDefinition {
    pub connector_type: &'static str,
    pub scope: ConnectorScope,
    pub schema: ConfigSchema,
    /// When set, instances receive a bus publisher and may emit events.
    pub implements_events: bool,
    pub factory: ConnectorFactory,
}

impl ConnectorDefinition {
    pub fn new(
        connector_type: &'static str,
        scope: ConnectorScope,
        schema: ConfigSchema,
        factory: impl Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    ) -> Self {
        Self {
            connector_type,
            scope,
            schema,
            implements_events: false,
            factory: Arc::new(factory),
        }
    }

    pub fn with_events(mut self) -> Self {
        self.implements_events = true;
        self
    }
}

impl std::fmt::Debug for ConnectorDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorDefinition")
            .field("connector_type", &self.connector_type)
            .field("scope", &self.scope)
            .field("implements_events", &self.implements_events)
            .finish()
    }
}
