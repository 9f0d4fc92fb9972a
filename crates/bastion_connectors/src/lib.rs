//! # Bastion Connectors
//!
//! Connectors mirror plugins but face the other way: instead of reacting to
//! events they expose capability APIs — a chat-bridge webhook, a shared
//! key/value store — that plugins and workflow steps call into.
//!
//! Two scopes exist: **global** (one instance shared by all servers) and
//! **per-server** (one instance per server id). Instances are created from
//! persisted configs at boot; updating a config restarts the instance
//! (`shutdown` then a fresh `initialize`) while preserving its id so held
//! references stay valid.
//!
//! A connector whose definition sets `implements_events` receives a bus
//! publisher at initialize time and may emit events like any other producer.

pub mod builtin;
pub mod definition;
pub mod manager;

pub use builtin::{register_builtin_connectors, DiscordWebhookConnector, KvStoreConnector};
pub use definition::{
    Connector, ConnectorContext, ConnectorDefinition, ConnectorError, ConnectorScope,
    ConnectorStatus, ScopeKey,
};
pub use manager::{ConnectorConfigRecord, ConnectorInstance, ConnectorManager};
