//! Built-in connector types registered at startup.

mod discord;
mod kv;

pub use discord::DiscordWebhookConnector;
pub use kv::KvStoreConnector;

use crate::manager::ConnectorManager;

/// Registers every built-in connector definition.
pub fn register_builtin_connectors(manager: &ConnectorManager) {
    manager.register_definition(discord::definition());
    manager.register_definition(kv::definition());
}
