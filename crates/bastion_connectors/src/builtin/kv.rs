//! Shared key/value store connector.
//!
//! Per-server scope. Workflow executions are isolated by design (variables
//! are per-execution); scripts and plugins that need cross-execution state —
//! counters, cooldowns, per-player flags — coordinate through this store.

use crate::definition::{
    Connector, ConnectorContext, ConnectorDefinition, ConnectorError, ConnectorScope,
};
use bastion_events::ConfigSchema;
use dashmap::DashMap;
use serde_json::Value;
use std::any::Any;

/// Connector type name.
pub const CONNECTOR_TYPE: &str = "kv_store";

/// The connector definition registered at startup.
pub fn definition() -> ConnectorDefinition {
    ConnectorDefinition::new(
        CONNECTOR_TYPE,
        ConnectorScope::PerServer,
        ConfigSchema::new(),
        || Box::<KvStoreConnector>::default(),
    )
}

#[derive(Default)]
pub struct KvStoreConnector {
    entries: DashMap<String, Value>,
}

impl KvStoreConnector {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Adds `delta` to an integer key (missing or non-integer counts as 0)
    /// and returns the new value.
    pub fn increment(&self, key: &str, delta: i64) -> i64 {
        let mut entry = self.entries.entry(key.to_string()).or_insert(Value::from(0));
        let next = entry.as_i64().unwrap_or(0) + delta;
        *entry = Value::from(next);
        next
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl Connector for KvStoreConnector {
    async fn initialize(
        &mut self,
        _ctx: ConnectorContext,
        _config: &serde_json::Value,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ConnectorError> {
        self.entries.clear();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_delete_round_trip() {
        let store = KvStoreConnector::default();
        store.set("player:alice:warnings", json!(2));
        assert_eq!(store.get("player:alice:warnings"), Some(json!(2)));
        assert!(store.delete("player:alice:warnings"));
        assert!(store.get("player:alice:warnings").is_none());
        assert!(!store.delete("player:alice:warnings"));
    }

    #[test]
    fn increment_starts_at_zero_and_accumulates() {
        let store = KvStoreConnector::default();
        assert_eq!(store.increment("counter", 1), 1);
        assert_eq!(store.increment("counter", 2), 3);
        store.set("weird", json!("text"));
        // Non-integer values reset to zero before the delta applies.
        assert_eq!(store.increment("weird", 5), 5);
    }
}
