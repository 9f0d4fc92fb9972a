//! Persisted panel state consumed at boot.
//!
//! One JSON file per collection under the data directory. A missing file is
//! an empty collection, never an error, so a fresh install boots clean.

use bastion_access::Role;
use bastion_connectors::ConnectorConfigRecord;
use bastion_events::ServerId;
use bastion_workflow::WorkflowRecord;
use ed25519_dalek::VerifyingKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A role granted to a principal on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub principal: String,
    pub server_id: ServerId,
    pub role_id: String,
}

/// One persisted plugin instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstanceConfig {
    pub plugin_id: String,
    pub server_id: ServerId,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// File-backed store of panel state.
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    async fn load_collection<T: DeserializeOwned>(&self, file_name: &str) -> Vec<T> {
        let path = self.dir.join(file_name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed reading {}: {e}; treating as empty", path.display());
                return Vec::new();
            }
        };
        match serde_json::from_str(&text) {
            Ok(items) => items,
            Err(e) => {
                warn!("Failed parsing {}: {e}; treating as empty", path.display());
                Vec::new()
            }
        }
    }

    pub async fn load_connectors(&self) -> Vec<ConnectorConfigRecord> {
        self.load_collection("connectors.json").await
    }

    pub async fn load_workflows(&self) -> Vec<WorkflowRecord> {
        self.load_collection("workflows.json").await
    }

    pub async fn load_plugin_configs(&self) -> Vec<PluginInstanceConfig> {
        self.load_collection("plugins.json").await
    }

    pub async fn load_roles(&self) -> Vec<Role> {
        self.load_collection("roles.json").await
    }

    pub async fn load_role_assignments(&self) -> Vec<RoleAssignment> {
        self.load_collection("role_assignments.json").await
    }

    /// Trusted plugin-signer public keys, stored hex-encoded. Malformed
    /// entries are skipped with a warning rather than aborting boot.
    pub async fn load_trusted_keys(&self) -> Vec<VerifyingKey> {
        let entries: Vec<String> = self.load_collection("trusted_keys.json").await;
        entries
            .iter()
            .filter_map(|entry| {
                let bytes = hex::decode(entry)
                    .map_err(|e| warn!("Skipping malformed trusted key: {e}"))
                    .ok()?;
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| warn!("Skipping trusted key with wrong length"))
                    .ok()?;
                VerifyingKey::from_bytes(&array)
                    .map_err(|e| warn!("Skipping invalid trusted key: {e}"))
                    .ok()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.load_connectors().await.is_empty());
        assert!(store.load_workflows().await.is_empty());
        assert!(store.load_roles().await.is_empty());
        assert!(store.load_trusted_keys().await.is_empty());
    }

    #[tokio::test]
    async fn collections_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let assignments = vec![RoleAssignment {
            principal: "alice".to_string(),
            server_id: ServerId::new(),
            role_id: "admin".to_string(),
        }];
        tokio::fs::write(
            dir.path().join("role_assignments.json"),
            serde_json::to_vec(&assignments).unwrap(),
        )
        .await
        .unwrap();

        let store = Store::new(dir.path());
        let loaded = store.load_role_assignments().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].principal, "alice");
    }

    #[tokio::test]
    async fn malformed_trusted_keys_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let signing = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let good = hex::encode(signing.verifying_key().to_bytes());
        tokio::fs::write(
            dir.path().join("trusted_keys.json"),
            serde_json::to_vec(&vec![good, "zz-not-hex".to_string(), "abcd".to_string()]).unwrap(),
        )
        .await
        .unwrap();

        let store = Store::new(dir.path());
        assert_eq!(store.load_trusted_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_json_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("connectors.json"), b"{{not json")
            .await
            .unwrap();
        let store = Store::new(dir.path());
        assert!(store.load_connectors().await.is_empty());
    }
}
