//! Configuration management for the Bastion control panel.
//!
//! This module handles loading, validation, and defaulting of the panel
//! configuration from a TOML file and command-line arguments.

use bastion_events::{ServerId, ServerRecord};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Managed game servers.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Data and telemetry directories.
    #[serde(default)]
    pub data: DataSettings,
    /// Tunable limits; the defaults match the documented knobs.
    #[serde(default)]
    pub limits: LimitSettings,
}

/// One managed server as configured, including its log-watcher agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub game_port: u16,
    pub rcon_port: u16,
    pub rcon_password: String,
    /// `host:port` of the log-watcher agent tailing this server's log.
    pub logwatch_endpoint: String,
    /// Bearer token presented to the agent.
    pub logwatch_token: String,
}

impl ServerEntry {
    pub fn to_record(&self) -> ServerRecord {
        ServerRecord {
            id: self.id,
            name: self.name.clone(),
            host: self.host.clone(),
            game_port: self.game_port,
            rcon_port: self.rcon_port,
            rcon_password: self.rcon_password.clone(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error).
    pub level: String,
    /// Whether to output logs in JSON format.
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Directory layout for persisted state and telemetry output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Persisted panel state (connectors, workflows, plugins, roles, keys).
    pub data_dir: String,
    /// Append-only telemetry output.
    pub telemetry_dir: String,
    /// Dynamic plugin libraries and their signatures.
    pub plugin_dir: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            telemetry_dir: "telemetry".to_string(),
            plugin_dir: "plugins".to_string(),
        }
    }
}

fn default_subscription_buffer() -> usize {
    100
}
fn default_permission_cache_ttl() -> u64 {
    300
}
fn default_identity_refresh() -> u64 {
    3600
}
fn default_stats_interval() -> u64 {
    60
}

/// Tunable limits, defaulted to the documented knob values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Default event-bus subscription buffer.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
    /// Permission cache TTL in seconds.
    #[serde(default = "default_permission_cache_ttl")]
    pub permission_cache_ttl_secs: u64,
    /// Period of the identity-resolver refresh job in seconds.
    #[serde(default = "default_identity_refresh")]
    pub identity_refresh_secs: u64,
    /// Period of the health/statistics report in seconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            subscription_buffer: default_subscription_buffer(),
            permission_cache_ttl_secs: default_permission_cache_ttl(),
            identity_refresh_secs: default_identity_refresh(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, writing a default file first if
    /// none exists.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            let default = Self::default();
            let rendered = toml::to_string_pretty(&default)?;
            tokio::fs::write(path, rendered).await?;
            info!("📝 Wrote default configuration to {}", path.display());
            return Ok(default);
        }
        let text = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&text)?;
        Ok(config)
    }

    /// Validates the merged configuration.
    pub fn validate(&self) -> Result<(), String> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!("invalid log level '{}'", self.logging.level));
        }
        if self.limits.subscription_buffer == 0 {
            return Err("subscription_buffer must be at least 1".to_string());
        }
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(format!("server '{}' has an empty host", server.name));
            }
            if server.rcon_port == 0 {
                return Err(format!("server '{}' has rcon_port 0", server.name));
            }
            if server.logwatch_endpoint.is_empty() {
                return Err(format!(
                    "server '{}' has no log-watcher endpoint",
                    server.name
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id) {
                return Err(format!("duplicate server id {}", server.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str) -> ServerEntry {
        ServerEntry {
            id: ServerId::new(),
            name: name.to_string(),
            host: "10.0.0.5".to_string(),
            game_port: 7787,
            rcon_port: 21114,
            rcon_password: "pw".to_string(),
            logwatch_endpoint: "10.0.0.5:31337".to_string(),
            logwatch_token: "token".to_string(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_log_level_fails_validation() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_server_ids_fail_validation() {
        let mut config = AppConfig::default();
        let entry = server("one");
        let mut duplicate = server("two");
        duplicate.id = entry.id;
        config.servers = vec![entry, duplicate];
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.servers.push(server("round trip"));
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        assert_eq!(parsed.servers[0].name, "round trip");
        assert_eq!(parsed.limits.subscription_buffer, 100);
    }

    #[tokio::test]
    async fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert!(path.exists());
        assert!(config.servers.is_empty());
    }
}
