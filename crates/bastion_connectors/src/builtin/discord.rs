//! Discord webhook connector.
//!
//! Posts messages to a Discord channel webhook. Global scope: one webhook
//! serves announcements for the whole panel; per-channel routing belongs in
//! the message content, not in connector topology.

use crate::definition::{
    Connector, ConnectorContext, ConnectorDefinition, ConnectorError, ConnectorScope,
};
use bastion_events::{ConfigSchema, FieldKind};
use serde_json::json;
use std::any::Any;
use std::time::Duration;

/// Connector type name.
pub const CONNECTOR_TYPE: &str = "discord_webhook";

/// The connector definition registered at startup.
pub fn definition() -> ConnectorDefinition {
    ConnectorDefinition::new(
        CONNECTOR_TYPE,
        ConnectorScope::Global,
        ConfigSchema::new()
            .required("webhook_url", FieldKind::String)
            .optional("username", FieldKind::String, json!("Bastion")),
        || Box::<DiscordWebhookConnector>::default(),
    )
}

#[derive(Default)]
pub struct DiscordWebhookConnector {
    webhook_url: String,
    username: String,
    client: Option<reqwest::Client>,
}

impl DiscordWebhookConnector {
    /// Posts one message to the configured webhook.
    pub async fn send_message(&self, content: &str) -> Result<(), ConnectorError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectorError::CallFailed("connector not initialized".into()))?;
        let response = client
            .post(&self.webhook_url)
            .json(&json!({ "content": content, "username": self.username }))
            .send()
            .await
            .map_err(|e| ConnectorError::CallFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConnectorError::CallFailed(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for DiscordWebhookConnector {
    async fn initialize(
        &mut self,
        _ctx: ConnectorContext,
        config: &serde_json::Value,
    ) -> Result<(), ConnectorError> {
        self.webhook_url = config["webhook_url"]
            .as_str()
            .ok_or_else(|| ConnectorError::CallFailed("webhook_url missing after validation".into()))?
            .to_string();
        self.username = config["username"].as_str().unwrap_or("Bastion").to_string();
        self.client = Some(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|e| ConnectorError::CallFailed(e.to_string()))?,
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ConnectorError> {
        self.client = None;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ScopeKey;

    #[tokio::test]
    async fn initialize_requires_webhook_url() {
        let schema_err = definition()
            .schema
            .validate_and_fill(&json!({}))
            .unwrap_err();
        assert!(schema_err.to_string().contains("webhook_url"));
    }

    #[tokio::test]
    async fn send_before_initialize_fails_cleanly() {
        let connector = DiscordWebhookConnector::default();
        let err = connector.send_message("hi").await.unwrap_err();
        assert!(matches!(err, ConnectorError::CallFailed(_)));
    }

    #[tokio::test]
    async fn initialize_reads_validated_config() {
        let mut connector = DiscordWebhookConnector::default();
        let config = definition()
            .schema
            .validate_and_fill(&json!({"webhook_url": "https://example.test/hook"}))
            .unwrap();
        connector
            .initialize(
                ConnectorContext {
                    scope_key: ScopeKey::Global,
                    bus: None,
                },
                &config,
            )
            .await
            .unwrap();
        assert_eq!(connector.username, "Bastion");
        assert!(connector.client.is_some());
    }
}
