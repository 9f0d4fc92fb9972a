//! The action seam between the engine and the outside world.
//!
//! Every `action` step and every script host call that touches a server
//! goes through [`ActionDispatcher`]. The composition root implements it
//! over the live console manager, HTTP client, connectors and permission
//! service; tests install a [`RecordingDispatcher`] and assert on the exact
//! commands a workflow produced.

use crate::error::WorkflowError;
use bastion_events::ServerId;
use serde_json::Value;
use std::sync::Mutex;

/// Side effects a workflow may perform.
#[async_trait::async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn rcon_command(
        &self,
        server_id: ServerId,
        command: &str,
    ) -> Result<Value, WorkflowError>;

    async fn admin_broadcast(
        &self,
        server_id: ServerId,
        message: &str,
    ) -> Result<Value, WorkflowError>;

    async fn chat_message(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<Value, WorkflowError>;

    async fn kick_player(
        &self,
        server_id: ServerId,
        player: &str,
        reason: &str,
    ) -> Result<Value, WorkflowError>;

    async fn ban_player(
        &self,
        server_id: ServerId,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<Value, WorkflowError>;

    async fn warn_player(
        &self,
        server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<Value, WorkflowError>;

    async fn http_request(
        &self,
        method: &str,
        url: &str,
        headers: &Value,
        body: Option<String>,
    ) -> Result<Value, WorkflowError>;

    async fn webhook(&self, url: &str, payload: &Value) -> Result<Value, WorkflowError>;

    async fn discord_message(
        &self,
        server_id: ServerId,
        content: &str,
    ) -> Result<Value, WorkflowError>;

    async fn log_message(&self, level: &str, message: &str) -> Result<Value, WorkflowError>;
}

/// Records every dispatched action. The test double for engine tests.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub calls: Mutex<Vec<String>>,
    /// Commands that should fail, by exact text match.
    pub failing: Mutex<Vec<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn fail_on(&self, call: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.to_string());
    }

    fn record(&self, call: String) -> Result<Value, WorkflowError> {
        let should_fail = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|f| call.contains(f.as_str()));
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.clone());
        if should_fail {
            return Err(WorkflowError::ActionFailed(format!("forced failure: {call}")));
        }
        Ok(serde_json::json!({ "call": call }))
    }
}

#[async_trait::async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn rcon_command(
        &self,
        _server_id: ServerId,
        command: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(command.to_string())
    }

    async fn admin_broadcast(
        &self,
        _server_id: ServerId,
        message: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("AdminBroadcast {message}"))
    }

    async fn chat_message(
        &self,
        _server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("ChatMessage {player}: {message}"))
    }

    async fn kick_player(
        &self,
        _server_id: ServerId,
        player: &str,
        reason: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("AdminKick \"{player}\" {reason}"))
    }

    async fn ban_player(
        &self,
        _server_id: ServerId,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("AdminBan \"{player}\" {interval} {reason}"))
    }

    async fn warn_player(
        &self,
        _server_id: ServerId,
        player: &str,
        message: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("AdminWarn \"{player}\" {message}"))
    }

    async fn http_request(
        &self,
        method: &str,
        url: &str,
        _headers: &Value,
        _body: Option<String>,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("HTTP {method} {url}"))
    }

    async fn webhook(&self, url: &str, payload: &Value) -> Result<Value, WorkflowError> {
        self.record(format!("Webhook {url} {payload}"))
    }

    async fn discord_message(
        &self,
        _server_id: ServerId,
        content: &str,
    ) -> Result<Value, WorkflowError> {
        self.record(format!("Discord {content}"))
    }

    async fn log_message(&self, level: &str, message: &str) -> Result<Value, WorkflowError> {
        self.record(format!("Log [{level}] {message}"))
    }
}
