//! Append-only telemetry persistence.

use bastion_events::{ExecutionId, NormalizedEvent, ServerId, WorkflowId};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::identity::{CanonicalIdentity, IdentityLookupRow};

/// Errors from telemetry writes.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Record Shapes
// ============================================================================

/// One structured log record per executed workflow step.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowStepLog {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub server_id: ServerId,
    pub event_time: DateTime<Utc>,
    pub trigger_event_type: String,
    pub trigger_event_data: serde_json::Value,
    /// Execution-level status at the time the step finished.
    pub status: String,
    pub step_name: String,
    pub step_type: String,
    pub step_order: usize,
    pub step_status: String,
    pub step_input: serde_json::Value,
    pub step_output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_error: Option<String>,
    pub step_duration_ms: u64,
    pub variables_snapshot: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Summary record written once per completed workflow execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowSummaryLog {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub server_id: ServerId,
    pub trigger_event_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A log line emitted by a plugin instance through its log API.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PluginLogRecord {
    pub timestamp: DateTime<Utc>,
    pub server_id: ServerId,
    pub plugin_instance_id: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub fields: serde_json::Value,
}

// ============================================================================
// Sink Traits
// ============================================================================

/// Append-only writer for structured telemetry.
///
/// Writes are synchronous from the caller's perspective and surface their
/// errors: this is the path for data that must not be silently dropped.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn write_event(&self, event: &NormalizedEvent) -> Result<(), TelemetryError>;
    async fn write_workflow_step(&self, record: &WorkflowStepLog) -> Result<(), TelemetryError>;
    async fn write_workflow_summary(
        &self,
        record: &WorkflowSummaryLog,
    ) -> Result<(), TelemetryError>;
    async fn write_plugin_log(&self, record: &PluginLogRecord) -> Result<(), TelemetryError>;
}

/// Batch writer for the identity resolver's full-refresh output.
#[async_trait::async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Clears both identity tables ahead of a full refresh.
    async fn clear_identities(&self) -> Result<(), TelemetryError>;
    /// Appends one batch of canonical identities.
    async fn insert_identities(&self, batch: &[CanonicalIdentity]) -> Result<(), TelemetryError>;
    /// Appends one batch of identifier → canonical-id lookup rows.
    async fn insert_identity_lookup(
        &self,
        batch: &[IdentityLookupRow],
    ) -> Result<(), TelemetryError>;
}

// ============================================================================
// JSONL Implementation
// ============================================================================

/// File-backed sink: one JSONL file per record family, with events
/// partitioned into monthly files (`events-YYYY-MM.jsonl`).
pub struct JsonlSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, tokio::fs::File>>,
}

impl JsonlSink {
    /// Creates the sink, ensuring the directory exists.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    async fn append<T: serde::Serialize>(
        &self,
        file_name: &str,
        record: &T,
    ) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut files = self.files.lock().await;
        if !files.contains_key(file_name) {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(file_name))
                .await?;
            files.insert(file_name.to_string(), file);
        }
        let file = files
            .get_mut(file_name)
            .ok_or_else(|| std::io::Error::other("sink file vanished from the handle table"))?;
        file.write_all(&line).await?;
        Ok(())
    }

    fn event_partition(timestamp: &DateTime<Utc>) -> String {
        format!("events-{:04}-{:02}.jsonl", timestamp.year(), timestamp.month())
    }
}

#[async_trait::async_trait]
impl TelemetrySink for JsonlSink {
    async fn write_event(&self, event: &NormalizedEvent) -> Result<(), TelemetryError> {
        self.append(&Self::event_partition(&event.timestamp), event)
            .await
    }

    async fn write_workflow_step(&self, record: &WorkflowStepLog) -> Result<(), TelemetryError> {
        self.append("workflow_steps.jsonl", record).await
    }

    async fn write_workflow_summary(
        &self,
        record: &WorkflowSummaryLog,
    ) -> Result<(), TelemetryError> {
        self.append("workflow_summaries.jsonl", record).await
    }

    async fn write_plugin_log(&self, record: &PluginLogRecord) -> Result<(), TelemetryError> {
        self.append("plugin_logs.jsonl", record).await
    }
}

/// File-backed analytics store for the identity tables. `clear` truncates;
/// inserts append, so a refresh is clear-then-batches.
pub struct JsonlAnalyticsStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAnalyticsStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    async fn append_lines<T: serde::Serialize>(
        &self,
        file_name: &str,
        batch: &[T],
    ) -> Result<(), TelemetryError> {
        let mut buf = Vec::new();
        for row in batch {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file_name))
            .await?;
        file.write_all(&buf).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AnalyticsStore for JsonlAnalyticsStore {
    async fn clear_identities(&self) -> Result<(), TelemetryError> {
        let _guard = self.write_lock.lock().await;
        for file_name in ["identities.jsonl", "identity_lookup.jsonl"] {
            tokio::fs::write(self.dir.join(file_name), b"").await?;
        }
        Ok(())
    }

    async fn insert_identities(&self, batch: &[CanonicalIdentity]) -> Result<(), TelemetryError> {
        let _guard = self.write_lock.lock().await;
        self.append_lines("identities.jsonl", batch).await
    }

    async fn insert_identity_lookup(
        &self,
        batch: &[IdentityLookupRow],
    ) -> Result<(), TelemetryError> {
        let _guard = self.write_lock.lock().await;
        self.append_lines("identity_lookup.jsonl", batch).await
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Collects every record in memory. Used by engine and manager tests to
/// assert on telemetry without touching the filesystem.
#[derive(Default)]
pub struct MemorySink {
    pub events: std::sync::Mutex<Vec<NormalizedEvent>>,
    pub steps: std::sync::Mutex<Vec<WorkflowStepLog>>,
    pub summaries: std::sync::Mutex<Vec<WorkflowSummaryLog>>,
    pub plugin_logs: std::sync::Mutex<Vec<PluginLogRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl TelemetrySink for MemorySink {
    async fn write_event(&self, event: &NormalizedEvent) -> Result<(), TelemetryError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    async fn write_workflow_step(&self, record: &WorkflowStepLog) -> Result<(), TelemetryError> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn write_workflow_summary(
        &self,
        record: &WorkflowSummaryLog,
    ) -> Result<(), TelemetryError> {
        self.summaries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn write_plugin_log(&self, record: &PluginLogRecord) -> Result<(), TelemetryError> {
        self.plugin_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_events::{EventSource, EventType};
    use chrono::TimeZone;

    #[test]
    fn event_partition_is_monthly() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(JsonlSink::event_partition(&ts), "events-2025-03.jsonl");
    }

    #[tokio::test]
    async fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlSink::open(dir.path()).await.unwrap();

        let event = NormalizedEvent::from_value(
            ServerId::new(),
            EventSource::Log,
            EventType::NewGame,
            serde_json::json!({"map_name": "Narva", "layer_name": "Narva_AAS_v1"}),
            None,
        );
        sink.write_event(&event).await.unwrap();
        sink.write_event(&event).await.unwrap();

        let partition = JsonlSink::event_partition(&event.timestamp);
        let contents = tokio::fs::read_to_string(dir.path().join(partition))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: NormalizedEvent = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.event_type, EventType::NewGame);
    }

    #[tokio::test]
    async fn analytics_store_refresh_truncates_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAnalyticsStore::open(dir.path()).await.unwrap();

        let identity = CanonicalIdentity {
            canonical_id: "abc".into(),
            primary_name: "Alice".into(),
            all_steam_ids: vec!["s1".into()],
            all_eos_ids: vec!["e1".into()],
            all_names: vec!["Alice".into()],
            total_sessions: 4,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        };
        store.clear_identities().await.unwrap();
        store.insert_identities(&[identity.clone()]).await.unwrap();
        store.clear_identities().await.unwrap();
        store.insert_identities(&[identity]).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("identities.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
