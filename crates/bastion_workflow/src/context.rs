//! Per-execution runtime state.

use crate::interpolate::InterpolationContext;
use bastion_events::{ExecutionId, NormalizedEvent, ServerId, WorkflowId};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// The transient state of one workflow run.
///
/// Lives only for the duration of the run; a durable summary is persisted
/// through the telemetry sink when it ends. Variables are mutable and
/// private to this execution; step results are append-only, keyed by step
/// id.
#[derive(Debug)]
pub struct WorkflowExecution {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub server_id: ServerId,
    pub trigger_event_type: String,
    pub trigger_event: Value,
    pub metadata: Value,
    pub variables: Map<String, Value>,
    pub step_results: Map<String, Value>,
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

impl WorkflowExecution {
    /// Builds a fresh execution for a matched trigger: defaults deep-copied,
    /// trigger-provided variables overlaid, empty step results, started now
    /// (UTC, as all engine timestamps are).
    pub fn begin(
        workflow_id: WorkflowId,
        workflow_name: &str,
        event: &NormalizedEvent,
        defaults: &Map<String, Value>,
        trigger_overrides: &Map<String, Value>,
    ) -> Self {
        let mut variables = defaults.clone();
        for (key, value) in trigger_overrides {
            variables.insert(key.clone(), value.clone());
        }
        let metadata = serde_json::json!({
            "workflow_name": workflow_name,
            "event_id": event.id,
            "event_source": event.source.as_str(),
        });
        Self {
            execution_id: ExecutionId::new(),
            workflow_id,
            server_id: event.server_id,
            trigger_event_type: event.qualified_type(),
            trigger_event: event.data.clone(),
            metadata,
            variables,
            step_results: Map::new(),
            current_step: None,
            started_at: Utc::now(),
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Snapshot views for interpolation. The returned context borrows the
    /// passed-in owned trees because interpolation wants `&Value` roots.
    pub fn interpolation_trees(&self) -> (Value, Value) {
        (
            Value::Object(self.variables.clone()),
            Value::Object(self.step_results.clone()),
        )
    }

    /// Builds the interpolation context over prepared trees.
    pub fn interpolation<'a>(
        &'a self,
        variables: &'a Value,
        step_results: &'a Value,
    ) -> InterpolationContext<'a> {
        InterpolationContext {
            trigger_event: &self.trigger_event,
            variables,
            step_results,
            metadata: &self.metadata,
        }
    }

    /// The combined tree condition steps evaluate against: root keys for
    /// each context tree, with the trigger payload's own fields also
    /// reachable bare for trigger-style conditions.
    pub fn condition_tree(&self) -> Value {
        let mut root = Map::new();
        if let Value::Object(fields) = &self.trigger_event {
            for (key, value) in fields {
                root.insert(key.clone(), value.clone());
            }
        }
        root.insert("trigger_event".to_string(), self.trigger_event.clone());
        root.insert(
            "variables".to_string(),
            Value::Object(self.variables.clone()),
        );
        root.insert(
            "step_results".to_string(),
            Value::Object(self.step_results.clone()),
        );
        root.insert("metadata".to_string(), self.metadata.clone());
        Value::Object(root)
    }

    /// Snapshot for one parallel branch: same identity and trees as they
    /// stand now, zeroed counters so branch accounting merges cleanly.
    pub fn branch_snapshot(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            server_id: self.server_id,
            trigger_event_type: self.trigger_event_type.clone(),
            trigger_event: self.trigger_event.clone(),
            metadata: self.metadata.clone(),
            variables: self.variables.clone(),
            step_results: self.step_results.clone(),
            current_step: self.current_step.clone(),
            started_at: self.started_at,
            completed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
        }
    }

    pub fn record_result(&mut self, step_id: &str, result: Value) {
        self.step_results.insert(step_id.to_string(), result);
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_events::{EventSource, EventType};
    use serde_json::json;

    fn event() -> NormalizedEvent {
        NormalizedEvent::from_value(
            ServerId::new(),
            EventSource::Rcon,
            EventType::ChatMessage,
            json!({"player_name": "Alice", "message": "!help"}),
            None,
        )
    }

    #[test]
    fn begin_overlays_trigger_variables_on_defaults() {
        let mut defaults = Map::new();
        defaults.insert("a".to_string(), json!(1));
        defaults.insert("b".to_string(), json!(2));
        let mut overrides = Map::new();
        overrides.insert("b".to_string(), json!(20));

        let execution = WorkflowExecution::begin(
            WorkflowId::new(),
            "test",
            &event(),
            &defaults,
            &overrides,
        );
        assert_eq!(execution.variables["a"], json!(1));
        assert_eq!(execution.variables["b"], json!(20));
        assert_eq!(execution.trigger_event_type, "RCON_CHAT_MESSAGE");
        assert!(execution.step_results.is_empty());
    }

    #[test]
    fn condition_tree_exposes_payload_fields_bare_and_namespaced() {
        let execution = WorkflowExecution::begin(
            WorkflowId::new(),
            "test",
            &event(),
            &Map::new(),
            &Map::new(),
        );
        let tree = execution.condition_tree();
        assert_eq!(tree["message"], "!help");
        assert_eq!(tree["trigger_event"]["message"], "!help");
        assert_eq!(tree["metadata"]["workflow_name"], "test");
    }
}
