//! The serde model of workflow definitions and their structural validation.

use crate::error::WorkflowError;
use bastion_events::{ServerId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A stored workflow bound to one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub server_id: ServerId,
    pub name: String,
    pub enabled: bool,
    pub definition: WorkflowDefinition,
}

/// The versioned trigger→step program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_version")]
    pub version: u32,
    pub triggers: Vec<Trigger>,
    /// Deep-copied into each execution as its starting variables.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub steps: Vec<Step>,
    /// Applied when a failing step declares no `on_error` of its own.
    #[serde(default)]
    pub default_action: ErrorAction,
    /// Steps run after a terminal stop, before the summary is written.
    #[serde(default)]
    pub on_failure: Vec<Step>,
}

fn default_version() -> u32 {
    1
}

/// One trigger: the qualified event type plus all-AND conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Qualified event name, e.g. `RCON_CHAT_MESSAGE` or `LOG_PLAYER_DIED`.
    pub event_type: String,
    #[serde(default)]
    pub conditions: Vec<crate::condition::Condition>,
    /// Extra variables overlaid onto the defaults when this trigger fires.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Condition,
    Action,
    Variable,
    Delay,
    Loop,
    Parallel,
    Script,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Condition => "condition",
            StepType::Action => "action",
            StepType::Variable => "variable",
            StepType::Delay => "delay",
            StepType::Loop => "loop",
            StepType::Parallel => "parallel",
            StepType::Script => "script",
        }
    }
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Continue,
    #[default]
    Stop,
    Retry,
    Goto,
}

/// Per-step error policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnErrorPolicy {
    pub action: ErrorAction,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto_step: Option<String>,
}

/// One step in the program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow; step results key off it.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnErrorPolicy>,
}

impl Step {
    /// Display name: the explicit name or the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl WorkflowDefinition {
    /// Structural validation run at create/update time.
    ///
    /// - every step id (including ids nested in loops and parallel
    ///   branches) is unique;
    /// - every `goto_step` and every `next_steps` entry names an existing
    ///   top-level step;
    /// - at least one trigger exists.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.triggers.is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "a workflow needs at least one trigger".to_string(),
            ));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut all_steps: Vec<Step> = flatten_steps(&self.steps);
        all_steps.extend(flatten_steps(&self.on_failure));
        for step in &all_steps {
            if !seen.insert(step.id.clone()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let top_level: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &all_steps {
            if let Some(policy) = &step.on_error {
                if policy.action == ErrorAction::Goto {
                    match &policy.goto_step {
                        Some(target) if top_level.contains(target.as_str()) => {}
                        Some(target) => return Err(WorkflowError::UnknownStep(target.clone())),
                        None => {
                            return Err(WorkflowError::InvalidDefinition(format!(
                                "step '{}' declares goto without goto_step",
                                step.id
                            )))
                        }
                    }
                }
            }
            if step.step_type == StepType::Condition {
                if let Some(targets) = step.config.get("next_steps").and_then(|v| v.as_array()) {
                    for target in targets {
                        let Some(target) = target.as_str() else {
                            return Err(WorkflowError::InvalidDefinition(format!(
                                "step '{}' has a non-string next_steps entry",
                                step.id
                            )));
                        };
                        if !top_level.contains(target) {
                            return Err(WorkflowError::UnknownStep(target.to_string()));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Recursively flattens steps, descending into loop bodies and parallel
/// branches. The engine re-parses nested steps at execution time; here they
/// only matter for id-uniqueness and reference checks.
fn flatten_steps(steps: &[Step]) -> Vec<Step> {
    let mut out = Vec::new();
    for step in steps {
        out.push(step.clone());
        match step.step_type {
            StepType::Loop => {
                if let Ok(nested) = serde_json::from_value::<Vec<Step>>(
                    step.config.get("steps").cloned().unwrap_or_default(),
                ) {
                    out.extend(flatten_steps(&nested));
                }
            }
            StepType::Parallel => {
                if let Ok(branches) = serde_json::from_value::<Vec<Vec<Step>>>(
                    step.config.get("branches").cloned().unwrap_or_default(),
                ) {
                    for branch in &branches {
                        out.extend(flatten_steps(branch));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, step_type: StepType, config: serde_json::Value) -> Step {
        Step {
            id: id.to_string(),
            name: String::new(),
            step_type,
            config,
            on_error: None,
        }
    }

    fn definition(steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            version: 1,
            triggers: vec![Trigger {
                event_type: "RCON_CHAT_MESSAGE".to_string(),
                conditions: vec![],
                variables: Default::default(),
            }],
            variables: Default::default(),
            steps,
            default_action: ErrorAction::Stop,
            on_failure: vec![],
        }
    }

    #[test]
    fn valid_definition_passes() {
        let def = definition(vec![
            step("greet", StepType::Action, json!({"action": "admin_broadcast"})),
            step("after", StepType::Delay, json!({"delay_ms": 100})),
        ]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn duplicate_step_ids_fail() {
        let def = definition(vec![
            step("a", StepType::Delay, json!({"delay_ms": 1})),
            step("a", StepType::Delay, json!({"delay_ms": 2})),
        ]);
        assert!(matches!(
            def.validate(),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn branch_targets_must_exist() {
        let def = definition(vec![step(
            "check",
            StepType::Condition,
            json!({"conditions": [], "next_steps": ["missing"]}),
        )]);
        assert!(matches!(def.validate(), Err(WorkflowError::UnknownStep(t)) if t == "missing"));
    }

    #[test]
    fn goto_targets_must_exist() {
        let mut failing = step("a", StepType::Action, json!({"action": "log_message"}));
        failing.on_error = Some(OnErrorPolicy {
            action: ErrorAction::Goto,
            max_retries: 0,
            retry_delay_ms: 0,
            goto_step: Some("elsewhere".to_string()),
        });
        let def = definition(vec![failing]);
        assert!(matches!(def.validate(), Err(WorkflowError::UnknownStep(_))));
    }

    #[test]
    fn nested_loop_step_ids_count_toward_uniqueness() {
        let def = definition(vec![
            step("a", StepType::Delay, json!({"delay_ms": 1})),
            step(
                "looped",
                StepType::Loop,
                json!({"collection": [1, 2], "steps": [{"id": "a", "type": "delay", "config": {"delay_ms": 1}}]}),
            ),
        ]);
        assert!(matches!(
            def.validate(),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn triggerless_workflow_is_rejected() {
        let mut def = definition(vec![]);
        def.triggers.clear();
        assert!(def.validate().is_err());
    }

    #[test]
    fn definition_round_trips_through_json() {
        let def = definition(vec![step(
            "greet",
            StepType::Action,
            json!({"action": "admin_broadcast", "message": "hi"}),
        )]);
        let text = serde_json::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.steps[0].step_type, StepType::Action);
    }
}
