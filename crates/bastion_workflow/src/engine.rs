//! Trigger matching and staged step execution.

use crate::actions::ActionDispatcher;
use crate::condition::evaluate_all;
use crate::context::WorkflowExecution;
use crate::definition::{ErrorAction, OnErrorPolicy, Step, StepType, WorkflowRecord};
use crate::error::WorkflowError;
use crate::interpolate::interpolate_value;
use crate::script::{run_script, ScriptHost, ScriptViews, DEFAULT_STATEMENT_BUDGET};
use bastion_events::{NormalizedEvent, ServerId, Subscription, WorkflowId};
use bastion_telemetry::{TelemetrySink, WorkflowStepLog, WorkflowSummaryLog};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wall-clock budget for one script step.
pub const DEFAULT_SCRIPT_BUDGET: Duration = Duration::from_secs(5);

/// Hard cap on loop-step iterations when the config declares none.
const DEFAULT_MAX_ITERATIONS: u64 = 100;

/// What one step produced, flow-wise.
enum StepFlow {
    /// Step finished; value recorded under its id, flow advances.
    Value(Value),
    /// Jump to a sibling step id.
    Jump(String),
    /// A nested sequence requested a terminal stop.
    StopAll,
}

enum FlowSignal {
    Ran,
    Stopped,
}

/// The engine: holds enabled workflows, matches triggers, runs executions.
pub struct WorkflowEngine {
    workflows: DashMap<WorkflowId, WorkflowRecord>,
    dispatcher: Arc<dyn ActionDispatcher>,
    sink: Arc<dyn TelemetrySink>,
    /// Workflow-scoped variables (`scope = "workflow"` on a variable step):
    /// shared across executions of the same workflow, unlike ordinary
    /// per-execution variables.
    persistent_vars: DashMap<(WorkflowId, String), Value>,
    script_timeout: Duration,
    cancel: CancellationToken,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.workflows.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            workflows: DashMap::new(),
            dispatcher,
            sink,
            persistent_vars: DashMap::new(),
            script_timeout: DEFAULT_SCRIPT_BUDGET,
            cancel: CancellationToken::new(),
        }
    }

    /// Registers or replaces a workflow after structural validation.
    pub fn upsert_workflow(&self, record: WorkflowRecord) -> Result<(), WorkflowError> {
        record.definition.validate()?;
        info!(
            "⚙️ Workflow '{}' ({}) {} on server {}",
            record.name,
            record.id,
            if record.enabled { "enabled" } else { "disabled" },
            record.server_id
        );
        self.workflows.insert(record.id, record);
        Ok(())
    }

    pub fn remove_workflow(&self, id: WorkflowId) {
        self.workflows.remove(&id);
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn workflows_for(&self, server_id: ServerId) -> Vec<WorkflowRecord> {
        self.workflows
            .iter()
            .filter(|w| w.server_id == server_id)
            .map(|w| w.clone())
            .collect()
    }

    /// Fire-and-forget entry: matched workflows run independently in
    /// parallel, nothing serializes them.
    pub fn handle_event(self: &Arc<Self>, event: &NormalizedEvent) {
        for record in self.matching_workflows(event) {
            let engine = Arc::clone(self);
            let event = event.clone();
            tokio::spawn(async move {
                engine.execute_workflow(record, &event).await;
            });
        }
    }

    /// Awaited entry used by tests and synchronous callers: runs matched
    /// workflows one after another and returns how many ran.
    pub async fn run_matching(&self, event: &NormalizedEvent) -> usize {
        let matched = self.matching_workflows(event);
        let count = matched.len();
        for record in matched {
            self.execute_workflow(record, event).await;
        }
        count
    }

    /// Spawns the pump draining a bus subscription into trigger matching.
    pub fn spawn_event_pump(self: &Arc<Self>, mut subscription: Subscription) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        engine.handle_event(&event);
                    }
                }
            }
            debug!("Workflow event pump exited");
        });
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Enabled workflows on the event's server whose first matching trigger
    /// accepts the event. All conditions in a trigger must hold; the first
    /// matching trigger wins per workflow.
    fn matching_workflows(&self, event: &NormalizedEvent) -> Vec<WorkflowRecord> {
        let qualified = event.qualified_type();
        self.workflows
            .iter()
            .filter(|w| w.server_id == event.server_id && w.enabled)
            .filter(|w| {
                w.definition.triggers.iter().any(|trigger| {
                    trigger.event_type == qualified
                        && evaluate_all(&trigger.conditions, &event.data)
                })
            })
            .map(|w| w.clone())
            .collect()
    }

    async fn execute_workflow(&self, record: WorkflowRecord, event: &NormalizedEvent) {
        let qualified = event.qualified_type();
        let trigger_overrides = record
            .definition
            .triggers
            .iter()
            .find(|t| t.event_type == qualified && evaluate_all(&t.conditions, &event.data))
            .map(|t| t.variables.clone())
            .unwrap_or_default();

        let mut ctx = WorkflowExecution::begin(
            record.id,
            &record.name,
            event,
            &record.definition.variables,
            &trigger_overrides,
        );
        // Workflow-scoped variables survive across executions; overlay them
        // on top of the per-execution defaults.
        for entry in self.persistent_vars.iter() {
            let (workflow_id, name) = entry.key();
            if *workflow_id == record.id {
                ctx.variables.insert(name.clone(), entry.value().clone());
            }
        }

        debug!(
            "Execution {} of workflow '{}' started by {qualified}",
            ctx.execution_id, record.name
        );

        let outcome = self.run_steps(&mut ctx, &record, &record.definition.steps).await;
        let (status, error_message) = match &outcome {
            Ok(FlowSignal::Ran) => ("completed", None),
            Ok(FlowSignal::Stopped) => ("failed", None),
            Err(e) => ("failed", Some(e.to_string())),
        };

        if status == "failed" && !record.definition.on_failure.is_empty() {
            if let Err(e) = self
                .run_steps(&mut ctx, &record, &record.definition.on_failure)
                .await
            {
                warn!("on_failure sequence of '{}' failed too: {e}", record.name);
            }
        }

        let total_steps = record.definition.steps.len();
        let summary = WorkflowSummaryLog {
            execution_id: ctx.execution_id,
            workflow_id: record.id,
            server_id: ctx.server_id,
            trigger_event_type: ctx.trigger_event_type.clone(),
            started_at: ctx.started_at,
            completed_at: Utc::now(),
            status: status.to_string(),
            total_steps,
            completed_steps: ctx.completed_steps,
            failed_steps: ctx.failed_steps,
            skipped_steps: total_steps
                .saturating_sub(ctx.completed_steps)
                .saturating_sub(ctx.failed_steps),
            total_duration_ms: ctx.elapsed_ms(),
            error_message,
        };
        if let Err(e) = self.sink.write_workflow_summary(&summary).await {
            error!("Workflow summary write failed: {e}");
        }
    }

    /// Runs one step list with jump/retry/stop handling.
    fn run_steps<'a>(
        &'a self,
        ctx: &'a mut WorkflowExecution,
        record: &'a WorkflowRecord,
        steps: &'a [Step],
    ) -> BoxFuture<'a, Result<FlowSignal, WorkflowError>> {
        Box::pin(async move {
            let mut index = 0usize;
            let mut step_order = 0usize;
            while index < steps.len() {
                if self.cancel.is_cancelled() {
                    return Ok(FlowSignal::Stopped);
                }
                let step = &steps[index];
                ctx.current_step = Some(step.id.clone());
                step_order += 1;

                let mut attempts = 0u32;
                loop {
                    let started = Instant::now();
                    let (input, outcome) = self.run_single_step(ctx, record, step).await;
                    let duration_ms = started.elapsed().as_millis() as u64;

                    match outcome {
                        Ok(StepFlow::Value(value)) => {
                            self.log_step(ctx, step, step_order, "completed", &input, &value, None, duration_ms)
                                .await;
                            ctx.record_result(&step.id, value);
                            ctx.completed_steps += 1;
                            index += 1;
                            break;
                        }
                        Ok(StepFlow::Jump(target)) => {
                            let jump_index = steps
                                .iter()
                                .position(|s| s.id == target)
                                .ok_or_else(|| WorkflowError::UnknownStep(target.clone()))?;
                            self.log_step(ctx, step, step_order, "completed", &input, &json!({"jumped_to": target}), None, duration_ms)
                                .await;
                            ctx.completed_steps += 1;
                            index = jump_index;
                            break;
                        }
                        Ok(StepFlow::StopAll) => {
                            self.log_step(ctx, step, step_order, "stopped", &input, &Value::Null, None, duration_ms)
                                .await;
                            return Ok(FlowSignal::Stopped);
                        }
                        Err(e) => {
                            let policy = step
                                .on_error
                                .clone()
                                .unwrap_or(OnErrorPolicy {
                                    action: record.definition.default_action,
                                    max_retries: 0,
                                    retry_delay_ms: 0,
                                    goto_step: None,
                                });

                            if policy.action == ErrorAction::Retry && attempts < policy.max_retries
                            {
                                attempts += 1;
                                self.log_step(ctx, step, step_order, "retrying", &input, &Value::Null, Some(e.to_string()), duration_ms)
                                    .await;
                                tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms))
                                    .await;
                                continue;
                            }

                            self.log_step(ctx, step, step_order, "failed", &input, &Value::Null, Some(e.to_string()), duration_ms)
                                .await;
                            ctx.failed_steps += 1;

                            // Retry exhaustion falls through to the declared
                            // terminal action: goto if named, stop otherwise.
                            let terminal = match policy.action {
                                ErrorAction::Retry => match &policy.goto_step {
                                    Some(_) => ErrorAction::Goto,
                                    None => ErrorAction::Stop,
                                },
                                other => other,
                            };
                            match terminal {
                                ErrorAction::Continue => {
                                    index += 1;
                                    break;
                                }
                                ErrorAction::Goto => {
                                    let target = policy.goto_step.clone().ok_or_else(|| {
                                        WorkflowError::InvalidDefinition(format!(
                                            "step '{}' goto without target",
                                            step.id
                                        ))
                                    })?;
                                    index = steps
                                        .iter()
                                        .position(|s| s.id == target)
                                        .ok_or_else(|| WorkflowError::UnknownStep(target))?;
                                    break;
                                }
                                ErrorAction::Stop | ErrorAction::Retry => {
                                    return Ok(FlowSignal::Stopped);
                                }
                            }
                        }
                    }
                }
            }
            Ok(FlowSignal::Ran)
        })
    }

    /// Interpolates the step's config just-in-time and runs it. Returns the
    /// interpolated input alongside the outcome so telemetry records what
    /// the step actually saw.
    async fn run_single_step(
        &self,
        ctx: &mut WorkflowExecution,
        record: &WorkflowRecord,
        step: &Step,
    ) -> (Value, Result<StepFlow, WorkflowError>) {
        let (variables_tree, results_tree) = ctx.interpolation_trees();
        let config = {
            let interpolation = ctx.interpolation(&variables_tree, &results_tree);
            interpolate_value(&step.config, &interpolation)
        };

        let outcome = match step.step_type {
            StepType::Action => self.step_action(ctx, record, step, &config).await,
            StepType::Variable => self.step_variable(ctx, record, step, &config).await,
            StepType::Condition => self.step_condition(ctx, &config),
            StepType::Delay => self.step_delay(&config).await,
            StepType::Loop => self.step_loop(ctx, record, step, &config).await,
            StepType::Parallel => self.step_parallel(ctx, record, step, &config).await,
            StepType::Script => self.step_script(ctx, step, &config).await,
        };
        (config, outcome)
    }

    async fn step_action(
        &self,
        ctx: &mut WorkflowExecution,
        record: &WorkflowRecord,
        step: &Step,
        config: &Value,
    ) -> Result<StepFlow, WorkflowError> {
        let action = config_str(config, "action", step)?;
        let server = ctx.server_id;
        let d = self.dispatcher.as_ref();
        let result = match action.as_str() {
            "rcon_command" => {
                d.rcon_command(server, &config_str(config, "command", step)?).await?
            }
            "admin_broadcast" => {
                d.admin_broadcast(server, &config_str(config, "message", step)?).await?
            }
            "chat_message" => {
                d.chat_message(
                    server,
                    &config_str(config, "player", step)?,
                    &config_str(config, "message", step)?,
                )
                .await?
            }
            "kick_player" => {
                d.kick_player(
                    server,
                    &config_str(config, "player", step)?,
                    &config_str_or(config, "reason", ""),
                )
                .await?
            }
            "ban_player" => {
                d.ban_player(
                    server,
                    &config_str(config, "player", step)?,
                    &config_str_or(config, "interval", "1d"),
                    &config_str_or(config, "reason", ""),
                )
                .await?
            }
            "warn_player" => {
                d.warn_player(
                    server,
                    &config_str(config, "player", step)?,
                    &config_str(config, "message", step)?,
                )
                .await?
            }
            "http_request" => {
                d.http_request(
                    &config_str_or(config, "method", "GET"),
                    &config_str(config, "url", step)?,
                    config.get("headers").unwrap_or(&Value::Null),
                    config.get("body").and_then(|b| b.as_str()).map(String::from),
                )
                .await?
            }
            "webhook" => {
                d.webhook(
                    &config_str(config, "url", step)?,
                    config.get("payload").unwrap_or(&Value::Null),
                )
                .await?
            }
            "discord_message" => {
                d.discord_message(server, &config_str(config, "content", step)?).await?
            }
            "log_message" => {
                d.log_message(
                    &config_str_or(config, "level", "info"),
                    &config_str(config, "message", step)?,
                )
                .await?
            }
            "set_variable" => {
                // Alias for a variable step expressed as an action.
                return self.step_variable(ctx, record, step, config).await;
            }
            other => {
                return Err(WorkflowError::StepConfig {
                    step: step.id.clone(),
                    message: format!("unknown action '{other}'"),
                })
            }
        };
        Ok(StepFlow::Value(result))
    }

    async fn step_variable(
        &self,
        ctx: &mut WorkflowExecution,
        record: &WorkflowRecord,
        step: &Step,
        config: &Value,
    ) -> Result<StepFlow, WorkflowError> {
        let name = config_str(config, "name", step)?;
        let raw = config.get("value").cloned().unwrap_or(Value::Null);
        // String right-hand sides may be arithmetic ("${variables.n} + 1"
        // interpolates to "0 + 1"); evaluate them through the script
        // expression machinery and fall back to the literal text.
        let value = match &raw {
            Value::String(text) => evaluate_arithmetic(text).await.unwrap_or(raw.clone()),
            other => other.clone(),
        };

        let workflow_scope = config.get("scope").and_then(|s| s.as_str()) == Some("workflow");
        if workflow_scope {
            self.persistent_vars
                .insert((record.id, name.clone()), value.clone());
        }
        ctx.variables.insert(name.clone(), value.clone());
        Ok(StepFlow::Value(json!({ "name": name, "value": value })))
    }

    fn step_condition(
        &self,
        ctx: &WorkflowExecution,
        config: &Value,
    ) -> Result<StepFlow, WorkflowError> {
        let conditions: Vec<crate::condition::Condition> =
            serde_json::from_value(config.get("conditions").cloned().unwrap_or(json!([])))
                .map_err(|e| WorkflowError::InvalidDefinition(format!("bad conditions: {e}")))?;
        let tree = ctx.condition_tree();
        let held = evaluate_all(&conditions, &tree);
        if held {
            if let Some(next) = config
                .get("next_steps")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
            {
                return Ok(StepFlow::Jump(next.to_string()));
            }
        }
        // On false the flow falls through to the next step in declaration
        // order; the boolean is still recorded as the step's result.
        Ok(StepFlow::Value(json!({ "matched": held })))
    }

    async fn step_delay(&self, config: &Value) -> Result<StepFlow, WorkflowError> {
        let delay_ms = config.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(StepFlow::Value(json!({ "delayed_ms": delay_ms })))
    }

    async fn step_loop(
        &self,
        ctx: &mut WorkflowExecution,
        record: &WorkflowRecord,
        step: &Step,
        config: &Value,
    ) -> Result<StepFlow, WorkflowError> {
        let steps: Vec<Step> =
            serde_json::from_value(config.get("steps").cloned().unwrap_or(json!([])))
                .map_err(|e| WorkflowError::InvalidDefinition(format!("bad loop steps: {e}")))?;
        let collection = match config.get("collection") {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(WorkflowError::StepConfig {
                    step: step.id.clone(),
                    message: format!("loop collection must be an array, got {other}"),
                })
            }
            None => Vec::new(),
        };
        let item_variable = config_str_or(config, "item_variable", "item");
        let max_iterations = config
            .get("max_iterations")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        let mut iterations = 0u64;
        for (i, item) in collection.into_iter().enumerate() {
            if iterations >= max_iterations {
                debug!("Loop step '{}' hit its iteration cap", step.id);
                break;
            }
            iterations += 1;
            ctx.variables.insert(item_variable.clone(), item);
            ctx.variables.insert("loop_index".to_string(), json!(i));
            if let FlowSignal::Stopped = self.run_steps(ctx, record, &steps).await? {
                return Ok(StepFlow::StopAll);
            }
        }
        Ok(StepFlow::Value(json!({ "iterations": iterations })))
    }

    async fn step_parallel(
        &self,
        ctx: &mut WorkflowExecution,
        record: &WorkflowRecord,
        step: &Step,
        config: &Value,
    ) -> Result<StepFlow, WorkflowError> {
        let branches: Vec<Vec<Step>> =
            serde_json::from_value(config.get("branches").cloned().unwrap_or(json!([])))
                .map_err(|e| WorkflowError::InvalidDefinition(format!("bad branches: {e}")))?;

        // Branches run concurrently over snapshot contexts: each sees the
        // variables as they were when the parallel step started. Step
        // results merge back after the join; branch-local variable
        // mutations are discarded.
        let mut branch_ctxs: Vec<WorkflowExecution> =
            branches.iter().map(|_| ctx.branch_snapshot()).collect();
        let futures = branch_ctxs
            .iter_mut()
            .zip(branches.iter())
            .map(|(branch_ctx, steps)| self.run_steps(branch_ctx, record, steps));
        let results = futures::future::join_all(futures).await;

        let mut failed: Option<String> = None;
        for (branch_ctx, result) in branch_ctxs.into_iter().zip(results) {
            for (key, value) in branch_ctx.step_results {
                ctx.step_results.insert(key, value);
            }
            ctx.completed_steps += branch_ctx.completed_steps;
            ctx.failed_steps += branch_ctx.failed_steps;
            match result {
                Ok(FlowSignal::Ran) => {}
                Ok(FlowSignal::Stopped) => {
                    failed.get_or_insert_with(|| "a branch stopped".to_string());
                }
                Err(e) => {
                    failed.get_or_insert(e.to_string());
                }
            }
        }
        // All branches join before the verdict; one failing branch fails
        // the parallel step, and the step's own on_error policy applies.
        match failed {
            Some(message) => Err(WorkflowError::ActionFailed(format!(
                "parallel step '{}': {message}",
                step.id
            ))),
            None => Ok(StepFlow::Value(json!({ "branches": branches.len() }))),
        }
    }

    async fn step_script(
        &self,
        ctx: &mut WorkflowExecution,
        step: &Step,
        config: &Value,
    ) -> Result<StepFlow, WorkflowError> {
        let source = config_str(config, "script", step)?;
        let host = EngineScriptHost {
            dispatcher: Arc::clone(&self.dispatcher),
            server_id: ctx.server_id,
            variables: std::sync::Mutex::new(ctx.variables.clone()),
        };
        let (variables_tree, results_tree) = ctx.interpolation_trees();
        let views = ScriptViews {
            trigger_event: &ctx.trigger_event,
            metadata: &ctx.metadata,
            variables: &variables_tree,
            step_results: &results_tree,
        };

        let result = tokio::time::timeout(
            self.script_timeout,
            run_script(&source, views, &host, DEFAULT_STATEMENT_BUDGET),
        )
        .await
        .map_err(|_| WorkflowError::ScriptTimeout(self.script_timeout))??;

        // Scripts mutate variables through set_variable; fold them back.
        ctx.variables = host
            .variables
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        Ok(StepFlow::Value(Value::Object(result)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_step(
        &self,
        ctx: &WorkflowExecution,
        step: &Step,
        step_order: usize,
        step_status: &str,
        input: &Value,
        output: &Value,
        step_error: Option<String>,
        duration_ms: u64,
    ) {
        let log = WorkflowStepLog {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            server_id: ctx.server_id,
            event_time: Utc::now(),
            trigger_event_type: ctx.trigger_event_type.clone(),
            trigger_event_data: ctx.trigger_event.clone(),
            status: "running".to_string(),
            step_name: step.display_name().to_string(),
            step_type: step.step_type.as_str().to_string(),
            step_order,
            step_status: step_status.to_string(),
            step_input: input.clone(),
            step_output: output.clone(),
            step_error,
            step_duration_ms: duration_ms,
            variables_snapshot: Value::Object(ctx.variables.clone()),
            metadata: ctx.metadata.clone(),
        };
        if let Err(e) = self.sink.write_workflow_step(&log).await {
            error!("Workflow step log write failed: {e}");
        }
    }
}

/// Host the engine installs for script steps: console calls go through the
/// dispatcher, variable access through a working copy folded back into the
/// execution afterwards.
struct EngineScriptHost {
    dispatcher: Arc<dyn ActionDispatcher>,
    server_id: ServerId,
    variables: std::sync::Mutex<Map<String, Value>>,
}

#[async_trait::async_trait]
impl ScriptHost for EngineScriptHost {
    async fn log(&self, level: &str, message: &str) {
        let _ = self.dispatcher.log_message(level, message).await;
    }

    fn get_variable(&self, name: &str) -> Value {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn set_variable(&self, name: &str, value: Value) {
        self.variables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
    }

    async fn rcon_execute(&self, command: &str) -> Result<Value, WorkflowError> {
        self.dispatcher.rcon_command(self.server_id, command).await
    }

    async fn kick_player(&self, player: &str, reason: &str) -> Result<(), WorkflowError> {
        self.dispatcher
            .kick_player(self.server_id, player, reason)
            .await
            .map(|_| ())
    }

    async fn ban_player(
        &self,
        player: &str,
        interval: &str,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        self.dispatcher
            .ban_player(self.server_id, player, interval, reason)
            .await
            .map(|_| ())
    }

    async fn warn_player(&self, player: &str, message: &str) -> Result<(), WorkflowError> {
        self.dispatcher
            .warn_player(self.server_id, player, message)
            .await
            .map(|_| ())
    }

    async fn broadcast(&self, message: &str) -> Result<(), WorkflowError> {
        self.dispatcher
            .admin_broadcast(self.server_id, message)
            .await
            .map(|_| ())
    }

    async fn chat_message(&self, player: &str, message: &str) -> Result<(), WorkflowError> {
        self.dispatcher
            .chat_message(self.server_id, player, message)
            .await
            .map(|_| ())
    }
}

/// A host with no outside world, used to evaluate arithmetic right-hand
/// sides of variable steps. Any host call is an error.
struct InertHost;

#[async_trait::async_trait]
impl ScriptHost for InertHost {
    async fn log(&self, _level: &str, _message: &str) {}
    fn get_variable(&self, _name: &str) -> Value {
        Value::Null
    }
    fn set_variable(&self, _name: &str, _value: Value) {}
    async fn rcon_execute(&self, _command: &str) -> Result<Value, WorkflowError> {
        Err(WorkflowError::Script("not available here".to_string()))
    }
    async fn kick_player(&self, _player: &str, _reason: &str) -> Result<(), WorkflowError> {
        Err(WorkflowError::Script("not available here".to_string()))
    }
    async fn ban_player(&self, _p: &str, _i: &str, _r: &str) -> Result<(), WorkflowError> {
        Err(WorkflowError::Script("not available here".to_string()))
    }
    async fn warn_player(&self, _player: &str, _message: &str) -> Result<(), WorkflowError> {
        Err(WorkflowError::Script("not available here".to_string()))
    }
    async fn broadcast(&self, _message: &str) -> Result<(), WorkflowError> {
        Err(WorkflowError::Script("not available here".to_string()))
    }
    async fn chat_message(&self, _player: &str, _message: &str) -> Result<(), WorkflowError> {
        Err(WorkflowError::Script("not available here".to_string()))
    }
}

/// Evaluates an interpolated right-hand side as an expression, returning
/// `None` when it is not one (plain text stays plain text).
async fn evaluate_arithmetic(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    // A bare number short-circuits without the parser.
    if let Ok(n) = trimmed.parse::<f64>() {
        return Some(Value::from(n));
    }
    // Only expression-looking strings go through the parser: the whole text
    // stays inside the expression alphabet AND carries both an operator and
    // a digit. Plain words and message text stay strings.
    let looks_arithmetic = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || " .+-*/%()_".contains(c))
        && trimmed.chars().any(|c| "+-*/%".contains(c))
        && trimmed.chars().any(|c| c.is_ascii_digit());
    if !looks_arithmetic {
        return None;
    }
    let wrapped = format!("result.value = {trimmed}");
    let views = ScriptViews {
        trigger_event: &Value::Null,
        metadata: &Value::Null,
        variables: &Value::Null,
        step_results: &Value::Null,
    };
    match run_script(&wrapped, views, &InertHost, 200).await {
        Ok(result) => result.get("value").cloned().map(|v| match v.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => Value::from(f as i64),
            _ => v,
        }),
        Err(_) => None,
    }
}

fn config_str(config: &Value, key: &str, step: &Step) -> Result<String, WorkflowError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| WorkflowError::StepConfig {
            step: step.id.clone(),
            message: format!("missing string field '{key}'"),
        })
}

fn config_str_or(config: &Value, key: &str, default: &str) -> String {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}
