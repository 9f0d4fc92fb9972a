//! # Bastion Workflow Engine
//!
//! User-defined trigger→step programs. A workflow names the event type that
//! wakes it, the conditions that must all hold on the event payload, and an
//! ordered list of typed steps: console actions, variable mutation,
//! conditional branches, delays, bounded loops, parallel groups, and a
//! sandboxed embedded script.
//!
//! ## Execution model
//!
//! Every matched trigger mints a fresh execution: its own id, a deep copy of
//! the variable defaults, the triggering event payload, and an append-only
//! step-result map. Executions triggered by the same event type on the same
//! server run independently in parallel; nothing serializes them. String
//! configuration is interpolated just-in-time as each step starts, so later
//! steps observe earlier mutations.
//!
//! ## Telemetry
//!
//! Each step writes one structured record through the telemetry sink, and a
//! summary record closes every execution. Sink writes are synchronous and
//! their errors are surfaced in the log, never silently swallowed — this is
//! the data path that must not drop.


pub mod actions;
pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod interpolate;
pub mod script;

pub use actions::{ActionDispatcher, RecordingDispatcher};
pub use condition::{evaluate_all, evaluate_condition, lookup_path, Condition, Operator};
pub use context::WorkflowExecution;
pub use definition::{
    ErrorAction, OnErrorPolicy, Step, StepType, Trigger, WorkflowDefinition, WorkflowRecord,
};
pub use engine::{WorkflowEngine, DEFAULT_SCRIPT_BUDGET};
pub use error::WorkflowError;
