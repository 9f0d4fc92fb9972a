//! Error types for the workflow engine.

use bastion_events::WorkflowId;

/// Errors from workflow validation and execution.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Structural problems found at create/update time.
    #[error("Workflow definition invalid: {0}")]
    InvalidDefinition(String),

    #[error("Workflow {0} not found")]
    NotFound(WorkflowId),

    /// A step referenced an id that does not exist.
    #[error("Step '{0}' referenced but not defined")]
    UnknownStep(String),

    /// A step's interpolated config is missing or mistyped.
    #[error("Step '{step}' config error: {message}")]
    StepConfig { step: String, message: String },

    /// An action failed in the dispatcher.
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// The caller is not allowed to perform the step's action.
    #[error("Action not authorized: {0}")]
    Unauthorized(String),

    /// Script parse or runtime failure.
    #[error("Script error: {0}")]
    Script(String),

    /// Script exceeded its wall-clock budget.
    #[error("Script exceeded its {0:?} budget")]
    ScriptTimeout(std::time::Duration),

    /// Telemetry write failure, surfaced because step logs must not drop.
    #[error("Telemetry write failed: {0}")]
    Telemetry(#[from] bastion_telemetry::TelemetryError),
}
