//! Error types for plugin operations.

use crate::definition::Feature;
use bastion_events::SchemaError;

/// Errors that can occur during plugin lifecycle management and execution.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Plugin initialization failed during startup.
    #[error("Plugin initialization failed: {0}")]
    InitializationFailed(String),

    /// Error occurred during plugin execution.
    #[error("Plugin execution error: {0}")]
    ExecutionError(String),

    /// Requested plugin, instance or command was not found.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Invalid instance configuration; rejected before any instance exists.
    #[error("Plugin config invalid: {0}")]
    InvalidConfig(#[from] SchemaError),

    /// A second instance was requested for a single-instance plugin.
    #[error("Plugin '{0}' does not allow multiple instances per server")]
    InstanceExists(String),

    /// The plugin asked for an API whose feature it never declared.
    #[error("Feature '{0:?}' was not declared in the plugin manifest")]
    FeatureNotDeclared(Feature),

    /// A privileged API call failed its permission check.
    #[error(transparent)]
    PermissionDenied(#[from] bastion_access::AccessError),

    /// Signature, version or symbol problems while loading a dynamic plugin.
    #[error("Plugin load error: {0}")]
    LoadError(String),

    /// The sandbox monitor found a breached ceiling.
    #[error("Sandbox limit exceeded: {0}")]
    SandboxBreach(String),

    /// Runtime error such as panic or system failure.
    #[error("Plugin runtime error: {0}")]
    Runtime(String),
}
