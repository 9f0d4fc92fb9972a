//! # Bastion Plugin System
//!
//! Long-lived, configurable reactors attached to servers. A **plugin
//! definition** is a static descriptor — id, version, config schema, the
//! events it consumes, the features and connectors it needs, an instance
//! factory. A **plugin instance** is one configured reactor on one server,
//! with the lifecycle `Create → Initialize → Start → HandleEvent* → Stop`.
//!
//! ## Capability model
//!
//! Plugins never touch the core directly. At initialize time each instance
//! receives a [`PluginApis`] bundle whose accessors are gated twice:
//!
//! 1. **Feature gateway** — an API is only reachable if the definition (or a
//!    dynamic plugin's manifest) declared its feature; undeclared lookups
//!    return an error, they are never silently absent.
//! 2. **Permission gateway** — every privileged call inside the API
//!    implementations consults the permission service with the plugin
//!    instance as the acting principal.
//!
//! ## Dynamic plugins
//!
//! User-supplied plugins arrive as signed dynamic libraries. Loading
//! verifies the ed25519 signature against trusted keys, checks the declared
//! SDK version (major must match, minor must not exceed the host), and reads
//! the embedded manifest. Running instances are watched by the sandbox
//! monitor (task count, memory approximation, cumulative busy time); a
//! breached ceiling moves the instance to `error` and stops it. Library
//! unloading is best-effort: process-wide dynamic code may not be fully
//! unloadable, an accepted limitation.

pub mod api;
pub mod builtin;
pub mod definition;
pub mod dynamic;
pub mod error;
pub mod instance;
pub mod manager;
pub mod sandbox;
pub mod testing;

pub use api::{
    AdminApi, ApiError, ApiSet, ConnectorApi, EventApi, PluginApis, PluginLogApi, PluginStoreApi,
    RconApi, ServerInfoApi,
};
pub use builtin::register_builtin_plugins;
pub use definition::{Feature, Plugin, PluginDefinition};
pub use dynamic::{
    sdk_compatible, DynamicPluginLoader, PluginManifest, HOST_SDK_VERSION, SDK_SYMBOL_BANNER,
};
pub use error::PluginError;
pub use instance::{PluginInstance, PluginStatus};
pub use manager::{ApiSetFactory, CommandExecution, CommandOutcome, PluginManager};
pub use sandbox::{SandboxHandle, SandboxLimits};
