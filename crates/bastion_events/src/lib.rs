//! # Bastion Event Core
//!
//! Typed events and the in-process event bus for the Bastion control panel.
//! Every observable fact about a managed game server — console notifications,
//! tailed log records, workflow activity, plugin activity — is normalized into
//! a [`NormalizedEvent`] and fanned out to subscribers through the
//! [`EventBus`].
//!
//! ## Core Guarantees
//!
//! - **Type Safety**: event kinds are a closed vocabulary ([`EventType`]) with
//!   an explicit `Unknown` escape hatch; payloads are typed structs serialized
//!   into a generic JSON tree for path-based consumers.
//! - **Bounded Fan-Out**: every subscriber owns a bounded queue; a slow
//!   subscriber loses events (counted per subscriber) instead of stalling
//!   ingest.
//! - **Ordering**: a subscriber observes events from a single publisher in
//!   publish order. Across publishers there is no ordering guarantee.
//! - **Best Effort**: delivery is at-most-once and in-memory only; a restart
//!   resets all bus state.

pub mod bus;
pub mod events;
pub mod schema;
pub mod shutdown;
pub mod types;

pub use bus::{EventBus, EventBusStats, Subscription, SubscriptionId};
pub use events::{
    AdminCameraPayload, ChatMessagePayload, ConnectionClosedPayload, DeployableDamagedPayload,
    EventError,
    EventSource, EventType, JoinSucceededPayload, NewGamePayload, NormalizedEvent,
    PlayerConnectedPayload, PlayerDamagedPayload, PlayerDiedPayload, PlayerDisconnectedPayload,
    PlayerKickedPayload, PlayerPossessPayload, PlayerRevivedPayload, PlayerSquadChangePayload,
    PlayerWarnedPayload, PlayerWoundedPayload, RoundEndedPayload, SquadCreatedPayload,
};
pub use schema::{ConfigSchema, FieldKind, FieldSpec, SchemaError};
pub use shutdown::ShutdownState;
pub use types::{EventId, ExecutionId, PluginInstanceId, ServerId, ServerRecord, WorkflowId};

// External dependencies that downstream crates commonly need alongside events
pub use chrono;
pub use serde::{Deserialize, Serialize};
