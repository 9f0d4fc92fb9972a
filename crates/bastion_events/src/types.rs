//! # Core Type Definitions
//!
//! Identifier newtypes used throughout Bastion. Wrapper types keep the many
//! UUID-shaped ids in this system from being confused with one another: a
//! [`ServerId`] indexes the connection registry, an [`ExecutionId`] names one
//! workflow run, and so on.
//!
//! All ids serialize as plain UUID strings so they round-trip through JSON
//! configs and telemetry records unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random id using UUID v4.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for a managed game server.
    ///
    /// Each server owns at most one live RCON connection and at most one live
    /// log-watcher stream; both are keyed by this id.
    ServerId
}

uuid_id! {
    /// Unique identifier for a single published event.
    EventId
}

uuid_id! {
    /// Unique identifier for one workflow execution.
    ///
    /// A fresh id is minted per matched trigger; all step telemetry for that
    /// run carries it.
    ExecutionId
}

uuid_id! {
    /// Unique identifier for a stored workflow definition.
    WorkflowId
}

uuid_id! {
    /// Unique identifier for a plugin instance on one server.
    PluginInstanceId
}

/// A managed game server as persisted by the control panel.
///
/// Owns at most one live console connection and at most one live log-watcher
/// stream; both subsystems key their registries by `id`. Destroyed only by
/// admin action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    /// Network host the game server runs on.
    pub host: String,
    /// Port players connect to.
    pub game_port: u16,
    /// Remote console port.
    pub rcon_port: u16,
    /// Remote console password.
    pub rcon_password: String,
}

impl ServerRecord {
    /// `host:rcon_port` endpoint string for the console dialer.
    pub fn rcon_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.rcon_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        let id = ServerId::new();
        let parsed: ServerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_serialize_as_uuid_strings() {
        let id = ExecutionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
    }

    #[test]
    fn distinct_ids_do_not_collide() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }
}
