//! # Event Vocabulary and Normalized Events
//!
//! This module defines the closed vocabulary of event kinds Bastion observes
//! on a managed server, the typed payload structs produced at the two parse
//! sites (RCON demux and log-watcher records), and the [`NormalizedEvent`]
//! envelope that travels the bus.
//!
//! ## Design
//!
//! Parsers build a typed payload struct, then fold it into the envelope's
//! generic JSON tree via [`NormalizedEvent::from_payload`]. Consumers that
//! care about one event kind deserialize the payload back into its struct;
//! consumers that evaluate user-supplied dotted paths (the workflow engine)
//! walk the JSON tree directly. Unknown event names are preserved verbatim as
//! [`EventType::Unknown`] rather than dropped.

use crate::types::{EventId, ServerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Event Sources and Kinds
// ============================================================================

/// Where an event was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Async notification on the remote console channel.
    Rcon,
    /// Record parsed from the tailed game log.
    Log,
    /// Emitted by the workflow engine.
    Workflow,
    /// Emitted by a plugin instance.
    Plugin,
}

impl EventSource {
    /// Stable lowercase name, matching the `source` field of persisted events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Rcon => "rcon",
            EventSource::Log => "log",
            EventSource::Workflow => "workflow",
            EventSource::Plugin => "plugin",
        }
    }

    /// Uppercase prefix used in qualified event names (`RCON_CHAT_MESSAGE`).
    pub fn prefix(&self) -> &'static str {
        match self {
            EventSource::Rcon => "RCON",
            EventSource::Log => "LOG",
            EventSource::Workflow => "WORKFLOW",
            EventSource::Plugin => "PLUGIN",
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed vocabulary of event kinds.
///
/// Console notifications and log records each contribute a fixed set; names
/// the parsers do not recognize are carried as [`EventType::Unknown`] so no
/// observed data is silently discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    // --- Console (RCON) notifications ---
    ChatMessage,
    ChatCommand,
    PlayerWarned,
    PlayerKicked,
    PlayerBanned,
    PossessedAdminCamera,
    UnpossessedAdminCamera,
    SquadCreated,
    ConnectionClosed,
    ConnectionError,
    // --- Game log records ---
    NewGame,
    RoundEnded,
    PlayerConnected,
    PlayerDisconnected,
    PlayerPossess,
    PlayerDamaged,
    PlayerWounded,
    PlayerDied,
    PlayerRevived,
    PlayerSquadChange,
    DeployableDamaged,
    JoinSucceeded,
    /// An event name outside the fixed vocabulary, preserved verbatim.
    Unknown(String),
}

impl EventType {
    /// Stable SCREAMING_SNAKE_CASE name used on the wire and in telemetry.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ChatMessage => "CHAT_MESSAGE",
            EventType::ChatCommand => "CHAT_COMMAND",
            EventType::PlayerWarned => "PLAYER_WARNED",
            EventType::PlayerKicked => "PLAYER_KICKED",
            EventType::PlayerBanned => "PLAYER_BANNED",
            EventType::PossessedAdminCamera => "POSSESSED_ADMIN_CAMERA",
            EventType::UnpossessedAdminCamera => "UNPOSSESSED_ADMIN_CAMERA",
            EventType::SquadCreated => "SQUAD_CREATED",
            EventType::ConnectionClosed => "CONNECTION_CLOSED",
            EventType::ConnectionError => "CONNECTION_ERROR",
            EventType::NewGame => "NEW_GAME",
            EventType::RoundEnded => "ROUND_ENDED",
            EventType::PlayerConnected => "PLAYER_CONNECTED",
            EventType::PlayerDisconnected => "PLAYER_DISCONNECTED",
            EventType::PlayerPossess => "PLAYER_POSSESS",
            EventType::PlayerDamaged => "PLAYER_DAMAGED",
            EventType::PlayerWounded => "PLAYER_WOUNDED",
            EventType::PlayerDied => "PLAYER_DIED",
            EventType::PlayerRevived => "PLAYER_REVIVED",
            EventType::PlayerSquadChange => "PLAYER_SQUAD_CHANGE",
            EventType::DeployableDamaged => "DEPLOYABLE_DAMAGED",
            EventType::JoinSucceeded => "JOIN_SUCCEEDED",
            EventType::Unknown(name) => name.as_str(),
        }
    }

    /// Parses a wire name back into the vocabulary.
    ///
    /// Unrecognized names become [`EventType::Unknown`]; this function never
    /// fails.
    pub fn from_name(name: &str) -> Self {
        match name {
            "CHAT_MESSAGE" => EventType::ChatMessage,
            "CHAT_COMMAND" => EventType::ChatCommand,
            "PLAYER_WARNED" => EventType::PlayerWarned,
            "PLAYER_KICKED" => EventType::PlayerKicked,
            "PLAYER_BANNED" => EventType::PlayerBanned,
            "POSSESSED_ADMIN_CAMERA" => EventType::PossessedAdminCamera,
            "UNPOSSESSED_ADMIN_CAMERA" => EventType::UnpossessedAdminCamera,
            "SQUAD_CREATED" => EventType::SquadCreated,
            "CONNECTION_CLOSED" => EventType::ConnectionClosed,
            "CONNECTION_ERROR" => EventType::ConnectionError,
            "NEW_GAME" => EventType::NewGame,
            "ROUND_ENDED" => EventType::RoundEnded,
            "PLAYER_CONNECTED" => EventType::PlayerConnected,
            "PLAYER_DISCONNECTED" => EventType::PlayerDisconnected,
            "PLAYER_POSSESS" => EventType::PlayerPossess,
            "PLAYER_DAMAGED" => EventType::PlayerDamaged,
            "PLAYER_WOUNDED" => EventType::PlayerWounded,
            "PLAYER_DIED" => EventType::PlayerDied,
            "PLAYER_REVIVED" => EventType::PlayerRevived,
            "PLAYER_SQUAD_CHANGE" => EventType::PlayerSquadChange,
            "DEPLOYABLE_DAMAGED" => EventType::DeployableDamaged,
            "JOIN_SUCCEEDED" => EventType::JoinSucceeded,
            other => EventType::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventType::from_name(&name))
    }
}

// ============================================================================
// The Bus Envelope
// ============================================================================

/// The immutable envelope that travels the event bus.
///
/// `data` is the typed payload folded into a generic JSON tree; `raw` carries
/// the original console/log text where one exists. Once published an event is
/// never mutated — subscribers share it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Unique id for this event.
    pub id: EventId,
    /// The server the event was observed on.
    pub server_id: ServerId,
    /// Which channel produced the event.
    pub source: EventSource,
    /// Event kind within the vocabulary.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// UTC wall-clock time the event was normalized.
    pub timestamp: DateTime<Utc>,
    /// Structured payload.
    pub data: serde_json::Value,
    /// Original wire text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl NormalizedEvent {
    /// Builds an event from a typed payload struct.
    pub fn from_payload<T: Serialize>(
        server_id: ServerId,
        source: EventSource,
        event_type: EventType,
        payload: &T,
        raw: Option<String>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            id: EventId::new(),
            server_id,
            source,
            event_type,
            timestamp: Utc::now(),
            data: serde_json::to_value(payload)?,
            raw,
        })
    }

    /// Builds an event whose payload is already a JSON tree.
    pub fn from_value(
        server_id: ServerId,
        source: EventSource,
        event_type: EventType,
        data: serde_json::Value,
        raw: Option<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            server_id,
            source,
            event_type,
            timestamp: Utc::now(),
            data,
            raw,
        }
    }

    /// Qualified name including the source prefix, e.g. `RCON_CHAT_MESSAGE`
    /// or `LOG_PLAYER_DIED`. Workflow triggers match on this form.
    pub fn qualified_type(&self) -> String {
        format!("{}_{}", self.source.prefix(), self.event_type.as_str())
    }

    /// Deserializes the payload back into a typed struct.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, EventError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

// ============================================================================
// Typed Payloads — Console Notifications
// ============================================================================

/// A chat line relayed over the console channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_id: Option<String>,
    /// Chat channel the line was sent on (`ChatAll`, `ChatTeam`, ...).
    pub channel: String,
    pub message: String,
}

/// An admin warning delivered to a player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWarnedPayload {
    pub player_name: String,
    pub reason: String,
}

/// A player kicked from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerKickedPayload {
    pub player_id: String,
    pub player_name: String,
}

/// An admin entering or leaving the admin camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCameraPayload {
    pub admin_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_id: Option<String>,
}

/// A new squad created in game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadCreatedPayload {
    pub player_name: String,
    pub squad_id: String,
    pub squad_name: String,
    pub team_name: String,
}

/// Connection lifecycle signal published when a console session dies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionClosedPayload {
    pub reason: String,
}

// ============================================================================
// Typed Payloads — Game Log Records
// ============================================================================

/// A new match starting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGamePayload {
    pub map_name: String,
    pub layer_name: String,
}

/// A round ending with a winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundEndedPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    pub layer: String,
}

/// A player's connection reaching the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConnectedPayload {
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// A player leaving the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDisconnectedPayload {
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_id: Option<String>,
}

/// A player possessing a new pawn (vehicle, emplacement, soldier class).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerPossessPayload {
    pub player_name: String,
    pub pawn_class: String,
}

/// Damage dealt between two players.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDamagedPayload {
    pub victim_name: String,
    pub attacker_name: String,
    pub damage: f64,
    pub weapon: String,
    pub teamkill: bool,
}

/// A player dropping into the incapacitated state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWoundedPayload {
    pub victim_name: String,
    pub attacker_name: String,
    pub damage: f64,
    pub weapon: String,
    pub teamkill: bool,
}

/// A player death (gave up or bled out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDiedPayload {
    pub victim_name: String,
    pub attacker_name: String,
    pub damage: f64,
    pub weapon: String,
    pub teamkill: bool,
}

/// A downed player revived by a medic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRevivedPayload {
    pub reviver_name: String,
    pub victim_name: String,
}

/// A player joining or leaving a squad.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSquadChangePayload {
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squad_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

/// Damage to a placed deployable (FOB, emplacement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployableDamagedPayload {
    pub deployable: String,
    pub attacker_name: String,
    pub damage: f64,
    pub weapon: String,
}

/// The fully-completed join handshake, tying together the identifiers a
/// player presented. The identity resolver consumes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSucceededPayload {
    pub player_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eos_id: Option<String>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while building or consuming events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A subscriber channel was closed while publishing.
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}
