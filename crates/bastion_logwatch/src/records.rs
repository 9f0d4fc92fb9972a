//! Typed parsing of log-watcher records.
//!
//! The agent has already parsed the raw game log; what arrives here is a
//! `{event, data, original}` JSON object per line. This module validates the
//! payload shape for known event names and folds everything into the
//! normalized envelope.

use bastion_events::{
    DeployableDamagedPayload, EventSource, EventType, JoinSucceededPayload, NewGamePayload,
    NormalizedEvent, PlayerConnectedPayload, PlayerDamagedPayload, PlayerDiedPayload,
    PlayerDisconnectedPayload, PlayerPossessPayload, PlayerRevivedPayload,
    PlayerSquadChangePayload, PlayerWoundedPayload, RoundEndedPayload, ServerId,
};
use serde::Deserialize;
use tracing::warn;

/// One record as the agent sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherRecord {
    /// Event name from the log vocabulary (`NEW_GAME`, `PLAYER_DIED`, ...).
    pub event: String,
    /// Event payload matching the per-event schema.
    #[serde(default)]
    pub data: serde_json::Value,
    /// The original log line, if the agent kept it.
    #[serde(default)]
    pub original: Option<String>,
}

/// Errors from the log-watcher stream.
#[derive(Debug, thiserror::Error)]
pub enum LogWatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Log stream closed by peer")]
    StreamClosed,
}

/// Parses one JSON line into a normalized event.
///
/// Known event names get their payload validated against the typed struct;
/// a payload that fails validation is still published with the raw tree (the
/// mismatch is logged), because losing observed data is worse than carrying
/// an unvalidated record. Unknown names pass through untouched.
pub fn parse_record(server_id: ServerId, line: &str) -> Result<NormalizedEvent, LogWatchError> {
    let record: WatcherRecord = serde_json::from_str(line)?;
    let event_type = EventType::from_name(&record.event);
    validate_payload(&event_type, &record);
    Ok(NormalizedEvent::from_value(
        server_id,
        EventSource::Log,
        event_type,
        record.data,
        record.original,
    ))
}

fn validate_payload(event_type: &EventType, record: &WatcherRecord) {
    let result: Result<(), serde_json::Error> = match event_type {
        EventType::NewGame => typed::<NewGamePayload>(&record.data),
        EventType::RoundEnded => typed::<RoundEndedPayload>(&record.data),
        EventType::PlayerConnected => typed::<PlayerConnectedPayload>(&record.data),
        EventType::PlayerDisconnected => typed::<PlayerDisconnectedPayload>(&record.data),
        EventType::PlayerPossess => typed::<PlayerPossessPayload>(&record.data),
        EventType::PlayerDamaged => typed::<PlayerDamagedPayload>(&record.data),
        EventType::PlayerWounded => typed::<PlayerWoundedPayload>(&record.data),
        EventType::PlayerDied => typed::<PlayerDiedPayload>(&record.data),
        EventType::PlayerRevived => typed::<PlayerRevivedPayload>(&record.data),
        EventType::PlayerSquadChange => typed::<PlayerSquadChangePayload>(&record.data),
        EventType::DeployableDamaged => typed::<DeployableDamagedPayload>(&record.data),
        EventType::JoinSucceeded => typed::<JoinSucceededPayload>(&record.data),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!(
            "Log record '{}' payload does not match its schema ({e}); publishing raw tree",
            record.event
        );
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
) -> Result<(), serde_json::Error> {
    serde_json::from_value::<T>(value.clone()).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_record_parses_into_typed_event() {
        let line = r#"{"event":"PLAYER_DIED","data":{"victim_name":"Bob","attacker_name":"Alice","damage":140.0,"weapon":"BP_Rifle","teamkill":true},"original":"raw text"}"#;
        let event = parse_record(ServerId::new(), line).unwrap();
        assert_eq!(event.event_type, EventType::PlayerDied);
        assert_eq!(event.source, EventSource::Log);
        assert_eq!(event.raw.as_deref(), Some("raw text"));
        let payload: PlayerDiedPayload = event.payload().unwrap();
        assert!(payload.teamkill);
        assert_eq!(event.qualified_type(), "LOG_PLAYER_DIED");
    }

    #[test]
    fn unknown_event_name_is_preserved() {
        let line = r#"{"event":"TICK_RATE","data":{"tick_rate":48.5}}"#;
        let event = parse_record(ServerId::new(), line).unwrap();
        assert_eq!(event.event_type, EventType::Unknown("TICK_RATE".into()));
        assert_eq!(event.data["tick_rate"], 48.5);
    }

    #[test]
    fn mismatched_payload_is_still_published() {
        // damage is a string, which the typed payload rejects
        let line = r#"{"event":"PLAYER_DAMAGED","data":{"oops":true}}"#;
        let event = parse_record(ServerId::new(), line).unwrap();
        assert_eq!(event.event_type, EventType::PlayerDamaged);
        assert_eq!(event.data["oops"], true);
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_record(ServerId::new(), "not json").is_err());
    }
}
