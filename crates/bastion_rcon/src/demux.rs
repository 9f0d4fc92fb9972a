//! # Console Notification Demux
//!
//! Game servers push asynchronous notifications (chat lines, admin actions,
//! squad creation) over the console channel as `ServerData` frames. This
//! module owns the pattern-matcher table that turns that text into typed
//! events. Anything no matcher recognizes is preserved as an `UNKNOWN` event
//! with the raw text attached, never dropped.

use bastion_events::{
    AdminCameraPayload, ChatMessagePayload, EventSource, EventType, NormalizedEvent,
    PlayerKickedPayload, PlayerWarnedPayload, ServerId, SquadCreatedPayload,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static CHAT: Lazy<Regex> = Lazy::new(|| {
    // [ChatAll] [Online IDs:EOS: <32 hex> steam: <digits>] Name : message
    Regex::new(
        r"^\[(ChatAll|ChatTeam|ChatSquad|ChatAdmin)\] \[Online IDs:EOS: ([0-9a-f]{32}) steam: (\d+)\] (.+?) : (.*)$",
    )
    .unwrap()
});

static WARNED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^Remote admin has warned player (.+)\. Message was "(.*)"$"#).unwrap()
});

static KICKED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Kicked player (\d+)\. \[Online IDs=[^\]]*\] (.+)$").unwrap());

static BANNED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Banned player (\d+)\. \[steamid=([^\]]+)\] (.+) for interval (.+)$").unwrap()
});

static POSSESSED_CAMERA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[Online Ids:EOS: ([0-9a-f]{32})[^\]]*\] (.+) has possessed admin camera\.$")
        .unwrap()
});

static UNPOSSESSED_CAMERA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[Online IDs:EOS: ([0-9a-f]{32})[^\]]*\] (.+) has unpossessed admin camera\.$")
        .unwrap()
});

static SQUAD_CREATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(.+?) \(Online IDs:[^)]*\) has created Squad (\d+) \(Squad Name: (.+)\) on (.+)$",
    )
    .unwrap()
});

/// Parses one `ServerData` body into zero or more normalized events.
///
/// A chat line whose message starts with `!` additionally yields a
/// `CHAT_COMMAND` event so command-style workflows can trigger without
/// re-parsing chat text.
pub fn demux_notification(server_id: ServerId, body: &str) -> Vec<NormalizedEvent> {
    let raw = Some(body.to_string());

    if let Some(caps) = CHAT.captures(body) {
        let payload = ChatMessagePayload {
            player_name: caps[4].to_string(),
            steam_id: Some(caps[3].to_string()),
            eos_id: Some(caps[2].to_string()),
            channel: caps[1].to_string(),
            message: caps[5].to_string(),
        };
        let mut events = Vec::with_capacity(2);
        match NormalizedEvent::from_payload(
            server_id,
            EventSource::Rcon,
            EventType::ChatMessage,
            &payload,
            raw.clone(),
        ) {
            Ok(evt) => events.push(evt),
            Err(e) => warn!("Failed to build chat event: {e}"),
        }
        if payload.message.starts_with('!') {
            if let Ok(evt) = NormalizedEvent::from_payload(
                server_id,
                EventSource::Rcon,
                EventType::ChatCommand,
                &payload,
                raw,
            ) {
                events.push(evt);
            }
        }
        return events;
    }

    if let Some(caps) = WARNED.captures(body) {
        let payload = PlayerWarnedPayload {
            player_name: caps[1].to_string(),
            reason: caps[2].to_string(),
        };
        return one(server_id, EventType::PlayerWarned, &payload, raw);
    }

    if let Some(caps) = KICKED.captures(body) {
        let payload = PlayerKickedPayload {
            player_id: caps[1].to_string(),
            player_name: caps[2].to_string(),
        };
        return one(server_id, EventType::PlayerKicked, &payload, raw);
    }

    if let Some(caps) = BANNED.captures(body) {
        let payload = serde_json::json!({
            "player_id": caps[1].to_string(),
            "steam_id": caps[2].to_string(),
            "player_name": caps[3].to_string(),
            "interval": caps[4].to_string(),
        });
        return vec![NormalizedEvent::from_value(
            server_id,
            EventSource::Rcon,
            EventType::PlayerBanned,
            payload,
            raw,
        )];
    }

    if let Some(caps) = POSSESSED_CAMERA.captures(body) {
        let payload = AdminCameraPayload {
            admin_name: caps[2].to_string(),
            eos_id: Some(caps[1].to_string()),
        };
        return one(server_id, EventType::PossessedAdminCamera, &payload, raw);
    }

    if let Some(caps) = UNPOSSESSED_CAMERA.captures(body) {
        let payload = AdminCameraPayload {
            admin_name: caps[2].to_string(),
            eos_id: Some(caps[1].to_string()),
        };
        return one(server_id, EventType::UnpossessedAdminCamera, &payload, raw);
    }

    if let Some(caps) = SQUAD_CREATED.captures(body) {
        let payload = SquadCreatedPayload {
            player_name: caps[1].to_string(),
            squad_id: caps[2].to_string(),
            squad_name: caps[3].to_string(),
            team_name: caps[4].to_string(),
        };
        return one(server_id, EventType::SquadCreated, &payload, raw);
    }

    // Unrecognized notification: keep it observable.
    vec![NormalizedEvent::from_value(
        server_id,
        EventSource::Rcon,
        EventType::Unknown("UNKNOWN".to_string()),
        serde_json::json!({ "text": body }),
        raw,
    )]
}

fn one<T: serde::Serialize>(
    server_id: ServerId,
    event_type: EventType,
    payload: &T,
    raw: Option<String>,
) -> Vec<NormalizedEvent> {
    match NormalizedEvent::from_payload(server_id, EventSource::Rcon, event_type, payload, raw) {
        Ok(evt) => vec![evt],
        Err(e) => {
            warn!("Failed to build console event: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_events::ChatMessagePayload;

    const EOS: &str = "000251073bd6429fb4b0ef2e5a5f21da";

    #[test]
    fn chat_line_produces_chat_message() {
        let line = format!(
            "[ChatAll] [Online IDs:EOS: {EOS} steam: 76561198012345678] Alice : hello squad"
        );
        let events = demux_notification(ServerId::new(), &line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ChatMessage);
        let payload: ChatMessagePayload = events[0].payload().unwrap();
        assert_eq!(payload.player_name, "Alice");
        assert_eq!(payload.channel, "ChatAll");
        assert_eq!(payload.message, "hello squad");
        assert_eq!(payload.steam_id.as_deref(), Some("76561198012345678"));
    }

    #[test]
    fn bang_prefixed_chat_also_emits_chat_command() {
        let line =
            format!("[ChatTeam] [Online IDs:EOS: {EOS} steam: 76561198000000001] Bob : !help me");
        let events = demux_notification(ServerId::new(), &line);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::ChatMessage);
        assert_eq!(events[1].event_type, EventType::ChatCommand);
    }

    #[test]
    fn warned_line_parses_name_and_reason() {
        let events = demux_notification(
            ServerId::new(),
            r#"Remote admin has warned player Carol. Message was "stop teamkilling""#,
        );
        assert_eq!(events[0].event_type, EventType::PlayerWarned);
        let payload: PlayerWarnedPayload = events[0].payload().unwrap();
        assert_eq!(payload.player_name, "Carol");
        assert_eq!(payload.reason, "stop teamkilling");
    }

    #[test]
    fn kicked_line_parses() {
        let events = demux_notification(
            ServerId::new(),
            "Kicked player 12. [Online IDs= EOS: abc steam: 765] Dave",
        );
        assert_eq!(events[0].event_type, EventType::PlayerKicked);
        let payload: PlayerKickedPayload = events[0].payload().unwrap();
        assert_eq!(payload.player_id, "12");
        assert_eq!(payload.player_name, "Dave");
    }

    #[test]
    fn banned_line_parses() {
        let events = demux_notification(
            ServerId::new(),
            "Banned player 7. [steamid=76561198000000009] Mallory for interval 3d",
        );
        assert_eq!(events[0].event_type, EventType::PlayerBanned);
        assert_eq!(events[0].data["steam_id"], "76561198000000009");
        assert_eq!(events[0].data["interval"], "3d");
    }

    #[test]
    fn admin_camera_lines_parse() {
        let possessed = demux_notification(
            ServerId::new(),
            &format!("[Online Ids:EOS: {EOS} steam: 765] Eve has possessed admin camera."),
        );
        assert_eq!(possessed[0].event_type, EventType::PossessedAdminCamera);

        let unpossessed = demux_notification(
            ServerId::new(),
            &format!("[Online IDs:EOS: {EOS} steam: 765] Eve has unpossessed admin camera."),
        );
        assert_eq!(unpossessed[0].event_type, EventType::UnpossessedAdminCamera);
    }

    #[test]
    fn squad_created_parses() {
        let events = demux_notification(
            ServerId::new(),
            &format!("Frank (Online IDs: EOS: {EOS} steam: 765) has created Squad 3 (Squad Name: ARMOR) on Team One"),
        );
        assert_eq!(events[0].event_type, EventType::SquadCreated);
        let payload: SquadCreatedPayload = events[0].payload().unwrap();
        assert_eq!(payload.squad_id, "3");
        assert_eq!(payload.squad_name, "ARMOR");
        assert_eq!(payload.team_name, "Team One");
    }

    #[test]
    fn unrecognized_text_surfaces_as_unknown() {
        let events = demux_notification(ServerId::new(), "Something entirely novel happened");
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event_type,
            EventType::Unknown("UNKNOWN".to_string())
        );
        assert_eq!(
            events[0].raw.as_deref(),
            Some("Something entirely novel happened")
        );
    }
}
