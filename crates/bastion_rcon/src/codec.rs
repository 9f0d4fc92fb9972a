//! # RCON Wire Codec
//!
//! Frames are `size:i32le || id:i32le || type:i32le || body || 0x00 || 0x00`
//! where `size` counts everything after itself. The format must stay
//! bit-exact: live game servers speak it and reject anything else.
//!
//! Command execution uses a two-frame convention. The command goes out with
//! id [`EXEC_ID`], immediately followed by an empty marker with id
//! [`EMPTY_ID`]. The server echoes the marker back after the (possibly
//! multi-frame) response, so the empty frame in the response stream is the
//! end-of-response sentinel. Response assembly lives in the connection; this
//! module only frames and unframes bytes.

use crate::error::RconError;

/// Packet id used for the authentication exchange.
pub const AUTH_ID: i32 = 101;
/// Packet id of the empty end-of-response marker.
pub const EMPTY_ID: i32 = 100;
/// Packet id of outbound exec-command frames.
pub const EXEC_ID: i32 = 50;

/// Smallest legal frame: id + type + two NUL terminators.
const MIN_FRAME_SIZE: usize = 10;
/// Upper bound on a single frame, matching the game servers' own cap.
const MAX_FRAME_SIZE: usize = 8192;

/// RCON packet type discriminants.
///
/// Outbound: `Auth` (3) and `ExecCommand` (2). Inbound: `Response` (0) for
/// command output, `ServerData` (1) for async server-initiated
/// notifications, and `ExecCommand` (2) doubling as the auth response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Response,
    ServerData,
    ExecCommand,
    Auth,
}

impl PacketType {
    /// Wire discriminant.
    pub fn to_wire(self) -> i32 {
        match self {
            PacketType::Response => 0,
            PacketType::ServerData => 1,
            PacketType::ExecCommand => 2,
            PacketType::Auth => 3,
        }
    }

    /// Parses a wire discriminant.
    pub fn from_wire(value: i32) -> Result<Self, RconError> {
        match value {
            0 => Ok(PacketType::Response),
            1 => Ok(PacketType::ServerData),
            2 => Ok(PacketType::ExecCommand),
            3 => Ok(PacketType::Auth),
            other => Err(RconError::Codec(format!("unknown packet type {other}"))),
        }
    }
}

/// One console frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub ptype: PacketType,
    pub body: String,
}

impl Packet {
    /// Authentication frame carrying the console password.
    pub fn auth(password: &str) -> Self {
        Self {
            id: AUTH_ID,
            ptype: PacketType::Auth,
            body: password.to_string(),
        }
    }

    /// Command frame.
    pub fn exec(command: &str) -> Self {
        Self {
            id: EXEC_ID,
            ptype: PacketType::ExecCommand,
            body: command.to_string(),
        }
    }

    /// The empty marker sent after every command; its echo is the
    /// end-of-response sentinel.
    pub fn empty_marker() -> Self {
        Self {
            id: EMPTY_ID,
            ptype: PacketType::ExecCommand,
            body: String::new(),
        }
    }

    /// Encodes the frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = 4 + 4 + body.len() + 2;
        let mut out = Vec::with_capacity(4 + size);
        out.extend_from_slice(&(size as i32).to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.ptype.to_wire().to_le_bytes());
        out.extend_from_slice(body);
        out.push(0);
        out.push(0);
        out
    }
}

/// Incremental frame decoder over a growable byte buffer.
///
/// Feed raw socket reads in with [`FrameDecoder::extend`]; pull complete
/// frames out with [`FrameDecoder::next_frame`], which returns `None` until a
/// full frame is buffered. Responses split across TCP segments reassemble
/// here without the reader caring.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, RconError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let size = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let size = usize::try_from(size)
            .map_err(|_| RconError::Codec(format!("negative frame size {size}")))?;
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&size) {
            return Err(RconError::Codec(format!(
                "frame size {size} outside [{MIN_FRAME_SIZE}, {MAX_FRAME_SIZE}]"
            )));
        }
        if self.buf.len() < 4 + size {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buf.drain(..4 + size).collect();
        let id = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let ptype = PacketType::from_wire(i32::from_le_bytes([
            frame[8], frame[9], frame[10], frame[11],
        ]))?;
        // Strip the trailing body NUL and packet NUL.
        let body_bytes = &frame[12..frame.len() - 2];
        let body = String::from_utf8_lossy(body_bytes).into_owned();
        Ok(Some(Packet { id, ptype, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_little_endian_with_double_nul() {
        let bytes = Packet::exec("ShowCurrentMap").encode();
        // size = 4 + 4 + 14 + 2 = 24
        assert_eq!(&bytes[0..4], &24i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &EXEC_ID.to_le_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
        assert_eq!(&bytes[12..26], b"ShowCurrentMap");
        assert_eq!(&bytes[26..28], &[0, 0]);
    }

    #[test]
    fn round_trip_all_packet_kinds() {
        for packet in [
            Packet::auth("hunter2"),
            Packet::exec("AdminBroadcast hello"),
            Packet::empty_marker(),
            Packet {
                id: 7,
                ptype: PacketType::ServerData,
                body: "[ChatAll] someone : hi".into(),
            },
        ] {
            let mut decoder = FrameDecoder::new();
            decoder.extend(&packet.encode());
            let decoded = decoder.next_frame().unwrap().unwrap();
            assert_eq!(decoded, packet);
            // encode(decode(frame)) == frame
            assert_eq!(decoded.encode(), packet.encode());
        }
    }

    #[test]
    fn decoder_waits_for_a_full_frame() {
        let bytes = Packet::exec("ListPlayers").encode();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes[..7]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(&bytes[7..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().body, "ListPlayers");
    }

    #[test]
    fn decoder_yields_multiple_buffered_frames_in_order() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&Packet::exec("first").encode());
        decoder.extend(&Packet::exec("second").encode());
        assert_eq!(decoder.next_frame().unwrap().unwrap().body, "first");
        assert_eq!(decoder.next_frame().unwrap().unwrap().body, "second");
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_a_codec_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(9000i32).to_le_bytes());
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn undersized_frame_is_a_codec_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(4i32).to_le_bytes());
        assert!(decoder.next_frame().is_err());
    }
}
