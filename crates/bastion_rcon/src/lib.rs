//! # Bastion RCON
//!
//! Persistent remote-console sessions for managed game servers.
//!
//! The crate is layered the way the traffic flows:
//!
//! - [`codec`] — the length-prefixed little-endian packet format, as a pure
//!   encoder plus an incremental decoder, kept bit-exact with the game
//!   servers' console protocol.
//! - [`connection`] — one authenticated session over any async transport:
//!   single-flight command execution behind a one-permit semaphore, response
//!   assembly up to the empty-packet sentinel, a 10s keepalive, and demux of
//!   server-initiated notification frames into typed events.
//! - [`demux`] — the pattern-matcher table that turns console notification
//!   text into [`bastion_events::NormalizedEvent`]s.
//! - [`manager`] — the per-server registry: exponential-backoff reconnect
//!   gating, sticky user disconnects, bulk bring-up from the persisted server
//!   list, and bounded event fan-out.
//!
//! Connections never reconnect themselves. On socket death they emit
//! `CONNECTION_CLOSED` and go quiet; the manager owns all backoff state so
//! retry pacing is observable and testable in one place.

pub mod codec;
pub mod connection;
pub mod demux;
pub mod error;
pub mod manager;

pub use codec::{FrameDecoder, Packet, PacketType, AUTH_ID, EMPTY_ID, EXEC_ID};
pub use connection::{ConnectionState, RconConnection, COMMAND_TIMEOUT, KEEPALIVE_PERIOD};
pub use error::RconError;
pub use manager::{ConnectionManager, ReconnectPolicy};
