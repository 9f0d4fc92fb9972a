//! Error types for the console subsystem.

use bastion_events::ServerId;
use std::time::Duration;

/// Errors surfaced by the codec, connection and manager layers.
#[derive(Debug, thiserror::Error)]
pub enum RconError {
    /// Transport-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on the wire.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The server rejected the console password.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The connection is closed; the command was not sent.
    #[error("Connection is disconnected")]
    Disconnected,

    /// No response sentinel within the per-command timeout.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// Reconnect refused by backoff gating; retry after the given wait.
    #[error("Reconnect gated by backoff, retry after {wait:?}")]
    RetryAfter { wait: Duration },

    /// No registry entry for the server.
    #[error("No console connection registered for server {0}")]
    ServerNotFound(ServerId),

    /// A manual disconnect is sticky until an explicit connect.
    #[error("Server {0} was disconnected by user request")]
    UserDisconnected(ServerId),
}
