//! The per-server streaming client.

use crate::records::{parse_record, LogWatchError};
use bastion_events::{EventBus, ServerId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed delay between reconnect attempts. The upstream agent tolerates
/// frequent reconnects, so there is no backoff beyond this constant.
pub const LOG_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection settings for one server's log-watcher agent.
#[derive(Debug, Clone)]
pub struct LogWatcherConfig {
    /// `host:port` of the agent.
    pub endpoint: String,
    /// Bearer token presented in the hello line.
    pub token: String,
}

#[derive(Serialize)]
struct Hello<'a> {
    token: &'a str,
}

/// A log-watcher client bound to one server.
///
/// [`LogWatcherClient::spawn`] starts the connect/stream/reconnect loop on a
/// background task tied to the given cancellation token. Every parsed record
/// is published to the bus in stream order.
pub struct LogWatcherClient {
    server_id: ServerId,
    config: LogWatcherConfig,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl LogWatcherClient {
    /// Spawns the streaming loop for one server. Returns the child token so
    /// callers can stop this client without tearing down its siblings.
    pub fn spawn(
        server_id: ServerId,
        config: LogWatcherConfig,
        bus: Arc<EventBus>,
        parent_cancel: &CancellationToken,
    ) -> CancellationToken {
        let cancel = parent_cancel.child_token();
        let client = Self {
            server_id,
            config,
            bus,
            cancel: cancel.clone(),
        };
        tokio::spawn(client.run());
        cancel
    }

    async fn run(self) {
        info!(
            "📜 Log watcher for server {} streaming from {}",
            self.server_id, self.config.endpoint
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.connect_and_stream() => outcome,
            };
            match outcome {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "Log stream for server {} failed: {e}; reconnecting in {:?}",
                        self.server_id, LOG_RECONNECT_DELAY
                    );
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(LOG_RECONNECT_DELAY) => {}
            }
        }
        debug!("Log watcher for server {} exited", self.server_id);
    }

    async fn connect_and_stream(&self) -> Result<(), LogWatchError> {
        let stream = TcpStream::connect(&self.config.endpoint).await?;
        self.stream_records(stream).await
    }

    /// Sends the token hello and publishes records until the stream ends.
    /// Generic over the transport so tests can drive it with an in-memory
    /// pipe.
    async fn stream_records<T>(&self, transport: T) -> Result<(), LogWatchError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(transport);

        let mut hello = serde_json::to_vec(&Hello {
            token: &self.config.token,
        })?;
        hello.push(b'\n');
        write_half.write_all(&hello).await?;

        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_record(self.server_id, &line) {
                Ok(event) => {
                    self.bus.publish(event);
                }
                Err(e) => {
                    warn!(
                        "Discarding malformed log record for server {}: {e}",
                        self.server_id
                    );
                }
            }
        }
        Err(LogWatchError::StreamClosed)
    }
}
