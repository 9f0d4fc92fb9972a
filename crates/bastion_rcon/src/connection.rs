//! # Authenticated Console Connection
//!
//! One [`RconConnection`] per live server. The connection owns a single I/O
//! task that serializes all wire activity: commands are submitted over a
//! channel, written as the `[EXEC, EMPTY]` frame pair, and answered once the
//! empty-marker sentinel echoes back. A one-permit semaphore in
//! [`RconConnection::execute`] guarantees at most one command is in flight
//! per connection, which is what makes responses attributable at all.
//!
//! Server-initiated `ServerData` frames are demuxed into typed events and
//! published, including while a command response is being assembled.
//!
//! On socket error or EOF the connection marks itself disconnected, publishes
//! a `CONNECTION_CLOSED` event, and goes quiet. It never reconnects itself;
//! the [`crate::manager::ConnectionManager`] owns backoff so retry pacing is
//! centralized.

use crate::codec::{FrameDecoder, Packet, PacketType, AUTH_ID, EMPTY_ID, EXEC_ID};
use crate::demux::demux_notification;
use crate::error::RconError;
use bastion_events::{
    ConnectionClosedPayload, EventBus, EventSource, EventType, NormalizedEvent, ServerId,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-command response timeout.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Keepalive ticker period while connected.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);
/// Timeout for the authentication exchange.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// No-op command dispatched by the keepalive ticker.
const KEEPALIVE_COMMAND: &str = "PING";

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn store(&self, state: ConnectionState) -> ConnectionState {
        match self.0.swap(state as u8, Ordering::AcqRel) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Authenticating,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

struct CommandRequest {
    command: String,
    reply: oneshot::Sender<Result<String, RconError>>,
}

/// A live, authenticated console session.
pub struct RconConnection {
    server_id: ServerId,
    state: Arc<StateCell>,
    exec_permit: Semaphore,
    cmd_tx: mpsc::Sender<CommandRequest>,
    cancel: CancellationToken,
    bus: Arc<EventBus>,
    last_used: std::sync::Mutex<Instant>,
}

impl std::fmt::Debug for RconConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconConnection")
            .field("server_id", &self.server_id)
            .field("state", &self.state.load())
            .finish()
    }
}

impl RconConnection {
    /// Dials nothing: takes an already-established transport, performs the
    /// authentication exchange, and spawns the I/O and keepalive tasks.
    ///
    /// Returns an error (and consumes the transport) if authentication is
    /// rejected or times out.
    pub async fn spawn<T>(
        server_id: ServerId,
        transport: T,
        password: &str,
        bus: Arc<EventBus>,
        parent_cancel: &CancellationToken,
    ) -> Result<Arc<Self>, RconError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let state = Arc::new(StateCell::new(ConnectionState::Connecting));
        let (mut read_half, mut write_half) = tokio::io::split(transport);
        let mut decoder = FrameDecoder::new();

        state.store(ConnectionState::Authenticating);
        write_half.write_all(&Packet::auth(password).encode()).await?;

        authenticate(&mut read_half, &mut decoder).await?;
        state.store(ConnectionState::Connected);
        info!("🔐 Console session authenticated for server {server_id}");

        let cancel = parent_cancel.child_token();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let connection = Arc::new(Self {
            server_id,
            state: Arc::clone(&state),
            exec_permit: Semaphore::new(1),
            cmd_tx,
            cancel: cancel.clone(),
            bus: Arc::clone(&bus),
            last_used: std::sync::Mutex::new(Instant::now()),
        });

        let io = IoTask {
            server_id,
            read_half,
            write_half,
            decoder,
            cmd_rx,
            bus,
            state,
            cancel: cancel.clone(),
        };
        tokio::spawn(io.run());

        let keepalive_conn = Arc::clone(&connection);
        tokio::spawn(async move {
            keepalive_conn.keepalive_loop().await;
        });

        Ok(connection)
    }

    /// The server this session belongs to.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// True while the session is usable.
    pub fn is_connected(&self) -> bool {
        self.state.load() == ConnectionState::Connected
    }

    /// Instant of the most recent `execute` call.
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Executes one console command and returns its reply.
    ///
    /// Commands are serialized per connection: a one-permit semaphore admits
    /// a single caller at a time, so for commands A then B, A's reply is
    /// observed before B's send. Blocks until the response sentinel or the
    /// 30s timeout; returns [`RconError::Disconnected`] if the socket is
    /// dead.
    pub async fn execute(&self, command: &str) -> Result<String, RconError> {
        if !self.is_connected() {
            return Err(RconError::Disconnected);
        }
        let _permit = self
            .exec_permit
            .acquire()
            .await
            .map_err(|_| RconError::Disconnected)?;
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Instant::now();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandRequest {
                command: command.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| RconError::Disconnected)?;
        reply_rx.await.map_err(|_| RconError::Disconnected)?
    }

    /// Closes the session. Idempotent: cancels the I/O task, transitions to
    /// `Disconnected`, and fails any in-flight command.
    pub fn close(&self) {
        if self.state.store(ConnectionState::Disconnected) != ConnectionState::Disconnected {
            debug!("Closing console session for server {}", self.server_id);
        }
        self.cancel.cancel();
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the initial
        // keepalive lands one period after connect.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_connected() {
                break;
            }
            if let Err(e) = self.execute(KEEPALIVE_COMMAND).await {
                warn!(
                    "Keepalive failed for server {}: {e} - marking disconnected",
                    self.server_id
                );
                mark_disconnected(
                    &self.state,
                    &self.bus,
                    self.server_id,
                    &self.cancel,
                    "keepalive failure",
                );
                break;
            }
        }
    }
}

/// Transitions to `Disconnected` exactly once, publishing the
/// `CONNECTION_CLOSED` lifecycle event and cancelling the session tasks.
fn mark_disconnected(
    state: &StateCell,
    bus: &EventBus,
    server_id: ServerId,
    cancel: &CancellationToken,
    reason: &str,
) {
    if state.store(ConnectionState::Disconnected) != ConnectionState::Disconnected {
        warn!("Console session for server {server_id} closed: {reason}");
        if let Ok(event) = NormalizedEvent::from_payload(
            server_id,
            EventSource::Rcon,
            EventType::ConnectionClosed,
            &ConnectionClosedPayload {
                reason: reason.to_string(),
            },
            None,
        ) {
            bus.publish(event);
        }
    }
    cancel.cancel();
}

async fn authenticate<R: AsyncRead + Unpin>(
    read_half: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<(), RconError> {
    let deadline = Instant::now() + AUTH_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(RconError::Timeout(AUTH_TIMEOUT))?;
        let frame = tokio::time::timeout(remaining, next_frame(read_half, decoder))
            .await
            .map_err(|_| RconError::Timeout(AUTH_TIMEOUT))??;
        // Servers send an empty Response frame ahead of the auth verdict;
        // the verdict itself comes back as an exec-command-typed frame whose
        // id is the auth id on success or -1 on rejection.
        match frame.ptype {
            PacketType::ExecCommand | PacketType::Auth => {
                if frame.id == AUTH_ID {
                    return Ok(());
                }
                return Err(RconError::AuthenticationFailed);
            }
            _ => continue,
        }
    }
}

async fn next_frame<R: AsyncRead + Unpin>(
    read_half: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Packet, RconError> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        let n = read_half.read(&mut buf).await?;
        if n == 0 {
            return Err(RconError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "console peer closed the connection",
            )));
        }
        decoder.extend(&buf[..n]);
    }
}

struct IoTask<T> {
    server_id: ServerId,
    read_half: ReadHalf<T>,
    write_half: WriteHalf<T>,
    decoder: FrameDecoder,
    cmd_rx: mpsc::Receiver<CommandRequest>,
    bus: Arc<EventBus>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IoTask<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = self.cmd_rx.recv() => {
                    let Some(request) = request else { break };
                    if let Err(e) = self.handle_command(request).await {
                        mark_disconnected(&self.state, &self.bus, self.server_id, &self.cancel, &e.to_string());
                        break;
                    }
                }
                frame = next_frame(&mut self.read_half, &mut self.decoder) => {
                    match frame {
                        Ok(frame) => self.handle_idle_frame(frame),
                        Err(e) => {
                            mark_disconnected(&self.state, &self.bus, self.server_id, &self.cancel, &e.to_string());
                            break;
                        }
                    }
                }
            }
        }
        debug!("Console I/O task for server {} exited", self.server_id);
    }

    /// Writes the `[EXEC, EMPTY]` pair and assembles the response until the
    /// empty-marker sentinel. Interleaved notifications are demuxed rather
    /// than discarded. Returns `Err` only for socket-level failures; command
    /// timeouts are reported to the caller and leave the session up.
    async fn handle_command(&mut self, request: CommandRequest) -> Result<(), RconError> {
        let write_result: Result<(), RconError> = async {
            self.write_half
                .write_all(&Packet::exec(&request.command).encode())
                .await?;
            self.write_half
                .write_all(&Packet::empty_marker().encode())
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = write_result {
            let _ = request.reply.send(Err(RconError::Disconnected));
            return Err(e);
        }

        let deadline = Instant::now() + COMMAND_TIMEOUT;
        let mut accumulated = String::new();
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                let _ = request.reply.send(Err(RconError::Timeout(COMMAND_TIMEOUT)));
                return Ok(());
            };
            let frame =
                match tokio::time::timeout(remaining, next_frame(&mut self.read_half, &mut self.decoder))
                    .await
                {
                    Err(_) => {
                        let _ = request.reply.send(Err(RconError::Timeout(COMMAND_TIMEOUT)));
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        let _ = request.reply.send(Err(RconError::Disconnected));
                        return Err(e);
                    }
                    Ok(Ok(frame)) => frame,
                };

            match frame.ptype {
                PacketType::Response if frame.id == EMPTY_ID => {
                    // Sentinel: everything accumulated since the previous
                    // sentinel is this command's reply.
                    let _ = request.reply.send(Ok(accumulated));
                    return Ok(());
                }
                PacketType::Response if frame.id == EXEC_ID => {
                    accumulated.push_str(&frame.body);
                }
                PacketType::ServerData => {
                    self.publish_notification(&frame.body);
                }
                _ => {
                    debug!(
                        "Ignoring unexpected frame (id={}, type={:?}) during command response",
                        frame.id, frame.ptype
                    );
                }
            }
        }
    }

    fn handle_idle_frame(&self, frame: Packet) {
        match frame.ptype {
            PacketType::ServerData => self.publish_notification(&frame.body),
            // Stale response frames can arrive after a command timed out.
            _ => debug!(
                "Discarding stale frame (id={}, type={:?}) outside a command",
                frame.id, frame.ptype
            ),
        }
    }

    fn publish_notification(&self, body: &str) {
        for event in demux_notification(self.server_id, body) {
            self.bus.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Packet;
    use tokio::io::DuplexStream;

    /// Drives the server side of the auth exchange on a duplex pipe.
    async fn accept_auth(server: &mut DuplexStream) {
        let mut decoder = FrameDecoder::new();
        let auth = next_frame(server, &mut decoder).await.unwrap();
        assert_eq!(auth.ptype, PacketType::Auth);
        assert_eq!(auth.id, AUTH_ID);
        // Empty response frame first, then the verdict, as real servers do.
        let pre = Packet {
            id: auth.id,
            ptype: PacketType::Response,
            body: String::new(),
        };
        server.write_all(&pre.encode()).await.unwrap();
        let verdict = Packet {
            id: auth.id,
            ptype: PacketType::ExecCommand,
            body: String::new(),
        };
        server.write_all(&verdict.encode()).await.unwrap();
    }

    async fn connect_pair() -> (Arc<RconConnection>, DuplexStream, Arc<EventBus>) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(async move {
            accept_auth(&mut server).await;
            server
        });
        let connection = RconConnection::spawn(
            ServerId::new(),
            client,
            "hunter2",
            Arc::clone(&bus),
            &cancel,
        )
        .await
        .unwrap();
        let server = server_task.await.unwrap();
        (connection, server, bus)
    }

    #[tokio::test]
    async fn execute_round_trip_assembles_split_response() {
        let (connection, mut server, _bus) = connect_pair().await;

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let exec = next_frame(&mut server, &mut decoder).await.unwrap();
            assert_eq!(exec.id, EXEC_ID);
            assert_eq!(exec.body, "ShowCurrentMap");
            let marker = next_frame(&mut server, &mut decoder).await.unwrap();
            assert_eq!(marker.id, EMPTY_ID);

            // Response split across two frames, then the sentinel.
            for chunk in ["Current level is Narva, layer is Narva_AAS_v1", ", factions RUS USA"] {
                let frame = Packet {
                    id: EXEC_ID,
                    ptype: PacketType::Response,
                    body: chunk.to_string(),
                };
                server.write_all(&frame.encode()).await.unwrap();
            }
            let sentinel = Packet {
                id: EMPTY_ID,
                ptype: PacketType::Response,
                body: String::new(),
            };
            server.write_all(&sentinel.encode()).await.unwrap();
            server
        });

        let reply = connection.execute("ShowCurrentMap").await.unwrap();
        assert_eq!(
            reply,
            "Current level is Narva, layer is Narva_AAS_v1, factions RUS USA"
        );
        drop(server_task.await.unwrap());
        connection.close();
    }

    #[tokio::test]
    async fn notifications_interleaved_with_a_response_are_published() {
        let (connection, mut server, bus) = connect_pair().await;
        let mut sub = bus.subscribe(None);

        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let _exec = next_frame(&mut server, &mut decoder).await.unwrap();
            let _marker = next_frame(&mut server, &mut decoder).await.unwrap();

            let chat = Packet {
                id: 0,
                ptype: PacketType::ServerData,
                body: "[ChatAll] [Online IDs:EOS: 000251073bd6429fb4b0ef2e5a5f21da steam: 76561198000000001] Alice : hi".to_string(),
            };
            server.write_all(&chat.encode()).await.unwrap();

            let body = Packet {
                id: EXEC_ID,
                ptype: PacketType::Response,
                body: "ok".to_string(),
            };
            server.write_all(&body.encode()).await.unwrap();
            let sentinel = Packet {
                id: EMPTY_ID,
                ptype: PacketType::Response,
                body: String::new(),
            };
            server.write_all(&sentinel.encode()).await.unwrap();
            server
        });

        let reply = connection.execute("ListPlayers").await.unwrap();
        assert_eq!(reply, "ok");
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ChatMessage);
        drop(server_task.await.unwrap());
        connection.close();
    }

    #[tokio::test]
    async fn peer_close_marks_disconnected_and_publishes_lifecycle_event() {
        let (connection, server, bus) = connect_pair().await;
        let mut sub = bus.subscribe(Some([EventType::ConnectionClosed].into_iter().collect()));

        drop(server);
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::ConnectionClosed);

        // State settles to Disconnected and execute refuses.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.execute("anything").await,
            Err(RconError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn wrong_password_fails_authentication() {
        let (client, mut server) = tokio::io::duplex(4096);
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let _auth = next_frame(&mut server, &mut decoder).await.unwrap();
            let verdict = Packet {
                id: -1,
                ptype: PacketType::ExecCommand,
                body: String::new(),
            };
            server.write_all(&verdict.encode()).await.unwrap();
            server
        });

        let result =
            RconConnection::spawn(ServerId::new(), client, "wrong", bus, &cancel).await;
        assert!(matches!(result, Err(RconError::AuthenticationFailed)));
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connection, _server, _bus) = connect_pair().await;
        connection.close();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
