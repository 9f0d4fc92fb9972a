//! # Console Connection Manager
//!
//! Registry of console sessions keyed by server id. All reconnect pacing
//! lives here, not on the connections: each registry entry carries its
//! attempt counter and last-attempt instant, so `connect` can refuse
//! too-early retries with an explicit retry-after error and tests can drive
//! the gating directly.
//!
//! Backoff: `delay(n) = min(base * 2^(n-1), cap)` with base 5s and cap 60s.
//! A successful connect zeroes the counter. A `force` disconnect sets a
//! sticky user-requested flag that suppresses the automatic reconnect loop
//! until the next explicit `connect` call.

use crate::connection::RconConnection;
use crate::error::RconError;
use bastion_events::{EventBus, ServerId, ServerRecord, Subscription, SubscriptionId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP dial timeout for new console sessions.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Scan period of the automatic reconnect loop.
const RECONNECT_SCAN_PERIOD: Duration = Duration::from_secs(5);

/// Exponential backoff parameters for reconnect gating.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Required wait before attempt `n + 1`, given `n` consecutive failures.
    /// Zero failures means no wait; the delay doubles per failure up to the
    /// cap and is monotonic until capped.
    pub fn delay_for_attempts(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }
}

struct ConnectionEntry {
    endpoint: String,
    password: String,
    connection: Option<Arc<RconConnection>>,
    /// Sticky flag set by a forced disconnect; cleared by explicit connect.
    user_disconnected: bool,
    reconnect_attempts: u32,
    last_reconnect_at: Option<Instant>,
    last_used: Instant,
}

impl ConnectionEntry {
    fn new(endpoint: String, password: String) -> Self {
        Self {
            endpoint,
            password,
            connection: None,
            user_disconnected: false,
            reconnect_attempts: 0,
            last_reconnect_at: None,
            last_used: Instant::now(),
        }
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }
}

/// The per-server console session registry.
///
/// Entries are guarded by a per-server async mutex so connect attempts for
/// one server are single-flight; the registry map itself is never held
/// across network I/O.
pub struct ConnectionManager {
    entries: DashMap<ServerId, Arc<Mutex<ConnectionEntry>>>,
    bus: Arc<EventBus>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager with the default backoff policy.
    pub fn new() -> Self {
        Self::with_policy(ReconnectPolicy::default())
    }

    /// Creates a manager with an explicit backoff policy (tests shrink the
    /// base to avoid real waits).
    pub fn with_policy(policy: ReconnectPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            bus: Arc::new(EventBus::new()),
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// The bus carrying console events from every managed connection.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Subscribes to console events from all servers. Bounded channel
    /// (capacity 100); a full subscriber loses events with a counted drop.
    pub fn subscribe_events(&self) -> Subscription {
        self.bus.subscribe(None)
    }

    /// Removes a subscription registered with [`Self::subscribe_events`].
    pub fn unsubscribe_events(&self, id: SubscriptionId) {
        self.bus.unsubscribe(id);
    }

    /// Explicitly connects (or reconnects) a server's console session.
    ///
    /// - No entry: dial, authenticate, register.
    /// - Live entry: bump last-used and return.
    /// - Disconnected entry: apply backoff gating; refuse with
    ///   [`RconError::RetryAfter`] when called before the required delay has
    ///   elapsed; otherwise attempt, incrementing the counter. Success zeroes
    ///   the counter.
    ///
    /// An explicit call always clears the sticky user-disconnect flag.
    pub async fn connect(
        &self,
        server_id: ServerId,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<(), RconError> {
        let endpoint = format!("{host}:{port}");
        let entry = self
            .entries
            .entry(server_id)
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionEntry::new(endpoint.clone(), password.to_string()))))
            .clone();

        let mut entry = entry.lock().await;
        entry.user_disconnected = false;
        entry.endpoint = endpoint;
        entry.password = password.to_string();
        self.connect_locked(server_id, &mut entry).await
    }

    /// Reconnect path used by the automatic loop: honors the sticky
    /// user-disconnect flag instead of clearing it.
    async fn auto_reconnect(&self, server_id: ServerId) -> Result<(), RconError> {
        let entry = self
            .entries
            .get(&server_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(RconError::ServerNotFound(server_id))?;
        let mut entry = entry.lock().await;
        if entry.user_disconnected {
            return Err(RconError::UserDisconnected(server_id));
        }
        self.connect_locked(server_id, &mut entry).await
    }

    async fn connect_locked(
        &self,
        server_id: ServerId,
        entry: &mut ConnectionEntry,
    ) -> Result<(), RconError> {
        if entry.is_connected() {
            entry.last_used = Instant::now();
            return Ok(());
        }

        // Backoff gating: the counter lives on the entry, so the refusal and
        // its retry-after are computable without any timer state.
        if entry.reconnect_attempts > 0 {
            let required = self.policy.delay_for_attempts(entry.reconnect_attempts);
            if let Some(at) = entry.last_reconnect_at {
                let elapsed = at.elapsed();
                if elapsed < required {
                    return Err(RconError::RetryAfter {
                        wait: required - elapsed,
                    });
                }
            }
        }

        entry.reconnect_attempts += 1;
        entry.last_reconnect_at = Some(Instant::now());

        let attempt = entry.reconnect_attempts;
        debug!(
            "Dialing console for server {server_id} at {} (attempt {attempt})",
            entry.endpoint
        );
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&entry.endpoint))
            .await
            .map_err(|_| RconError::Timeout(DIAL_TIMEOUT))??;
        stream.set_nodelay(true)?;

        let connection = RconConnection::spawn(
            server_id,
            stream,
            &entry.password,
            Arc::clone(&self.bus),
            &self.cancel,
        )
        .await?;

        entry.connection = Some(connection);
        entry.reconnect_attempts = 0;
        entry.last_used = Instant::now();
        info!("✅ Console session established for server {server_id}");
        Ok(())
    }

    /// Marks a server disconnected and closes its session.
    ///
    /// `force` additionally sets the sticky user-requested flag, suppressing
    /// automatic reconnection until the next explicit [`Self::connect`].
    pub async fn disconnect(&self, server_id: ServerId, force: bool) -> Result<(), RconError> {
        let entry = self
            .entries
            .get(&server_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(RconError::ServerNotFound(server_id))?;
        let mut entry = entry.lock().await;
        if let Some(connection) = entry.connection.take() {
            connection.close();
        }
        if force {
            entry.user_disconnected = true;
        }
        info!("Console session for server {server_id} disconnected (force={force})");
        Ok(())
    }

    /// Executes a command on a server's console session.
    ///
    /// Fails with [`RconError::ServerNotFound`] for unknown servers and
    /// [`RconError::Disconnected`] for registered-but-dead sessions. The
    /// registry lock is released before any wire I/O.
    pub async fn execute(&self, server_id: ServerId, command: &str) -> Result<String, RconError> {
        let entry = self
            .entries
            .get(&server_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(RconError::ServerNotFound(server_id))?;
        let connection = {
            let mut entry = entry.lock().await;
            let connection = entry
                .connection
                .as_ref()
                .filter(|c| c.is_connected())
                .cloned()
                .ok_or(RconError::Disconnected)?;
            entry.last_used = Instant::now();
            connection
        };
        connection.execute(command).await
    }

    /// Connects every server from the persisted list concurrently. Failures
    /// are logged and do not abort the batch. Returns the success count.
    pub async fn boot_from_store(&self, servers: &[ServerRecord]) -> usize {
        let attempts = servers.iter().map(|server| {
            let server = server.clone();
            async move {
                match self
                    .connect(server.id, &server.host, server.rcon_port, &server.rcon_password)
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        error!("❌ Console bring-up failed for {} ({}): {e}", server.name, server.id);
                        false
                    }
                }
            }
        });
        let results = futures::future::join_all(attempts).await;
        let connected = results.iter().filter(|ok| **ok).count();
        info!(
            "🎮 Console bring-up complete: {connected}/{} servers connected",
            servers.len()
        );
        connected
    }

    /// Spawns the automatic reconnect loop. Scans every 5s for disconnected
    /// entries (unless user-disconnected) and retries them through the same
    /// backoff gating as explicit connects.
    pub fn start_reconnect_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONNECT_SCAN_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let server_ids: Vec<ServerId> =
                    manager.entries.iter().map(|e| *e.key()).collect();
                for server_id in server_ids {
                    match manager.auto_reconnect(server_id).await {
                        Ok(()) => {}
                        Err(RconError::RetryAfter { .. })
                        | Err(RconError::UserDisconnected(_)) => {}
                        Err(e) => {
                            warn!("Reconnect attempt for server {server_id} failed: {e}");
                        }
                    }
                }
            }
            debug!("Reconnect loop exited");
        });
    }

    /// True if the server has a live console session.
    pub async fn is_connected(&self, server_id: ServerId) -> bool {
        match self.entries.get(&server_id).map(|e| Arc::clone(e.value())) {
            Some(entry) => entry.lock().await.is_connected(),
            None => false,
        }
    }

    /// Number of registered servers.
    pub fn server_count(&self) -> usize {
        self.entries.len()
    }

    /// Cancels the root context, closes every session, and clears the
    /// registry. Subscribers drain whatever was already delivered.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down {} console sessions", self.entries.len());
        self.cancel.cancel();
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let mut entry = entry.lock().await;
            if let Some(connection) = entry.connection.take() {
                connection.close();
            }
        }
        self.entries.clear();
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_double_until_the_cap() {
        let policy = ReconnectPolicy::default();
        let secs: Vec<u64> = (0..=7)
            .map(|n| policy.delay_for_attempts(n).as_secs())
            .collect();
        assert_eq!(secs, vec![0, 5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn backoff_is_monotonic_until_capped() {
        let policy = ReconnectPolicy::default();
        let mut prev = Duration::ZERO;
        for n in 1..=40 {
            let d = policy.delay_for_attempts(n);
            assert!(d >= prev);
            assert!(d <= policy.cap);
            prev = d;
        }
    }

    #[tokio::test]
    async fn execute_on_unknown_server_fails() {
        let manager = ConnectionManager::new();
        let result = manager.execute(ServerId::new(), "ListPlayers").await;
        assert!(matches!(result, Err(RconError::ServerNotFound(_))));
    }

    #[tokio::test]
    async fn failed_connect_arms_backoff_gating() {
        let manager = ConnectionManager::new();
        let server_id = ServerId::new();

        // Nothing listens on port 1; the dial fails fast with a refusal.
        let first = manager.connect(server_id, "127.0.0.1", 1, "pw").await;
        assert!(first.is_err());
        assert!(!matches!(first, Err(RconError::RetryAfter { .. })));

        // The immediate retry is refused by gating with a retry-after wait
        // bounded by delay(1) = 5s.
        let second = manager.connect(server_id, "127.0.0.1", 1, "pw").await;
        match second {
            Err(RconError::RetryAfter { wait }) => {
                assert!(wait <= Duration::from_secs(5));
                assert!(wait > Duration::ZERO);
            }
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_disconnect_suppresses_auto_reconnect() {
        let manager = ConnectionManager::with_policy(ReconnectPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        });
        let server_id = ServerId::new();
        let _ = manager.connect(server_id, "127.0.0.1", 1, "pw").await;

        manager.disconnect(server_id, true).await.unwrap();
        let result = manager.auto_reconnect(server_id).await;
        assert!(matches!(result, Err(RconError::UserDisconnected(_))));
    }

    #[tokio::test]
    async fn disconnect_on_unknown_server_fails() {
        let manager = ConnectionManager::new();
        let result = manager.disconnect(ServerId::new(), false).await;
        assert!(matches!(result, Err(RconError::ServerNotFound(_))));
    }
}
