// Push-channel connection manager.
//
// Owns the single authenticated channel to the server: opens it with the
// current credential, republishes its frames as typed events, pings it with
// heartbeats and reopens it after drops. The loop runs as one tokio task per
// `connect`; `disconnect` (or a new `connect`) cancels and awaits it.
//
// Transport is abstracted via `ChannelConnector` for testability. The
// tokio-tungstenite implementation lives in `ws.rs`.

pub mod heartbeat;
pub mod transport;
pub mod ws;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use workshop_sync_common::protocol::push::{InboundEvent, OutboundEvent};

use crate::auth::Credential;
use crate::config::{ConfigError, SyncConfig};
use crate::store::SessionStore;

use heartbeat::{HeartbeatAction, HeartbeatMonitor};
pub use transport::{ChannelConnection, ChannelConnector, TransportError};

const EVENT_BUFFER: usize = 256;

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters. Retries never give up; only the delay is capped.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(250), max_delay: Duration::from_secs(30) }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `failures` (1-based): base, 2x base, 4x base,
    /// ... capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(7);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub endpoint: Url,
    pub heartbeat_interval: Duration,
    pub missed_heartbeat_limit: u32,
    pub reconnect: ReconnectPolicy,
}

impl ChannelSettings {
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: config.ws_url()?,
            heartbeat_interval: config.channel.heartbeat_interval(),
            missed_heartbeat_limit: config.channel.missed_heartbeat_limit,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(config.channel.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(config.channel.reconnect_max_delay_ms),
            },
        })
    }
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Point-in-time view of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected_at: None,
            missed_heartbeats: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the channel on purpose.
    ServerClosed,
    /// `disconnect()` or a replacing `connect()`.
    ClientClosed,
    HeartbeatTimeout,
    Transport(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerClosed => "io server disconnect",
            Self::ClientClosed => "io client disconnect",
            Self::HeartbeatTimeout => "ping timeout",
            Self::Transport(_) => "transport error",
        }
    }

    /// Whether the next attempt skips the backoff delay.
    pub fn reconnects_immediately(&self) -> bool {
        matches!(self, Self::ServerClosed | Self::HeartbeatTimeout)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(message) => write!(f, "transport error: {message}"),
            other => f.write_str(other.as_str()),
        }
    }
}

// ── Channel events ──────────────────────────────────────────────────

/// Lifecycle transitions plus every decoded push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    ConnectError { message: String },
    /// The server rejected the credential; the manager has stopped.
    Unauthenticated,
    Push(InboundEvent),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("push channel is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("heartbeat unanswered, channel is being reopened")]
    HeartbeatTimeout,
}

enum LoopCommand {
    Emit { event: OutboundEvent, reply: oneshot::Sender<Result<(), ChannelError>> },
    Heartbeat { reply: oneshot::Sender<Result<(), ChannelError>> },
}

impl LoopCommand {
    fn reject(self) {
        let reply = match self {
            Self::Emit { reply, .. } | Self::Heartbeat { reply } => reply,
        };
        let _ = reply.send(Err(ChannelError::NotConnected));
    }
}

// ── Connection manager ──────────────────────────────────────────────

pub struct ConnectionManager<C: ChannelConnector> {
    shared: Arc<Shared<C>>,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<LoopCommand>,
}

struct Shared<C: ChannelConnector> {
    connector: C,
    settings: ChannelSettings,
    store: Arc<dyn SessionStore>,
    credential: StdMutex<Option<Credential>>,
    status_tx: watch::Sender<ConnectionSnapshot>,
    events_tx: broadcast::Sender<ChannelEvent>,
}

impl<C: ChannelConnector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ChannelSettings, store: Arc<dyn SessionStore>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionSnapshot::default());
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                store,
                credential: StdMutex::new(None),
                status_tx,
                events_tx,
            }),
            running: Mutex::new(None),
        }
    }

    /// Open the channel with `credential`, replacing any existing one.
    pub async fn connect(&self, credential: Credential) {
        let mut running = self.running.lock().await;
        self.teardown(&mut running).await;

        *self.shared.lock_credential() = Some(credential);
        let cancel = CancellationToken::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_channel(self.shared.clone(), cancel.clone(), commands_rx));
        *running = Some(RunningLoop { task, cancel, commands });
    }

    /// Close the channel and stop reconnecting.
    pub async fn disconnect(&self) {
        let mut running = self.running.lock().await;
        self.teardown(&mut running).await;
    }

    /// Swap the credential used by the next (re)connect without dropping the
    /// open channel.
    pub fn update_credential(&self, credential: Credential) {
        *self.shared.lock_credential() = Some(credential);
    }

    pub fn on_status_change(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.status_tx.borrow().clone()
    }

    /// Send one event. Nothing is queued while the channel is down.
    pub async fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        self.request(|reply| LoopCommand::Emit { event, reply }).await
    }

    /// Ping the channel now instead of waiting for the next tick.
    pub async fn send_heartbeat(&self) -> Result<(), ChannelError> {
        self.request(|reply| LoopCommand::Heartbeat { reply }).await
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), ChannelError>>) -> LoopCommand,
    ) -> Result<(), ChannelError> {
        if self.snapshot().status != ConnectionStatus::Connected {
            return Err(ChannelError::NotConnected);
        }
        let commands = match self.running.lock().await.as_ref() {
            Some(running) => running.commands.clone(),
            None => return Err(ChannelError::NotConnected),
        };
        let (reply, response) = oneshot::channel();
        commands.send(build(reply)).map_err(|_| ChannelError::NotConnected)?;
        response.await.unwrap_or(Err(ChannelError::NotConnected))
    }

    async fn teardown(&self, running: &mut Option<RunningLoop>) {
        let Some(active) = running.take() else {
            return;
        };
        active.cancel.cancel();
        let _ = active.task.await;

        let was_connected = self.snapshot().status == ConnectionStatus::Connected;
        self.shared.set_status(ConnectionStatus::Disconnected);
        if was_connected {
            info!(reason = DisconnectReason::ClientClosed.as_str(), "push channel closed");
            self.shared
                .publish(ChannelEvent::Disconnected { reason: DisconnectReason::ClientClosed });
        }
    }
}

impl<C: ChannelConnector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(active) = self.running.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

impl<C: ChannelConnector> Shared<C> {
    fn lock_credential(&self) -> std::sync::MutexGuard<'_, Option<Credential>> {
        self.credential.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn token(&self) -> Option<String> {
        self.lock_credential().as_ref().map(|credential| credential.token.clone())
    }

    fn forget_credential(&self) {
        *self.lock_credential() = None;
        if let Err(error) = self.store.clear_credential() {
            warn!(error = %error, "failed to clear stored credential");
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_if_modified(|snapshot| {
            let changed = snapshot.status != status;
            snapshot.status = status;
            changed
        });
    }

    fn mark_connected(&self) {
        self.status_tx.send_modify(|snapshot| {
            snapshot.status = ConnectionStatus::Connected;
            snapshot.last_connected_at = Some(Utc::now());
            snapshot.missed_heartbeats = 0;
        });
    }

    fn set_missed(&self, missed: u32) {
        self.status_tx.send_if_modified(|snapshot| {
            let changed = snapshot.missed_heartbeats != missed;
            snapshot.missed_heartbeats = missed;
            changed
        });
    }

    fn publish(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn dispatch(&self, frame: &str, monitor: &mut HeartbeatMonitor) {
        match InboundEvent::decode(frame) {
            Ok(InboundEvent::Pong) => {
                monitor.on_ack();
                self.set_missed(0);
            }
            Ok(event) => {
                debug!(event = %event.name(), "push event");
                self.publish(ChannelEvent::Push(event));
            }
            Err(error) => warn!(error = %error, "rejected push frame"),
        }
    }
}

// ── Channel loop ────────────────────────────────────────────────────

async fn run_channel<C: ChannelConnector>(
    shared: Arc<Shared<C>>,
    cancel: CancellationToken,
    mut commands: mpsc::UnboundedReceiver<LoopCommand>,
) {
    let mut failures: u32 = 0;

    loop {
        let Some(token) = shared.token() else {
            debug!("no credential, push channel loop stopping");
            shared.set_status(ConnectionStatus::Disconnected);
            return;
        };

        shared.set_status(ConnectionStatus::Connecting);
        let endpoint = &shared.settings.endpoint;
        debug!(endpoint = %endpoint, attempt = failures + 1, "opening push channel");
        let attempt = tokio::select! {
            result = shared.connector.connect(&shared.settings.endpoint, &token) => result,
            _ = cancel.cancelled() => return,
        };

        let delay = match attempt {
            Ok(mut conn) => {
                failures = 0;
                while let Ok(stale) = commands.try_recv() {
                    stale.reject();
                }
                shared.mark_connected();
                info!(status = ConnectionStatus::Connected.as_str(), "push channel open");
                shared.publish(ChannelEvent::Connected);

                let outcome = drive(&shared, &mut conn, &cancel, &mut commands).await;
                conn.close().await;
                let Some(reason) = outcome else {
                    return;
                };

                shared.set_status(ConnectionStatus::Disconnected);
                info!(reason = %reason, "push channel dropped");
                let immediate = reason.reconnects_immediately();
                shared.publish(ChannelEvent::Disconnected { reason });
                if immediate {
                    Duration::ZERO
                } else {
                    failures = failures.saturating_add(1);
                    shared.settings.reconnect.delay_for(failures)
                }
            }
            Err(TransportError::Unauthorized) => {
                warn!("push channel rejected the credential, clearing session");
                shared.forget_credential();
                shared.set_status(ConnectionStatus::Disconnected);
                shared.publish(ChannelEvent::Unauthenticated);
                return;
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                shared.set_status(ConnectionStatus::Disconnected);
                warn!(error = %error, attempt = failures, "push channel connect failed");
                shared.publish(ChannelEvent::ConnectError { message: error.to_string() });
                shared.settings.reconnect.delay_for(failures)
            }
        };

        if !delay.is_zero() {
            info!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "push channel reconnect scheduled"
            );
            if !wait_backoff(delay, &cancel, &mut commands).await {
                return;
            }
        }
    }
}

/// Sleep through a backoff delay, refusing commands meanwhile. Returns
/// `false` if cancelled.
async fn wait_backoff(
    delay: Duration,
    cancel: &CancellationToken,
    commands: &mut mpsc::UnboundedReceiver<LoopCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = cancel.cancelled() => return false,
            Some(command) = commands.recv() => command.reject(),
        }
    }
}

/// Pump one open connection. Returns `None` when cancelled, otherwise why the
/// connection ended.
async fn drive<C: ChannelConnector>(
    shared: &Shared<C>,
    conn: &mut C::Connection,
    cancel: &CancellationToken,
    commands: &mut mpsc::UnboundedReceiver<LoopCommand>,
) -> Option<DisconnectReason> {
    let interval = shared.settings.heartbeat_interval;
    let mut monitor = HeartbeatMonitor::new(shared.settings.missed_heartbeat_limit);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            frame = conn.recv() => match frame {
                Ok(Some(text)) => shared.dispatch(&text, &mut monitor),
                Ok(None) => return Some(DisconnectReason::ServerClosed),
                Err(error) => return Some(DisconnectReason::Transport(error.to_string())),
            },
            _ = ticker.tick() => {
                if let Err(reason) = heartbeat_tick(shared, conn, &mut monitor).await {
                    return Some(reason);
                }
            }
            command = commands.recv() => match command {
                Some(LoopCommand::Emit { event, reply }) => {
                    debug!(event = event.name(), "emit");
                    let result = conn.send(event.encode()).await;
                    let failure = result.as_ref().err().map(ToString::to_string);
                    let _ = reply.send(result.map_err(ChannelError::from));
                    if let Some(message) = failure {
                        return Some(DisconnectReason::Transport(message));
                    }
                }
                Some(LoopCommand::Heartbeat { reply }) => {
                    match heartbeat_tick(shared, conn, &mut monitor).await {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(reason) => {
                            let error = match &reason {
                                DisconnectReason::Transport(message) => {
                                    ChannelError::Transport(TransportError::Send(message.clone()))
                                }
                                _ => ChannelError::HeartbeatTimeout,
                            };
                            let _ = reply.send(Err(error));
                            return Some(reason);
                        }
                    }
                }
                None => return None,
            },
        }
    }
}

async fn heartbeat_tick<C: ChannelConnector>(
    shared: &Shared<C>,
    conn: &mut C::Connection,
    monitor: &mut HeartbeatMonitor,
) -> Result<(), DisconnectReason> {
    match monitor.on_tick() {
        HeartbeatAction::SendPing => {
            shared.set_missed(monitor.missed());
            let ping = OutboundEvent::Ping { timestamp: Utc::now().timestamp_millis() };
            conn.send(ping.encode())
                .await
                .map_err(|error| DisconnectReason::Transport(error.to_string()))
        }
        HeartbeatAction::ForceReconnect => {
            warn!(missed = monitor.missed(), "heartbeat unanswered, forcing reconnect");
            Err(DisconnectReason::HeartbeatTimeout)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::mock::{settings, MockConnector};
    use super::*;
    use crate::store::MemorySessionStore;
    use tokio::time;
    use workshop_sync_common::protocol::push::TypingNotice;

    fn credential(token: &str) -> Credential {
        Credential { token: token.into(), expires_at: Utc::now() + chrono::Duration::hours(1) }
    }

    fn manager(connector: &MockConnector) -> ConnectionManager<MockConnector> {
        ConnectionManager::new(
            connector.clone(),
            settings(Duration::from_secs(25)),
            Arc::new(MemorySessionStore::new()),
        )
    }

    async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
        events.recv().await.unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(8), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = SyncConfig::default();
        config.server_url = "https://workshop.example.com".into();
        config.channel.missed_heartbeat_limit = 5;
        let settings = ChannelSettings::from_config(&config).unwrap();
        assert_eq!(settings.endpoint.as_str(), "wss://workshop.example.com/ws");
        assert_eq!(settings.missed_heartbeat_limit, 5);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(25));
    }

    #[tokio::test]
    async fn connect_publishes_connected_and_status() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = manager(&connector);
        let mut events = mgr.subscribe();
        assert_eq!(mgr.snapshot(), ConnectionSnapshot::default());

        mgr.connect(credential("tok-1")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        let snapshot = mgr.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert!(snapshot.last_connected_at.is_some());
        assert_eq!(connector.session(0).token, "tok-1");

        mgr.disconnect().await;
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected { reason: DisconnectReason::ClientClosed }
        );
        assert_eq!(mgr.snapshot().status, ConnectionStatus::Disconnected);
        assert!(connector.session(0).is_closed());
    }

    #[tokio::test]
    async fn three_missed_heartbeats_force_exactly_one_reconnect() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = ConnectionManager::new(
            connector.clone(),
            settings(Duration::from_secs(1)),
            Arc::new(MemorySessionStore::new()),
        );
        let mut events = mgr.subscribe();
        mgr.connect(credential("tok")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        let opened_at = Instant::now();

        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected { reason: DisconnectReason::HeartbeatTimeout }
        );
        assert_eq!(opened_at.elapsed(), Duration::from_secs(4));
        assert_eq!(connector.session(0).pings(), 3);
        assert!(connector.session(0).is_closed());

        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(mgr.snapshot().missed_heartbeats, 0);

        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn pong_keeps_the_channel_open() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = ConnectionManager::new(
            connector.clone(),
            settings(Duration::from_secs(1)),
            Arc::new(MemorySessionStore::new()),
        );
        let mut status = mgr.on_status_change();
        mgr.connect(credential("tok")).await;
        settle().await;

        for _ in 0..6 {
            time::advance(Duration::from_secs(1)).await;
            settle().await;
            assert_eq!(status.borrow_and_update().missed_heartbeats, 1);
            connector.session(0).push(&InboundEvent::Pong);
            settle().await;
            assert_eq!(mgr.snapshot().missed_heartbeats, 0);
        }

        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(connector.session(0).pings(), 6);
        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn server_close_reconnects_without_backoff() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = manager(&connector);
        let mut events = mgr.subscribe();
        mgr.connect(credential("tok")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        connector.session(0).close();
        match next_event(&mut events).await {
            ChannelEvent::Disconnected { reason } => {
                assert_eq!(reason.as_str(), "io server disconnect");
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1] - attempts[0], Duration::ZERO);
        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn connect_failures_back_off_exponentially() {
        time::pause();
        let connector = MockConnector::default();
        for _ in 0..3 {
            connector.fail_next(TransportError::Connect("connection refused".into()));
        }
        let mgr = manager(&connector);
        let mut events = mgr.subscribe();
        mgr.connect(credential("tok")).await;

        for _ in 0..3 {
            assert!(matches!(next_event(&mut events).await, ChannelEvent::ConnectError { .. }));
        }
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        let attempts = connector.attempts();
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_millis(250), Duration::from_millis(500), Duration::from_secs(1)]
        );
        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn unauthorized_handshake_clears_session_and_stops() {
        time::pause();
        let connector = MockConnector::default();
        connector.fail_next(TransportError::Unauthorized);
        let store = Arc::new(MemorySessionStore::with_credential(credential("stale")));
        let mgr = ConnectionManager::new(
            connector.clone(),
            settings(Duration::from_secs(25)),
            store.clone(),
        );
        let mut events = mgr.subscribe();
        mgr.connect(credential("stale")).await;

        assert_eq!(next_event(&mut events).await, ChannelEvent::Unauthenticated);
        assert_eq!(store.load_credential().unwrap(), None);
        assert_eq!(mgr.snapshot().status, ConnectionStatus::Disconnected);

        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn emit_requires_an_open_channel() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = manager(&connector);
        assert_eq!(
            mgr.emit(OutboundEvent::Read { message_id: 5 }).await,
            Err(ChannelError::NotConnected)
        );
        assert_eq!(mgr.send_heartbeat().await, Err(ChannelError::NotConnected));

        let mut events = mgr.subscribe();
        mgr.connect(credential("tok")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        mgr.emit(OutboundEvent::Typing { recipient_id: Some(3) }).await.unwrap();
        mgr.send_heartbeat().await.unwrap();
        let sent = connector.session(0).sent();
        assert_eq!(sent[0], OutboundEvent::Typing { recipient_id: Some(3) });
        assert!(matches!(sent[1], OutboundEvent::Ping { .. }));
        assert_eq!(mgr.snapshot().missed_heartbeats, 1);

        mgr.disconnect().await;
        assert_eq!(
            mgr.emit(OutboundEvent::Read { message_id: 5 }).await,
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn reconnecting_tears_down_the_previous_channel() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = manager(&connector);
        let mut events = mgr.subscribe();

        mgr.connect(credential("first")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        mgr.connect(credential("second")).await;
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected { reason: DisconnectReason::ClientClosed }
        );
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        assert!(connector.session(0).is_closed());
        assert!(!connector.session(1).is_closed());
        assert_eq!(connector.session(1).token, "second");
        assert_eq!(connector.session_count(), 2);
        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn updated_credential_is_used_on_reconnect() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = manager(&connector);
        let mut events = mgr.subscribe();
        mgr.connect(credential("old")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        mgr.update_credential(credential("new"));
        connector.session(0).close();
        next_event(&mut events).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        assert_eq!(connector.session(1).token, "new");
        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn push_frames_are_decoded_and_unknown_ones_dropped() {
        time::pause();
        let connector = MockConnector::default();
        let mgr = manager(&connector);
        let mut events = mgr.subscribe();
        mgr.connect(credential("tok")).await;
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        let server = connector.session(0);
        server.push_raw(r#"{"event":"calendar:moved:again","data":{}}"#);
        server.push_raw("garbage");
        let typing = InboundEvent::Typing(TypingNotice { sender: "Deniz".into(), sender_id: 9 });
        server.push(&typing);

        assert_eq!(next_event(&mut events).await, ChannelEvent::Push(typing));
        assert_eq!(connector.attempts().len(), 1);
        mgr.disconnect().await;
    }
}
