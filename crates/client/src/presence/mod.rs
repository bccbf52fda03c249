// Presence and typing coordinator.
//
// Keeps two presence layers: the periodic pull from `/api/online/users`
// (baseline) and the latest `presence:update` push (overlay). Typing
// indicators and read receipts come from the push channel. Everything is
// folded into one `PresenceView` published on a watch channel.
//
// Every pull cycle first pings presence with this device's session id so the
// server keeps us listed; shutdown sends a best-effort leave.

pub mod receipts;
pub mod roster;
pub mod typing;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use workshop_sync_common::protocol::push::{InboundEvent, OutboundEvent, ReadNotice, TypingNotice};
use workshop_sync_common::types::{MessageId, PresenceUser, UserId};

use crate::api::ApiError;
use crate::auth::AuthState;
use crate::channel::{ChannelConnector, ChannelError, ChannelEvent, ConnectionManager};
use crate::config::PresenceConfig;

pub use receipts::{ReadReceipt, ReadReceiptLog};
pub use roster::{merge_presence, PresenceEntry, PresenceSource};
pub use typing::{ActiveTyper, TypingTracker};

// ── Presence client trait ───────────────────────────────────────────

/// Server acknowledgement of a presence ping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PingAck {
    pub session_id: String,
    /// Seconds until the server forgets this session without another ping.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// The presence REST endpoints.
pub trait PresenceClient: Send + Sync + 'static {
    fn ping(
        &self,
        token: &str,
        session_id: &str,
        client_type: &str,
    ) -> impl Future<Output = Result<PingAck, ApiError>> + Send;

    fn leave(&self, token: &str, session_id: &str)
        -> impl Future<Output = Result<(), ApiError>> + Send;

    fn online_users(&self, token: &str)
        -> impl Future<Output = Result<Vec<PresenceUser>, ApiError>> + Send;
}

impl<T: PresenceClient> PresenceClient for Arc<T> {
    fn ping(
        &self,
        token: &str,
        session_id: &str,
        client_type: &str,
    ) -> impl Future<Output = Result<PingAck, ApiError>> + Send {
        (**self).ping(token, session_id, client_type)
    }

    fn leave(
        &self,
        token: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        (**self).leave(token, session_id)
    }

    fn online_users(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Vec<PresenceUser>, ApiError>> + Send {
        (**self).online_users(token)
    }
}

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub pull_interval: Duration,
    /// How recent a last-seen timestamp must be to count as online.
    pub freshness_window: Duration,
    pub typing_ttl: Duration,
    pub typing_sweep: Duration,
    pub receipt_limit: usize,
    /// Reported to the ping endpoint (`browser`, `cli`, ...).
    pub client_type: String,
}

impl PresenceSettings {
    pub fn from_config(config: &PresenceConfig, client_type: impl Into<String>) -> Self {
        Self {
            pull_interval: config.pull_interval(),
            freshness_window: config.freshness_window(),
            typing_ttl: config.typing_ttl(),
            typing_sweep: config.typing_sweep(),
            receipt_limit: config.read_receipt_limit,
            client_type: client_type.into(),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::from_config(&PresenceConfig::default(), "cli")
    }
}

// ── State ───────────────────────────────────────────────────────────

/// What views render.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceView {
    pub roster: Vec<PresenceEntry>,
    pub typing: Vec<ActiveTyper>,
    pub receipts: Vec<ReadReceipt>,
    pub last_pull_at: Option<DateTime<Utc>>,
}

/// Presence layers, typing indicators and read receipts, without any I/O.
#[derive(Debug, Clone)]
pub struct PresenceState {
    pulled: Vec<PresenceUser>,
    pushed: Vec<PresenceUser>,
    typing: TypingTracker,
    receipts: ReadReceiptLog,
    window: Duration,
    last_pull_at: Option<DateTime<Utc>>,
}

impl PresenceState {
    pub fn new(settings: &PresenceSettings) -> Self {
        Self {
            pulled: Vec::new(),
            pushed: Vec::new(),
            typing: TypingTracker::new(settings.typing_ttl),
            receipts: ReadReceiptLog::new(settings.receipt_limit),
            window: settings.freshness_window,
            last_pull_at: None,
        }
    }

    pub fn apply_pull(&mut self, users: Vec<PresenceUser>, at: DateTime<Utc>) {
        self.pulled = users;
        self.last_pull_at = Some(at);
    }

    /// Each `presence:update` replaces the whole push layer.
    pub fn apply_push(&mut self, users: Vec<PresenceUser>) {
        self.pushed = users;
    }

    pub fn register_typing(&mut self, notice: &TypingNotice, now: Instant) {
        self.typing.register_at(notice, now);
    }

    pub fn register_read(&mut self, notice: &ReadNotice, at: DateTime<Utc>) {
        self.receipts.record(ReadReceipt::from_notice(notice, at));
    }

    /// Drop expired typing indicators. Returns whether anything changed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        self.typing.prune_at(now)
    }

    pub fn roster(&self, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        merge_presence(&self.pulled, &self.pushed, now, self.window)
    }

    pub fn active_typers(&self, exclude: Option<UserId>, now: Instant) -> Vec<ActiveTyper> {
        self.typing.active_typers_at(exclude, now)
    }

    pub fn view(&self, exclude: Option<UserId>, now: DateTime<Utc>, tick: Instant) -> PresenceView {
        PresenceView {
            roster: self.roster(now),
            typing: self.active_typers(exclude, tick),
            receipts: self.receipts.iter().cloned().collect(),
            last_pull_at: self.last_pull_at,
        }
    }
}

// ── Coordinator task ────────────────────────────────────────────────

enum Command {
    Refresh,
    Emit { event: OutboundEvent, reply: oneshot::Sender<Result<(), ChannelError>> },
}

/// Start the coordinator. It pulls immediately, then every `pull_interval`
/// and whenever the channel (re)connects.
pub fn start_presence<P, C>(
    settings: PresenceSettings,
    client: P,
    channel: Arc<ConnectionManager<C>>,
    auth: watch::Receiver<AuthState>,
    session_id: String,
) -> (watch::Receiver<PresenceView>, PresenceHandle)
where
    P: PresenceClient,
    C: ChannelConnector,
{
    let (view_tx, view_rx) = watch::channel(PresenceView::default());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let events = channel.subscribe();

    let inner = PresenceInner {
        state: PresenceState::new(&settings),
        settings,
        client: Arc::new(client),
        channel,
        auth,
        session_id,
        view_tx,
    };
    let task = tokio::spawn(presence_loop(inner, events, command_rx, shutdown_rx));

    (view_rx, PresenceHandle { task, command_tx, shutdown_tx })
}

/// Handle for the presence task. Dropping it aborts the task.
pub struct PresenceHandle {
    task: tokio::task::JoinHandle<()>,
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
}

impl PresenceHandle {
    /// Pull now instead of waiting for the next tick.
    pub fn refresh(&self) {
        let _ = self.command_tx.send(Command::Refresh);
    }

    /// Tell others the local user is typing, optionally to one recipient.
    pub async fn notify_typing(&self, recipient_id: Option<UserId>) -> Result<(), ChannelError> {
        self.emit(OutboundEvent::Typing { recipient_id }).await
    }

    pub async fn mark_read(&self, message_id: MessageId) -> Result<(), ChannelError> {
        self.emit(OutboundEvent::Read { message_id }).await
    }

    async fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::Emit { event, reply })
            .map_err(|_| ChannelError::NotConnected)?;
        response.await.unwrap_or(Err(ChannelError::NotConnected))
    }

    /// Stop the task after sending a best-effort presence leave.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct PresenceInner<P: PresenceClient, C: ChannelConnector> {
    settings: PresenceSettings,
    state: PresenceState,
    client: Arc<P>,
    channel: Arc<ConnectionManager<C>>,
    auth: watch::Receiver<AuthState>,
    session_id: String,
    view_tx: watch::Sender<PresenceView>,
}

impl<P: PresenceClient, C: ChannelConnector> PresenceInner<P, C> {
    fn token(&self) -> Option<String> {
        self.auth.borrow().credential().map(|credential| credential.token.clone())
    }

    fn local_user_id(&self) -> Option<UserId> {
        self.auth.borrow().credential().and_then(|credential| credential.user_id())
    }

    fn publish(&self) {
        let view = self.state.view(self.local_user_id(), Utc::now(), Instant::now());
        self.view_tx.send_if_modified(|current| {
            let changed = *current != view;
            *current = view;
            changed
        });
    }

    /// Ping, then fetch the roster, on a task of its own so a slow server
    /// never stalls the sweep, push events or outbound emits.
    fn spawn_pull(&self) -> Option<JoinHandle<Option<Vec<PresenceUser>>>> {
        let Some(token) = self.token() else {
            debug!("no credential, skipping presence pull");
            return None;
        };
        let client = self.client.clone();
        let session_id = self.session_id.clone();
        let client_type = self.settings.client_type.clone();

        Some(tokio::spawn(async move {
            match client.ping(&token, &session_id, &client_type).await {
                Ok(ack) => debug!(
                    session_id = %ack.session_id,
                    expires_in = ?ack.expires_in,
                    "presence ping"
                ),
                Err(error) => warn!(error = %error, "presence ping failed"),
            }
            match client.online_users(&token).await {
                Ok(users) => Some(users),
                Err(error) => {
                    warn!(error = %error, "presence pull failed");
                    None
                }
            }
        }))
    }

    fn apply_pull(&mut self, users: Vec<PresenceUser>) {
        debug!(users = users.len(), "presence pulled");
        self.state.apply_pull(users, Utc::now());
        self.publish();
    }

    async fn leave(&self) {
        let Some(token) = self.token() else {
            return;
        };
        match self.client.leave(&token, &self.session_id).await {
            Ok(()) => info!(session_id = %self.session_id, "presence session left"),
            Err(error) => debug!(error = %error, "presence leave failed"),
        }
    }

    /// Fold a channel event into the state. Returns true when it calls for a
    /// pull.
    fn on_channel_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Connected => return true,
            ChannelEvent::Push(InboundEvent::PresenceUpdate { users }) => {
                self.state.apply_push(users);
                self.publish();
            }
            ChannelEvent::Push(InboundEvent::Typing(notice)) => {
                self.state.register_typing(&notice, Instant::now());
                self.publish();
            }
            ChannelEvent::Push(InboundEvent::Read(notice)) => {
                self.state.register_read(&notice, Utc::now());
                self.publish();
            }
            _ => {}
        }
        false
    }
}

/// At most one pull in flight. A request made while one runs is folded into
/// a single follow-up pull.
#[derive(Default)]
struct PullSlot {
    task: Option<JoinHandle<Option<Vec<PresenceUser>>>>,
    again: bool,
}

impl PullSlot {
    fn request<P: PresenceClient, C: ChannelConnector>(&mut self, inner: &PresenceInner<P, C>) {
        if self.task.is_some() {
            self.again = true;
            return;
        }
        self.task = inner.spawn_pull();
    }

    fn busy(&self) -> bool {
        self.task.is_some()
    }

    /// Resolves with the pulled users once the in-flight pull ends.
    async fn finished(&mut self) -> Option<Vec<PresenceUser>> {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.task = None;
        result.unwrap_or_else(|error| {
            warn!(error = %error, "presence pull task failed");
            None
        })
    }

    fn take_again(&mut self) -> bool {
        std::mem::take(&mut self.again)
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.again = false;
    }
}

async fn presence_loop<P: PresenceClient, C: ChannelConnector>(
    mut inner: PresenceInner<P, C>,
    mut events: broadcast::Receiver<ChannelEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut pull_ticker = tokio::time::interval(inner.settings.pull_interval);
    pull_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let sweep = inner.settings.typing_sweep;
    let mut sweep_ticker = tokio::time::interval_at(Instant::now() + sweep, sweep);
    sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pulls = PullSlot::default();
    let mut events_open = true;
    let mut auth_open = true;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                pulls.abort();
                inner.leave().await;
                debug!("presence loop shutting down");
                break;
            }
            _ = pull_ticker.tick() => pulls.request(&inner),
            pulled = pulls.finished(), if pulls.busy() => {
                if let Some(users) = pulled {
                    inner.apply_pull(users);
                }
                if pulls.take_again() {
                    pulls.request(&inner);
                }
            }
            _ = sweep_ticker.tick() => {
                if inner.state.sweep(Instant::now()) {
                    inner.publish();
                }
            }
            event = events.recv(), if events_open => match event {
                Ok(event) => {
                    if inner.on_channel_event(event) {
                        pulls.request(&inner);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "presence fell behind the push channel");
                }
                Err(RecvError::Closed) => events_open = false,
            },
            changed = inner.auth.changed(), if auth_open => match changed {
                Ok(()) => {
                    let authenticated = inner.auth.borrow_and_update().credential().is_some();
                    if authenticated {
                        pulls.request(&inner);
                    } else {
                        inner.publish();
                    }
                }
                Err(_) => auth_open = false,
            },
            command = commands.recv() => match command {
                Some(Command::Refresh) => pulls.request(&inner),
                Some(Command::Emit { event, reply }) => {
                    let _ = reply.send(inner.channel.emit(event).await);
                }
                None => break,
            },
        }
    }
    pulls.abort();
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credential::test_tokens::token_expiring_at;
    use crate::auth::Credential;
    use crate::channel::mock::{settings, MockConnector};
    use crate::store::MemorySessionStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time;

    // ── Mock presence client ────────────────────────────────────────

    #[derive(Default)]
    struct MockPresenceClient {
        pulls: Mutex<VecDeque<Vec<PresenceUser>>>,
        calls: Mutex<Vec<String>>,
        pull_count: AtomicUsize,
        leave_count: AtomicUsize,
        pull_delay: Option<Duration>,
    }

    impl MockPresenceClient {
        fn queue_pull(&self, users: Vec<PresenceUser>) {
            self.pulls.lock().unwrap().push_back(users);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PresenceClient for MockPresenceClient {
        async fn ping(
            &self,
            _token: &str,
            session_id: &str,
            client_type: &str,
        ) -> Result<PingAck, ApiError> {
            self.calls.lock().unwrap().push(format!("ping:{session_id}:{client_type}"));
            Ok(PingAck { session_id: session_id.to_string(), expires_in: Some(45) })
        }

        async fn leave(&self, _token: &str, session_id: &str) -> Result<(), ApiError> {
            self.calls.lock().unwrap().push(format!("leave:{session_id}"));
            self.leave_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn online_users(&self, _token: &str) -> Result<Vec<PresenceUser>, ApiError> {
            self.calls.lock().unwrap().push("users".into());
            self.pull_count.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.pull_delay {
                time::sleep(delay).await;
            }
            Ok(self.pulls.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    // ── Harness ─────────────────────────────────────────────────────

    struct Harness {
        client: Arc<MockPresenceClient>,
        connector: MockConnector,
        channel: Arc<ConnectionManager<MockConnector>>,
        auth_tx: watch::Sender<AuthState>,
        view: watch::Receiver<PresenceView>,
        handle: PresenceHandle,
    }

    fn credential() -> Credential {
        Credential::from_token(token_expiring_at(Utc::now() + chrono::Duration::hours(1))).unwrap()
    }

    fn user(id: UserId, name: &str, online: Option<bool>) -> PresenceUser {
        let mut user = PresenceUser::new(id);
        user.full_name = Some(name.to_string());
        user.is_online = online;
        user
    }

    fn harness(auth: AuthState) -> Harness {
        harness_with(auth, MockPresenceClient::default())
    }

    fn harness_with(auth: AuthState, client: MockPresenceClient) -> Harness {
        let client = Arc::new(client);
        let connector = MockConnector::default();
        let channel = Arc::new(ConnectionManager::new(
            connector.clone(),
            settings(Duration::from_secs(25)),
            Arc::new(MemorySessionStore::new()),
        ));
        let (auth_tx, auth_rx) = watch::channel(auth);
        let (view, handle) = start_presence(
            PresenceSettings::default(),
            client.clone(),
            channel.clone(),
            auth_rx,
            "cli-device".into(),
        );
        Harness { client, connector, channel, auth_tx, view, handle }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for(
        view: &mut watch::Receiver<PresenceView>,
        done: impl Fn(&PresenceView) -> bool,
    ) -> PresenceView {
        loop {
            {
                let current = view.borrow_and_update();
                if done(&current) {
                    return current.clone();
                }
            }
            view.changed().await.unwrap();
        }
    }

    // ── Pure state ──────────────────────────────────────────────────

    #[test]
    fn pushed_online_flag_overrides_pulled_offline() {
        let mut state = PresenceState::new(&PresenceSettings::default());
        let now = Utc::now();
        state.apply_pull(vec![user(1, "Ayşe", Some(false))], now);

        let mut pushed = PresenceUser::new(1);
        pushed.is_online = Some(true);
        pushed.last_active = Some(now);
        state.apply_push(vec![pushed]);

        let roster = state.roster(now);
        assert_eq!(roster.len(), 1);
        assert!(roster[0].is_online);
    }

    #[test]
    fn a_new_push_replaces_the_previous_one() {
        let mut state = PresenceState::new(&PresenceSettings::default());
        let now = Utc::now();
        state.apply_push(vec![user(1, "Ayşe", Some(true)), user(2, "Deniz", Some(true))]);
        state.apply_push(vec![user(2, "Deniz", Some(true))]);

        let ids: Vec<UserId> = state.roster(now).iter().map(|e| e.user_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn sweep_drops_typers_within_one_tick_of_expiry() {
        let settings = PresenceSettings::default();
        let mut state = PresenceState::new(&settings);
        let t0 = Instant::now();
        state.register_typing(&TypingNotice { sender: "Mert".into(), sender_id: 3 }, t0);

        assert!(!state.sweep(t0 + Duration::from_secs(3)));
        assert!(state.sweep(t0 + settings.typing_ttl + settings.typing_sweep));
        assert!(state.active_typers(None, t0).is_empty());
    }

    // ── Coordinator ─────────────────────────────────────────────────

    #[tokio::test]
    async fn pulls_immediately_with_a_ping_first() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        h.client.queue_pull(vec![user(1, "Ayşe", Some(true))]);

        let view = wait_for(&mut h.view, |v| v.last_pull_at.is_some()).await;
        assert_eq!(view.roster[0].display_name, "Ayşe");
        assert_eq!(h.client.calls()[..2], ["ping:cli-device:cli".to_string(), "users".to_string()]);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn pulls_again_every_interval() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 2);

        h.handle.refresh();
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 3);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn no_pull_without_credential_until_login() {
        time::pause();
        let mut h = harness(AuthState::Unauthenticated);
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 0);

        h.auth_tx.send(AuthState::Authenticated(credential())).unwrap();
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 1);

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn push_events_update_the_view() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        // Initial pull, then the catch-up pull on connect.
        h.client.queue_pull(vec![user(1, "Ayşe", Some(false))]);
        h.client.queue_pull(vec![user(1, "Ayşe", Some(false))]);
        wait_for(&mut h.view, |v| v.last_pull_at.is_some()).await;

        h.channel.connect(credential()).await;
        settle().await;
        let server = h.connector.session(0);

        let mut pushed = PresenceUser::new(1);
        pushed.is_online = Some(true);
        pushed.last_active = Some(Utc::now());
        server.push(&InboundEvent::PresenceUpdate { users: vec![pushed] });
        let view = wait_for(&mut h.view, |v| v.roster.first().is_some_and(|e| e.is_online)).await;
        assert_eq!(view.roster[0].sources, vec![PresenceSource::Pull, PresenceSource::Push]);

        server.push(&InboundEvent::Read(ReadNotice {
            sender: "Ayşe".into(),
            sender_id: 1,
            message_id: 91,
        }));
        let view = wait_for(&mut h.view, |v| !v.receipts.is_empty()).await;
        assert_eq!(view.receipts[0].message_id, 91);

        h.handle.shutdown().await;
        h.channel.disconnect().await;
    }

    #[tokio::test]
    async fn typing_expires_and_excludes_local_user() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        h.channel.connect(credential()).await;
        settle().await;
        let server = h.connector.session(0);

        // The credential's user_id claim is 7.
        server.push(&InboundEvent::Typing(TypingNotice { sender: "Me".into(), sender_id: 7 }));
        server.push(&InboundEvent::Typing(TypingNotice { sender: "Deniz".into(), sender_id: 2 }));
        let view = wait_for(&mut h.view, |v| !v.typing.is_empty()).await;
        assert_eq!(view.typing, vec![ActiveTyper { user_id: 2, display_name: "Deniz".into() }]);

        let started = Instant::now();
        wait_for(&mut h.view, |v| v.typing.is_empty()).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4), "cleared too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(5), "cleared too late: {elapsed:?}");

        h.handle.shutdown().await;
        h.channel.disconnect().await;
    }

    #[tokio::test]
    async fn slow_pull_does_not_stall_typing_or_emits() {
        time::pause();
        let client =
            MockPresenceClient { pull_delay: Some(Duration::from_secs(60)), ..Default::default() };
        let mut h = harness_with(AuthState::Authenticated(credential()), client);
        h.channel.connect(credential()).await;
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 1);
        let server = h.connector.session(0);

        server.push(&InboundEvent::Typing(TypingNotice { sender: "Deniz".into(), sender_id: 2 }));
        wait_for(&mut h.view, |v| !v.typing.is_empty()).await;
        h.handle.refresh();
        settle().await;

        // The pull is still parked on the server; outbound notices go out anyway.
        h.handle.mark_read(12).await.unwrap();
        assert!(server.sent().contains(&OutboundEvent::Read { message_id: 12 }));

        let started = Instant::now();
        wait_for(&mut h.view, |v| v.typing.is_empty()).await;
        assert!(started.elapsed() <= Duration::from_secs(5), "typing stuck behind the pull");
        assert!(h.view.borrow().last_pull_at.is_none());

        h.handle.shutdown().await;
        h.channel.disconnect().await;
    }

    #[tokio::test]
    async fn requests_during_a_pull_fold_into_one_follow_up() {
        time::pause();
        let client =
            MockPresenceClient { pull_delay: Some(Duration::from_secs(3)), ..Default::default() };
        let mut h = harness_with(AuthState::Authenticated(credential()), client);
        settle().await;
        h.handle.refresh();
        h.handle.refresh();
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 2);
        time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 2);
        assert!(h.view.borrow().last_pull_at.is_some());

        h.handle.shutdown().await;
    }

    #[tokio::test]
    async fn outbound_notices_go_through_the_channel() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        assert_eq!(h.handle.notify_typing(None).await, Err(ChannelError::NotConnected));

        h.channel.connect(credential()).await;
        settle().await;
        h.handle.notify_typing(Some(4)).await.unwrap();
        h.handle.mark_read(91).await.unwrap();

        let sent = h.connector.session(0).sent();
        assert!(sent.contains(&OutboundEvent::Typing { recipient_id: Some(4) }));
        assert!(sent.contains(&OutboundEvent::Read { message_id: 91 }));

        h.handle.shutdown().await;
        h.channel.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_triggers_a_catch_up_pull() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 1);

        h.channel.connect(credential()).await;
        settle().await;
        assert_eq!(h.client.pull_count.load(Ordering::SeqCst), 2);

        h.handle.shutdown().await;
        h.channel.disconnect().await;
    }

    #[tokio::test]
    async fn shutdown_sends_leave_for_the_session() {
        time::pause();
        let mut h = harness(AuthState::Authenticated(credential()));
        settle().await;
        h.handle.shutdown().await;

        assert_eq!(h.client.leave_count.load(Ordering::SeqCst), 1);
        assert_eq!(h.client.calls().last().map(String::as_str), Some("leave:cli-device"));
    }

    #[tokio::test]
    async fn shutdown_without_credential_skips_leave() {
        time::pause();
        let mut h = harness(AuthState::Unauthenticated);
        settle().await;
        h.handle.shutdown().await;
        assert_eq!(h.client.leave_count.load(Ordering::SeqCst), 0);
    }
}
