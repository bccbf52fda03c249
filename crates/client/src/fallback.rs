// Poll/push fallback.
//
// While the push channel is down, views poll their collection on a fixed
// cadence instead. The channel status is only consulted between cycles, so a
// cycle that has started always finishes. `FetchScope` tickets make sure a
// superseded or orphaned fetch never applies its result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{ConnectionSnapshot, ConnectionStatus};
use crate::config::PollingConfig;

// ── Selector ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FallbackSelector {
    status: watch::Receiver<ConnectionSnapshot>,
}

impl FallbackSelector {
    pub fn new(status: watch::Receiver<ConnectionSnapshot>) -> Self {
        Self { status }
    }

    /// True whenever the push channel is not connected.
    pub fn should_poll(&self) -> bool {
        self.status.borrow().status != ConnectionStatus::Connected
    }
}

/// Views that fall back to polling, each with its own cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Orders,
    Tasks,
    Chat,
    Presence,
}

impl ViewKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Tasks => "tasks",
            Self::Chat => "chat",
            Self::Presence => "presence",
        }
    }

    pub fn poll_interval(self, config: &PollingConfig) -> Duration {
        let secs = match self {
            Self::Orders => config.orders_sec,
            Self::Tasks => config.tasks_sec,
            Self::Chat => config.chat_sec,
            Self::Presence => config.presence_sec,
        };
        Duration::from_secs(secs.max(1))
    }
}

// ── Fetch scope ─────────────────────────────────────────────────────

/// Hands out fetch tickets. Starting a new fetch supersedes the previous
/// ticket; closing the scope (view teardown) orphans all of them.
#[derive(Debug)]
pub struct FetchScope {
    root: CancellationToken,
    current: Mutex<CancellationToken>,
    generation: AtomicU64,
}

/// Proof that a fetch is still the latest one for its scope.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    token: CancellationToken,
    generation: u64,
}

impl Default for FetchScope {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchScope {
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let current = Mutex::new(root.child_token());
        Self { root, current, generation: AtomicU64::new(0) }
    }

    /// Start a fetch, superseding any ticket handed out before.
    pub fn begin(&self) -> FetchTicket {
        let mut current = self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        current.cancel();
        let token = self.root.child_token();
        *current = token.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        FetchTicket { token, generation }
    }

    /// Orphan every outstanding ticket. Tickets from `begin` after this are
    /// born cancelled.
    pub fn close(&self) {
        self.root.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl FetchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once superseded or orphaned; a stale ticket must not merge.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Run `apply` only if the ticket is still current.
    pub fn apply<T>(&self, apply: impl FnOnce() -> T) -> Option<T> {
        self.is_current().then(apply)
    }

    /// Resolves when the ticket is superseded or orphaned.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

// ── Polling driver ──────────────────────────────────────────────────

/// Start polling `view` every `interval` while the selector says so. `cycle`
/// receives a fresh ticket per run.
pub fn start_polling<F, Fut>(
    view: ViewKind,
    interval: Duration,
    selector: FallbackSelector,
    scope: Arc<FetchScope>,
    mut cycle: F,
) -> PollingHandle
where
    F: FnMut(FetchTicket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if !selector.should_poll() {
                continue;
            }
            debug!(view = view.as_str(), "fallback poll");
            // Not raced against shutdown: a started cycle finishes.
            cycle(scope.begin()).await;
        }
    });
    PollingHandle { task, shutdown_tx }
}

/// Handle for a polling task. Dropping it aborts the task.
pub struct PollingHandle {
    task: tokio::task::JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl PollingHandle {
    /// Stop after the in-flight cycle, if any, completes.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for PollingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
