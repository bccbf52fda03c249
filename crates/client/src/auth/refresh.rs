// Credential refresh scheduler.
//
// Arms a one-shot timer for `expiry - headroom` (floored at the minimum delay)
// and exchanges the token before it lapses. A rejected refresh logs the
// session out; anything else waits for the host's next trigger.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::credential::Credential;
use crate::store::SessionStore;

// ── Refresh client trait ────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// The server refused the token outright (HTTP 401).
    #[error("refresh rejected: credential is no longer valid")]
    Invalid,

    /// Network trouble or an unexpected server response.
    #[error("refresh failed: {0}")]
    Transient(String),
}

/// Exchanges a still-accepted token for a fresh one.
pub trait RefreshClient: Send + Sync + 'static {
    fn refresh(
        &self,
        token: String,
    ) -> impl std::future::Future<Output = Result<Credential, RefreshError>> + Send;
}

impl<T: RefreshClient> RefreshClient for Arc<T> {
    fn refresh(
        &self,
        token: String,
    ) -> impl std::future::Future<Output = Result<Credential, RefreshError>> + Send {
        (**self).refresh(token)
    }
}

// ── Planning ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Less than `headroom` left (or already expired).
    Immediate,
    After(Duration),
}

impl RefreshPlan {
    pub fn delay(self) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::After(delay) => delay,
        }
    }
}

pub fn refresh_plan(
    credential: &Credential,
    now: DateTime<Utc>,
    headroom: Duration,
    min_delay: Duration,
) -> RefreshPlan {
    let remaining = credential.remaining_at(now);
    if remaining < headroom {
        return RefreshPlan::Immediate;
    }
    RefreshPlan::After((remaining - headroom).max(min_delay))
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub headroom: Duration,
    pub min_delay: Duration,
}

impl From<&crate::config::AuthConfig> for RefreshConfig {
    fn from(cfg: &crate::config::AuthConfig) -> Self {
        Self {
            headroom: Duration::from_secs(cfg.refresh_headroom_sec),
            min_delay: Duration::from_secs(cfg.min_refresh_delay_sec),
        }
    }
}

// ── Auth state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Authenticated(Credential),
    Unauthenticated,
}

impl AuthState {
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            Self::Authenticated(credential) => Some(credential),
            Self::Unauthenticated => None,
        }
    }
}

// ── Scheduler task ──────────────────────────────────────────────────

enum Command {
    Schedule(Credential),
    Trigger,
    Logout,
}

/// Start the scheduler. `initial` is usually the credential loaded from the
/// session store.
pub fn start_refresh_scheduler<C: RefreshClient>(
    config: RefreshConfig,
    client: C,
    store: Arc<dyn SessionStore>,
    initial: Option<Credential>,
) -> (watch::Receiver<AuthState>, RefreshHandle) {
    let initial_state = match &initial {
        Some(credential) => AuthState::Authenticated(credential.clone()),
        None => AuthState::Unauthenticated,
    };
    let (state_tx, state_rx) = watch::channel(initial_state);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let inner = RefreshInner { config, client, store, state_tx };
    let task = tokio::spawn(refresh_loop(inner, initial, command_rx, shutdown_rx));

    (state_rx, RefreshHandle { task, command_tx, shutdown_tx })
}

/// Handle for the refresh task. Dropping it aborts the task.
pub struct RefreshHandle {
    task: tokio::task::JoinHandle<()>,
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
}

impl RefreshHandle {
    /// Adopt a new credential (login, or one obtained out of band) and re-arm.
    pub fn schedule(&self, credential: Credential) {
        let _ = self.command_tx.send(Command::Schedule(credential));
    }

    /// Re-evaluate the plan now. Hosts call this on focus or when another
    /// process may have changed the stored session.
    pub fn trigger(&self) {
        let _ = self.command_tx.send(Command::Trigger);
    }

    /// Drop the credential as if the server had rejected it.
    pub fn logout(&self) {
        let _ = self.command_tx.send(Command::Logout);
    }

    /// Cloneable command side, for tasks that must log out or re-arm.
    pub fn controller(&self) -> RefreshController {
        RefreshController { command_tx: self.command_tx.clone() }
    }

    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.task).await;
    }
}

#[derive(Clone)]
pub struct RefreshController {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl RefreshController {
    pub fn schedule(&self, credential: Credential) {
        let _ = self.command_tx.send(Command::Schedule(credential));
    }

    pub fn trigger(&self) {
        let _ = self.command_tx.send(Command::Trigger);
    }

    pub fn logout(&self) {
        let _ = self.command_tx.send(Command::Logout);
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RefreshInner<C: RefreshClient> {
    config: RefreshConfig,
    client: C,
    store: Arc<dyn SessionStore>,
    state_tx: watch::Sender<AuthState>,
}

impl<C: RefreshClient> RefreshInner<C> {
    fn adopt(&self, credential: &Credential) {
        if let Err(error) = self.store.save_credential(credential) {
            warn!(error = %error, "failed to persist refreshed credential");
        }
        let _ = self.state_tx.send(AuthState::Authenticated(credential.clone()));
    }

    fn logout(&self) {
        if let Err(error) = self.store.clear_credential() {
            warn!(error = %error, "failed to clear stored credential");
        }
        let _ = self.state_tx.send(AuthState::Unauthenticated);
    }
}

/// Where the scheduler stands between timer firings.
struct Schedule {
    current: Option<Credential>,
    // Set after a transient failure; cleared by the next trigger or schedule.
    parked: bool,
    // Lower bound on the next delay: min_delay after a successful refresh so
    // tokens shorter than the headroom cannot spin the loop.
    floor: Duration,
}

impl Schedule {
    fn next_wait(&self, config: &RefreshConfig) -> Option<Duration> {
        let credential = self.current.as_ref().filter(|_| !self.parked)?;
        let plan = refresh_plan(credential, Utc::now(), config.headroom, config.min_delay);
        let delay = plan.delay().max(self.floor);
        debug!(delay_ms = delay.as_millis() as u64, "refresh armed");
        Some(delay)
    }

    /// Apply a host command. Returns false once the command side is gone.
    fn on_command<C: RefreshClient>(
        &mut self,
        inner: &RefreshInner<C>,
        command: Option<Command>,
    ) -> bool {
        match command {
            Some(Command::Schedule(credential)) => {
                inner.adopt(&credential);
                self.current = Some(credential);
                self.parked = false;
                self.floor = Duration::ZERO;
            }
            Some(Command::Trigger) => {
                self.parked = false;
                self.floor = Duration::ZERO;
            }
            Some(Command::Logout) => {
                inner.logout();
                self.current = None;
            }
            None => return false,
        }
        true
    }
}

async fn refresh_loop<C: RefreshClient>(
    inner: RefreshInner<C>,
    current: Option<Credential>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut schedule = Schedule { current, parked: false, floor: Duration::ZERO };

    loop {
        let wait = schedule.next_wait(&inner.config);
        tokio::select! {
            _ = sleep_or_pending(wait) => {}
            command = commands.recv() => {
                if !schedule.on_command(&inner, command) {
                    break;
                }
                continue;
            }
            _ = shutdown_rx.changed() => {
                debug!("refresh loop shutting down");
                break;
            }
        }

        let Some(credential) = schedule.current.clone() else {
            continue;
        };
        // A hung request must not hold up logout, a new login or shutdown.
        let outcome = tokio::select! {
            outcome = inner.client.refresh(credential.token) => outcome,
            command = commands.recv() => {
                debug!("refresh abandoned for a host command");
                if !schedule.on_command(&inner, command) {
                    break;
                }
                continue;
            }
            _ = shutdown_rx.changed() => {
                debug!("refresh loop shutting down mid-refresh");
                break;
            }
        };

        match outcome {
            Ok(fresh) => {
                info!(expires_at = %fresh.expires_at, "credential refreshed");
                inner.adopt(&fresh);
                schedule.current = Some(fresh);
                schedule.floor = inner.config.min_delay;
            }
            Err(RefreshError::Invalid) => {
                warn!("credential rejected by server, logging out");
                inner.logout();
                schedule.current = None;
            }
            Err(RefreshError::Transient(reason)) => {
                warn!(%reason, "credential refresh failed, waiting for next trigger");
                schedule.parked = true;
            }
        }
    }
}

async fn sleep_or_pending(wait: Option<Duration>) {
    match wait {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
