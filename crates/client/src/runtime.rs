// Composition root.
//
// `SyncClient` owns every long-lived task: the refresh scheduler, the push
// channel, the presence coordinator and the link that keeps the channel in
// step with the credential. Consumers get handles and watch receivers from
// it; nothing else creates or tears down the channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::HttpApi;
use crate::auth::{
    start_refresh_scheduler, AuthState, Credential, RefreshClient, RefreshConfig,
    RefreshController, RefreshHandle,
};
use crate::channel::ws::WsConnector;
use crate::channel::{ChannelConnector, ChannelEvent, ChannelSettings, ConnectionManager};
use crate::config::SyncConfig;
use crate::fallback::{FallbackSelector, ViewKind};
use crate::presence::{
    start_presence, PresenceClient, PresenceHandle, PresenceSettings, PresenceView,
};
use crate::records::RecordCollection;
use crate::store::SessionStore;

/// Reported to the presence ping endpoint by this client.
pub const CLIENT_TYPE: &str = "cli";

pub struct SyncClient<C: ChannelConnector = WsConnector> {
    config: SyncConfig,
    channel: Arc<ConnectionManager<C>>,
    auth: watch::Receiver<AuthState>,
    refresh: RefreshHandle,
    presence: PresenceHandle,
    presence_view: watch::Receiver<PresenceView>,
    link: tokio::task::JoinHandle<()>,
    link_shutdown: watch::Sender<bool>,
}

impl SyncClient<WsConnector> {
    /// Production wiring: REST over reqwest, push channel over WebSocket.
    pub fn start(config: SyncConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let api = HttpApi::from_config(&config).context("failed to build REST client")?;
        let api = Arc::new(api.with_session_store(store.clone()));
        Self::start_with(config, store, api, WsConnector)
    }
}

impl<C: ChannelConnector> SyncClient<C> {
    pub fn start_with<A>(
        config: SyncConfig,
        store: Arc<dyn SessionStore>,
        api: Arc<A>,
        connector: C,
    ) -> Result<Self>
    where
        A: RefreshClient + PresenceClient,
    {
        let settings = ChannelSettings::from_config(&config).context("invalid push endpoint")?;
        let initial = store.load_credential().context("failed to load stored session")?;
        let session_id =
            store.presence_session_id().context("failed to load presence session id")?;

        let (auth, refresh) = start_refresh_scheduler(
            RefreshConfig::from(&config.auth),
            api.clone(),
            store.clone(),
            initial,
        );
        let channel = Arc::new(ConnectionManager::new(connector, settings, store));
        let (presence_view, presence) = start_presence(
            PresenceSettings::from_config(&config.presence, CLIENT_TYPE),
            api,
            channel.clone(),
            auth.clone(),
            session_id,
        );

        let (link_shutdown, shutdown_rx) = watch::channel(false);
        let link = tokio::spawn(credential_link(
            channel.clone(),
            auth.clone(),
            channel.subscribe(),
            refresh.controller(),
            shutdown_rx,
        ));

        Ok(Self { config, channel, auth, refresh, presence, presence_view, link, link_shutdown })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn auth(&self) -> watch::Receiver<AuthState> {
        self.auth.clone()
    }

    pub fn channel(&self) -> &Arc<ConnectionManager<C>> {
        &self.channel
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.channel.subscribe()
    }

    pub fn presence(&self) -> &PresenceHandle {
        &self.presence
    }

    pub fn presence_view(&self) -> watch::Receiver<PresenceView> {
        self.presence_view.clone()
    }

    pub fn fallback(&self) -> FallbackSelector {
        FallbackSelector::new(self.channel.on_status_change())
    }

    pub fn poll_interval(&self, view: ViewKind) -> std::time::Duration {
        view.poll_interval(&self.config.polling)
    }

    /// An empty collection using the configured lock TTL.
    pub fn collection(&self) -> RecordCollection {
        RecordCollection::new(self.config.records.lock_ttl())
    }

    /// Adopt a credential from a login. The channel opens once it is published.
    pub fn login(&self, credential: Credential) {
        self.refresh.schedule(credential);
    }

    pub fn logout(&self) {
        self.refresh.logout();
    }

    /// Host focus or storage change: re-evaluate the refresh plan.
    pub fn wake(&self) {
        self.refresh.trigger();
    }

    /// Stop every task: presence leaves, the channel closes, timers are
    /// cancelled.
    pub async fn shutdown(mut self) {
        let _ = self.link_shutdown.send(true);
        let _ = (&mut self.link).await;
        self.presence.shutdown().await;
        self.channel.disconnect().await;
        self.refresh.shutdown().await;
        info!("sync client stopped");
    }
}

impl<C: ChannelConnector> Drop for SyncClient<C> {
    fn drop(&mut self) {
        self.link.abort();
    }
}

/// Keep the channel tied to the credential: open on login, swap the token on
/// refresh, close on logout. A channel-side rejection logs the session out.
async fn credential_link<C: ChannelConnector>(
    channel: Arc<ConnectionManager<C>>,
    mut auth: watch::Receiver<AuthState>,
    mut events: broadcast::Receiver<ChannelEvent>,
    refresh: RefreshController,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut linked = false;
    let mut events_open = true;
    let initial = auth.borrow_and_update().clone();
    apply_auth(&channel, initial, &mut linked).await;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            changed = auth.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = auth.borrow_and_update().clone();
                apply_auth(&channel, state, &mut linked).await;
            }
            event = events.recv(), if events_open => match event {
                Ok(ChannelEvent::Unauthenticated) => {
                    warn!("push channel rejected the session, logging out");
                    linked = false;
                    refresh.logout();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "credential link lagged"),
                Err(RecvError::Closed) => events_open = false,
            },
        }
    }
}

async fn apply_auth<C: ChannelConnector>(
    channel: &ConnectionManager<C>,
    state: AuthState,
    linked: &mut bool,
) {
    match state {
        AuthState::Authenticated(credential) if *linked => {
            debug!(expires_at = %credential.expires_at, "push channel credential updated");
            channel.update_credential(credential);
        }
        AuthState::Authenticated(credential) => {
            info!(user_id = ?credential.user_id(), "session active, opening push channel");
            channel.connect(credential).await;
            *linked = true;
        }
        AuthState::Unauthenticated => {
            if *linked {
                info!("session ended, closing push channel");
            }
            channel.disconnect().await;
            *linked = false;
        }
    }
}
