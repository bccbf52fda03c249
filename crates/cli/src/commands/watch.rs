// `workshop-sync watch`: stay connected and stream what the client sees.
//
// One line per channel event, session change or presence change. Ctrl-C
// shuts the client down cleanly, which also leaves the presence session.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use workshop_sync_client::auth::{AuthState, Credential};
use workshop_sync_client::channel::ChannelEvent;
use workshop_sync_client::config::SyncConfig;
use workshop_sync_client::presence::PresenceView;
use workshop_sync_client::store::SessionStore;
use workshop_sync_client::SyncClient;
use workshop_sync_common::types::MessageId;

use super::{block_on, GlobalArgs};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Log in with this access token instead of the stored one.
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Do not print presence changes.
    #[arg(long)]
    no_presence: bool,
}

/// One streamed line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchLine {
    Connected,
    Disconnected { reason: String },
    ConnectError { message: String },
    Unauthenticated,
    Push { event: String, data: Value },
    Session { authenticated: bool, expires_at: Option<DateTime<Utc>> },
    Presence { online: usize, total: usize, typing: Vec<String>, last_read: Option<MessageId> },
}

impl WatchLine {
    pub fn from_event(event: &ChannelEvent) -> Self {
        match event {
            ChannelEvent::Connected => Self::Connected,
            ChannelEvent::Disconnected { reason } => {
                Self::Disconnected { reason: reason.to_string() }
            }
            ChannelEvent::ConnectError { message } => {
                Self::ConnectError { message: message.clone() }
            }
            ChannelEvent::Unauthenticated => Self::Unauthenticated,
            ChannelEvent::Push(inbound) => {
                let data = serde_json::from_str::<Value>(&inbound.encode())
                    .ok()
                    .and_then(|mut envelope| envelope.get_mut("data").map(Value::take))
                    .unwrap_or(Value::Null);
                Self::Push { event: inbound.name(), data }
            }
        }
    }

    pub fn from_auth(state: &AuthState) -> Self {
        Self::Session {
            authenticated: state.credential().is_some(),
            expires_at: state.credential().map(|credential| credential.expires_at),
        }
    }

    pub fn from_presence(view: &PresenceView) -> Self {
        Self::Presence {
            online: view.roster.iter().filter(|entry| entry.is_online).count(),
            total: view.roster.len(),
            typing: view.typing.iter().map(|typer| typer.display_name.clone()).collect(),
            last_read: view.receipts.last().map(|receipt| receipt.message_id),
        }
    }

    pub(crate) fn human(&self) -> String {
        match self {
            Self::Connected => "● connected".to_string(),
            Self::Disconnected { reason } => format!("○ disconnected ({reason})"),
            Self::ConnectError { message } => format!("○ connect failed: {message}"),
            Self::Unauthenticated => "✗ server rejected the session".to_string(),
            Self::Push { event, data } => format!("← {event} {data}"),
            Self::Session { authenticated: true, expires_at } => match expires_at {
                Some(at) => format!("session: valid until {}", at.to_rfc3339()),
                None => "session: valid".to_string(),
            },
            Self::Session { authenticated: false, .. } => "session: logged out".to_string(),
            Self::Presence { online, total, typing, .. } => {
                let mut line = format!("presence: {online}/{total} online");
                if !typing.is_empty() {
                    line.push_str(&format!(", typing: {}", typing.join(", ")));
                }
                line
            }
        }
    }
}

pub fn run(global: &GlobalArgs, format: OutputFormat, args: WatchArgs) -> anyhow::Result<()> {
    let config = global.load_config()?;
    let store: Arc<dyn SessionStore> = Arc::new(global.session_store()?);
    block_on(watch(config, store, format, args))?
}

async fn watch(
    config: SyncConfig,
    store: Arc<dyn SessionStore>,
    format: OutputFormat,
    args: WatchArgs,
) -> anyhow::Result<()> {
    let login = args
        .token
        .map(Credential::from_token)
        .transpose()
        .context("--token expects a JWT access token")?;

    let client = SyncClient::start(config, store)?;
    let mut events = client.events();
    let mut auth = client.auth();
    let mut presence = client.presence_view();

    if let Some(credential) = login {
        client.login(credential);
    } else if auth.borrow().credential().is_none() {
        output::print_warning(
            format,
            "NOT_LOGGED_IN",
            "no stored session; waiting for a login (pass --token)",
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let result = loop {
        let line = tokio::select! {
            signal = &mut ctrl_c => break signal.context("failed to listen for Ctrl-C"),
            event = events.recv() => match event {
                Ok(event) => WatchLine::from_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    output::print_warning(
                        format,
                        "EVENTS_LAGGED",
                        &format!("skipped {skipped} channel events"),
                    );
                    continue;
                }
                Err(RecvError::Closed) => break Ok(()),
            },
            changed = auth.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = auth.borrow_and_update().clone();
                WatchLine::from_auth(&state)
            }
            changed = presence.changed(), if !args.no_presence => {
                if changed.is_err() {
                    break Ok(());
                }
                let view = presence.borrow_and_update().clone();
                WatchLine::from_presence(&view)
            }
        };
        if let Err(error) = output::print_output(format, &line, WatchLine::human) {
            break Err(error.into());
        }
    };

    client.shutdown().await;
    result
}
