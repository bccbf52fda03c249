// `workshop-sync token`: decode the stored credential and show when it will
// be refreshed.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};

use workshop_sync_client::auth::{refresh_plan, Credential, RefreshConfig, RefreshPlan};
use workshop_sync_client::store::SessionStore;
use workshop_sync_common::types::UserId;

use super::GlobalArgs;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct TokenArgs {
    /// Store this access token as the current session before reporting.
    #[arg(long, value_name = "TOKEN")]
    set: Option<String>,

    /// Store the server's `refresh_token` cookie value alongside the session.
    #[arg(long, value_name = "COOKIE", conflicts_with = "clear")]
    refresh_cookie: Option<String>,

    /// Forget the stored access token and refresh cookie.
    #[arg(long, conflicts_with = "set")]
    clear: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenReport {
    pub present: bool,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remaining_secs: Option<u64>,
    pub expired: bool,
    /// Whether a refresh cookie is stored; without one the server may refuse
    /// to refresh.
    #[serde(default)]
    pub has_refresh_cookie: bool,
    /// Seconds until the scheduler refreshes; 0 means on the next start.
    #[serde(default)]
    pub refresh_in_secs: Option<u64>,
    pub presence_session_id: String,
}

impl TokenReport {
    pub fn build(
        credential: Option<&Credential>,
        refresh: RefreshConfig,
        now: DateTime<Utc>,
        has_refresh_cookie: bool,
        presence_session_id: String,
    ) -> Self {
        let Some(credential) = credential else {
            return Self {
                present: false,
                user_id: None,
                expires_at: None,
                remaining_secs: None,
                expired: false,
                has_refresh_cookie,
                refresh_in_secs: None,
                presence_session_id,
            };
        };
        let plan = refresh_plan(credential, now, refresh.headroom, refresh.min_delay);
        Self {
            present: true,
            user_id: credential.user_id(),
            expires_at: Some(credential.expires_at),
            remaining_secs: Some(credential.remaining_at(now).as_secs()),
            expired: credential.is_expired_at(now),
            has_refresh_cookie,
            refresh_in_secs: Some(match plan {
                RefreshPlan::Immediate => 0,
                RefreshPlan::After(delay) => delay.as_secs(),
            }),
            presence_session_id,
        }
    }
}

pub fn run(global: &GlobalArgs, format: OutputFormat, args: TokenArgs) -> anyhow::Result<()> {
    let config = global.load_config()?;
    let store = global.session_store()?;

    if let Some(token) = args.set {
        let credential = Credential::from_token(token).context("--set expects a JWT access token")?;
        store.save_credential(&credential)?;
        tracing::info!(expires_at = %credential.expires_at, "stored access token");
    }
    if let Some(cookie) = args.refresh_cookie.as_deref() {
        let cookie = cookie.trim().trim_start_matches("refresh_token=");
        anyhow::ensure!(!cookie.is_empty(), "--refresh-cookie expects a non-empty value");
        store.save_refresh_cookie(Some(cookie))?;
        tracing::info!("stored refresh cookie");
    }
    if args.clear {
        store.clear_credential()?;
    }

    let credential = store.load_credential()?;
    let report = TokenReport::build(
        credential.as_ref(),
        RefreshConfig::from(&config.auth),
        Utc::now(),
        store.load_refresh_cookie()?.is_some(),
        store.presence_session_id()?,
    );
    output::print_output(format, &report, format_human)?;
    Ok(())
}

pub(crate) fn format_human(report: &TokenReport) -> String {
    if !report.present {
        return format!(
            "No stored session.\nPresence session: {}\nRun: workshop-sync token --set <TOKEN>",
            report.presence_session_id
        );
    }

    let mut lines = Vec::new();
    let user = report.user_id.map_or_else(|| "unknown".to_string(), |id| id.to_string());
    lines.push(format!("User: {user}"));
    if let Some(expires_at) = report.expires_at {
        let state = if report.expired {
            "expired".to_string()
        } else {
            format!("{} left", human_duration(report.remaining_secs.unwrap_or(0)))
        };
        lines.push(format!("Expires: {} ({state})", expires_at.to_rfc3339()));
    }
    match report.refresh_in_secs {
        Some(0) => lines.push("Refresh: immediately on next start".to_string()),
        Some(secs) => lines.push(format!("Refresh: in {}", human_duration(secs))),
        None => {}
    }
    if !report.has_refresh_cookie {
        lines.push("Refresh cookie: none (set with --refresh-cookie)".to_string());
    }
    lines.push(format!("Presence session: {}", report.presence_session_id));
    lines.join("\n")
}

fn human_duration(secs: u64) -> String {
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}
