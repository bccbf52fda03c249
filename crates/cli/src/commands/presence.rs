// `workshop-sync presence`: one presence pull, merged into a roster.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use workshop_sync_client::api::HttpApi;
use workshop_sync_client::presence::{merge_presence, PresenceEntry};
use workshop_sync_client::runtime::CLIENT_TYPE;
use workshop_sync_client::store::SessionStore;

use super::{block_on, GlobalArgs};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct PresenceArgs {
    /// Only list users currently online.
    #[arg(long)]
    online: bool,

    /// Announce this device as online before pulling.
    #[arg(long)]
    ping: bool,
}

#[derive(Debug, Serialize)]
pub struct PresenceReport {
    pub pulled_at: DateTime<Utc>,
    pub online: usize,
    pub users: Vec<PresenceEntry>,
}

impl PresenceReport {
    fn new(users: Vec<PresenceEntry>, pulled_at: DateTime<Utc>, online_only: bool) -> Self {
        let online = users.iter().filter(|user| user.is_online).count();
        let users =
            if online_only { users.into_iter().filter(|u| u.is_online).collect() } else { users };
        Self { pulled_at, online, users }
    }
}

pub fn run(global: &GlobalArgs, format: OutputFormat, args: PresenceArgs) -> anyhow::Result<()> {
    let config = global.load_config()?;
    let store = global.session_store()?;
    let credential = store
        .load_credential()?
        .with_context(|| format!("no stored session in `{}`", store.path().display()))?;
    let session_id = store.presence_session_id()?;
    let api = HttpApi::from_config(&config)?;

    let users = block_on(async {
        if args.ping {
            api.ping_presence(&credential.token, &session_id, CLIENT_TYPE)
                .await
                .context("presence ping failed")?;
        }
        api.fetch_online_users(&credential.token).await.context("presence pull failed")
    })??;

    let now = Utc::now();
    let roster = merge_presence(&users, &[], now, config.presence.freshness_window());
    let report = PresenceReport::new(roster, now, args.online);
    output::print_output(format, &report, format_human)?;
    Ok(())
}

fn format_human(report: &PresenceReport) -> String {
    if report.users.is_empty() {
        return "Nobody is around.".to_string();
    }

    let mut lines = vec![format!("{} online", report.online)];
    for user in &report.users {
        let marker = if user.is_online { "●" } else { "○" };
        let seen = match user.last_active_at {
            Some(at) if !user.is_online => format!("  last seen {}", at.format("%Y-%m-%d %H:%M")),
            _ => String::new(),
        };
        let devices = match user.sessions.len() {
            0 | 1 => String::new(),
            n => format!("  ({n} devices)"),
        };
        lines.push(format!("{marker} {} #{}{devices}{seen}", user.display_name, user.user_id));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use workshop_sync_common::types::PresenceUser;

    fn user(id: i64, name: &str, online: Option<bool>) -> PresenceUser {
        let mut user = PresenceUser::new(id);
        user.username = Some(name.into());
        user.is_online = online;
        user
    }

    fn roster(now: DateTime<Utc>) -> Vec<PresenceEntry> {
        let pulled = vec![user(1, "zeynep", Some(true)), user(2, "ali", Some(false))];
        merge_presence(&pulled, &[], now, Duration::from_secs(120))
    }

    #[test]
    fn report_counts_online_users() {
        let now = Utc::now();
        let report = PresenceReport::new(roster(now), now, false);
        assert_eq!(report.online, 1);
        assert_eq!(report.users.len(), 2);
        assert!(report.users[0].is_online);
    }

    #[test]
    fn online_filter_drops_offline_users() {
        let now = Utc::now();
        let report = PresenceReport::new(roster(now), now, true);
        assert_eq!(report.online, 1);
        assert_eq!(report.users.len(), 1);
        assert_eq!(report.users[0].user_id, 1);
    }

    #[test]
    fn human_output_marks_online_state() {
        let now = Utc::now();
        let text = format_human(&PresenceReport::new(roster(now), now, false));
        assert!(text.starts_with("1 online"));
        assert!(text.contains("● zeynep #1"));
        assert!(text.contains("○ ali #2"));
    }

    #[test]
    fn empty_roster_has_a_message() {
        let report = PresenceReport::new(Vec::new(), Utc::now(), false);
        assert_eq!(format_human(&report), "Nobody is around.");
    }
}
