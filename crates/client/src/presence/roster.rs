// Online roster: merges the periodic presence pull with pushed updates.
//
// The pull is the baseline; push entries overlay it field by field, so a push
// that only carries `online` never erases a pulled name or avatar.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use workshop_sync_common::types::{PresenceSession, PresenceUser, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceSource {
    Pull,
    Push,
}

/// One row of the merged roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub sessions: Vec<PresenceSession>,
    pub sources: Vec<PresenceSource>,
}

fn overlay(base: &mut PresenceUser, update: &PresenceUser) {
    if update.username.is_some() {
        base.username = update.username.clone();
    }
    if update.full_name.is_some() {
        base.full_name = update.full_name.clone();
    }
    if update.avatar.is_some() {
        base.avatar = update.avatar.clone();
    }
    if update.is_online.is_some() {
        base.is_online = update.is_online;
    }
    if update.last_active.is_some() {
        base.last_active = update.last_active;
    }
    if !update.presence.is_empty() {
        base.presence = update.presence.clone();
    }
}

fn is_fresh(seen: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(seen) = seen else {
        return false;
    };
    // A timestamp slightly ahead of our clock still counts as fresh.
    (now - seen).to_std().map_or(true, |age| age <= window)
}

/// Merge pulled and pushed presence into a roster sorted online-first, then by
/// display name.
///
/// A user is online when the server says so explicitly, or when their last
/// activity or any session was seen within `window`.
pub fn merge_presence(
    pull: &[PresenceUser],
    push: &[PresenceUser],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<PresenceEntry> {
    let mut merged: BTreeMap<UserId, (PresenceUser, Vec<PresenceSource>)> = BTreeMap::new();

    for user in pull {
        merged.insert(user.id, (user.clone(), vec![PresenceSource::Pull]));
    }
    for user in push {
        match merged.get_mut(&user.id) {
            Some((base, sources)) => {
                overlay(base, user);
                if !sources.contains(&PresenceSource::Push) {
                    sources.push(PresenceSource::Push);
                }
            }
            None => {
                merged.insert(user.id, (user.clone(), vec![PresenceSource::Push]));
            }
        }
    }

    let mut roster: Vec<PresenceEntry> = merged
        .into_values()
        .map(|(user, sources)| {
            let is_online = user.is_online == Some(true)
                || is_fresh(user.last_active, now, window)
                || user.presence.iter().any(|session| is_fresh(session.last_seen, now, window));
            PresenceEntry {
                user_id: user.id,
                display_name: user.display_name(),
                avatar: user.avatar.clone(),
                is_online,
                last_active_at: user.last_active,
                sessions: user.presence,
                sources,
            }
        })
        .collect();

    roster.sort_by(|a, b| {
        b.is_online
            .cmp(&a.is_online)
            .then_with(|| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    roster
}
