// Typing indicators. Each `chat:typing` push replaces the sender's entry and
// pushes its expiry out by the TTL; the coordinator's sweep drops the rest.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use workshop_sync_common::protocol::push::TypingNotice;
use workshop_sync_common::types::UserId;

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingIndicator {
    pub user_id: UserId,
    pub display_name: String,
    pub expires_at: Instant,
}

/// What views render: who is typing, without timer state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTyper {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct TypingTracker {
    ttl: Duration,
    entries: HashMap<UserId, TypingIndicator>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TTL)
    }
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new() }
    }

    pub fn register_at(&mut self, notice: &TypingNotice, now: Instant) {
        let display_name = match notice.sender.trim() {
            "" => format!("User {}", notice.sender_id),
            name => name.to_string(),
        };
        self.entries.insert(
            notice.sender_id,
            TypingIndicator { user_id: notice.sender_id, display_name, expires_at: now + self.ttl },
        );
    }

    /// The user sent a message; their indicator is no longer meaningful.
    pub fn clear(&mut self, user_id: UserId) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Drop expired entries. Returns whether anything changed.
    pub fn prune_at(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.len() != before
    }

    /// Unexpired typers sorted by name, never including `exclude`.
    pub fn active_typers_at(&self, exclude: Option<UserId>, now: Instant) -> Vec<ActiveTyper> {
        let mut typers: Vec<ActiveTyper> = self
            .entries
            .values()
            .filter(|entry| entry.expires_at > now && Some(entry.user_id) != exclude)
            .map(|entry| ActiveTyper {
                user_id: entry.user_id,
                display_name: entry.display_name.clone(),
            })
            .collect();
        typers.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.user_id.cmp(&b.user_id)));
        typers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
