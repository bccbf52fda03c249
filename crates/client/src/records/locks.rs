// Pending-edit locks.
//
// A lock marks one field of one record as "edit in flight". It shields the
// local value from incoming snapshots until it is released or outlives the
// TTL; an expired lock is ignored whether or not anyone released it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use workshop_sync_common::types::RecordId;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LockKey {
    record_id: RecordId,
    field: String,
}

#[derive(Debug, Clone)]
pub struct FieldLockTable {
    ttl: Duration,
    locks: HashMap<LockKey, Instant>,
}

impl Default for FieldLockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TTL)
    }
}

impl FieldLockTable {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, locks: HashMap::new() }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn begin_edit(&mut self, record_id: &RecordId, field: &str) {
        self.begin_edit_at(record_id, field, Instant::now());
    }

    /// Stamp (or re-stamp) the lock. A second edit of the same field restarts
    /// its TTL.
    pub fn begin_edit_at(&mut self, record_id: &RecordId, field: &str, now: Instant) {
        self.locks.insert(key(record_id, field), now);
    }

    /// Release after a successful persist. Failed persists leave the lock to
    /// run out its TTL.
    pub fn end_edit(&mut self, record_id: &RecordId, field: &str) {
        self.locks.remove(&key(record_id, field));
    }

    pub fn is_locked(&self, record_id: &RecordId, field: &str) -> bool {
        self.is_locked_at(record_id, field, Instant::now())
    }

    pub fn is_locked_at(&self, record_id: &RecordId, field: &str, now: Instant) -> bool {
        self.locks
            .get(&key(record_id, field))
            .is_some_and(|locked_at| now.saturating_duration_since(*locked_at) < self.ttl)
    }

    /// Fields of `record_id` with an unexpired lock.
    pub fn locked_fields_at(&self, record_id: &RecordId, now: Instant) -> Vec<String> {
        let mut fields: Vec<String> = self
            .locks
            .iter()
            .filter(|(key, locked_at)| {
                &key.record_id == record_id
                    && now.saturating_duration_since(**locked_at) < self.ttl
            })
            .map(|(key, _)| key.field.clone())
            .collect();
        fields.sort();
        fields
    }

    /// Move every lock held on `from` to `to` (placeholder id confirmed).
    pub fn rekey(&mut self, from: &RecordId, to: &RecordId) {
        let moved: Vec<(LockKey, Instant)> = self
            .locks
            .iter()
            .filter(|(key, _)| &key.record_id == from)
            .map(|(key, locked_at)| (key.clone(), *locked_at))
            .collect();
        for (old, locked_at) in moved {
            self.locks.remove(&old);
            self.locks.insert(key(to, &old.field), locked_at);
        }
    }

    /// Drop every lock on `record_id`.
    pub fn forget(&mut self, record_id: &RecordId) {
        self.locks.retain(|key, _| &key.record_id != record_id);
    }

    /// Remove expired locks. Returns how many were dropped.
    pub fn prune_at(&mut self, now: Instant) -> usize {
        let before = self.locks.len();
        let ttl = self.ttl;
        self.locks.retain(|_, locked_at| now.saturating_duration_since(*locked_at) < ttl);
        before - self.locks.len()
    }
}

fn key(record_id: &RecordId, field: &str) -> LockKey {
    LockKey { record_id: record_id.clone(), field: field.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_holds_until_ttl() {
        let mut table = FieldLockTable::new(Duration::from_secs(8));
        let id = RecordId::from(42);
        let t0 = Instant::now();
        table.begin_edit_at(&id, "note", t0);

        assert!(table.is_locked_at(&id, "note", t0 + Duration::from_millis(7_999)));
        assert!(!table.is_locked_at(&id, "note", t0 + Duration::from_secs(8)));
        assert!(!table.is_locked_at(&id, "status", t0));
        assert!(!table.is_locked_at(&RecordId::from(43), "note", t0));
    }

    #[test]
    fn end_edit_releases_immediately() {
        let mut table = FieldLockTable::default();
        let id = RecordId::from(1);
        let t0 = Instant::now();
        table.begin_edit_at(&id, "note", t0);
        table.end_edit(&id, "note");
        assert!(!table.is_locked_at(&id, "note", t0));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn re_edit_restarts_ttl() {
        let mut table = FieldLockTable::new(Duration::from_secs(8));
        let id = RecordId::from(1);
        let t0 = Instant::now();
        table.begin_edit_at(&id, "note", t0);
        table.begin_edit_at(&id, "note", t0 + Duration::from_secs(6));
        assert!(table.is_locked_at(&id, "note", t0 + Duration::from_secs(12)));
    }

    #[test]
    fn rekey_carries_locks_to_confirmed_id() {
        let mut table = FieldLockTable::default();
        let placeholder = RecordId::new_local();
        let confirmed = RecordId::from(501);
        let t0 = Instant::now();
        table.begin_edit_at(&placeholder, "title", t0);
        table.begin_edit_at(&RecordId::from(7), "title", t0);

        table.rekey(&placeholder, &confirmed);
        assert!(!table.is_locked_at(&placeholder, "title", t0));
        assert!(table.is_locked_at(&confirmed, "title", t0));
        assert_eq!(table.locked_fields_at(&confirmed, t0), vec!["title".to_string()]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn prune_drops_only_expired() {
        let mut table = FieldLockTable::new(Duration::from_secs(8));
        let t0 = Instant::now();
        table.begin_edit_at(&RecordId::from(1), "a", t0);
        table.begin_edit_at(&RecordId::from(1), "b", t0 + Duration::from_secs(5));

        assert_eq!(table.prune_at(t0 + Duration::from_secs(9)), 1);
        assert_eq!(table.locked_fields_at(&RecordId::from(1), t0 + Duration::from_secs(9)), vec![
            "b".to_string()
        ]);

        table.forget(&RecordId::from(1));
        assert_eq!(table.len(), 0);
    }
}
