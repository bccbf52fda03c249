// Shared record collections with optimistic edits.
//
// `RecordCollection` is the one interface views use: it holds the local copy
// of a collection plus its pending-edit locks, and funnels every snapshot,
// page and push payload through the merge engine.

pub mod locks;
pub mod reconcile;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use workshop_sync_common::types::RecordId;

pub use locks::FieldLockTable;

/// One row of a shared collection (order, task, chat message, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedRecord {
    pub id: RecordId,
    /// Every attribute except `id`, `version` and `updated_at`.
    pub fields: Map<String, Value>,
    pub version: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic insert not yet confirmed by the server.
    pub local_only: bool,
}

impl SharedRecord {
    pub fn new(id: RecordId) -> Self {
        Self { id, fields: Map::new(), version: None, updated_at: None, local_only: false }
    }

    /// Optimistic record with a placeholder id.
    pub fn local(fields: Map<String, Value>) -> Self {
        Self {
            id: RecordId::new_local(),
            fields,
            version: None,
            updated_at: None,
            local_only: true,
        }
    }

    /// Parse a server JSON object. Requires an integer `id`; `version` and
    /// `updated_at` are lifted out of the field map when present.
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let id = object.get("id")?.as_i64()?;
        let mut fields = object.clone();
        fields.remove("id");
        let version = fields.remove("version").and_then(|v| v.as_i64());
        let updated_at = fields
            .remove("updated_at")
            .and_then(|v| v.as_str().and_then(parse_timestamp));
        Some(Self { id: RecordId::from(id), fields, version, updated_at, local_only: false })
    }

    pub fn to_json(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("id".into(), serde_json::to_value(&self.id).unwrap_or(Value::Null));
        if let Some(version) = self.version {
            object.insert("version".into(), Value::from(version));
        }
        if let Some(updated_at) = self.updated_at {
            object.insert("updated_at".into(), Value::from(updated_at.to_rfc3339()));
        }
        Value::Object(object)
    }

    /// True if `self` is at least as new as `other`: `version` when both carry
    /// one, `updated_at` otherwise.
    pub fn supersedes(&self, other: &SharedRecord) -> bool {
        match (self.version, other.version) {
            (Some(mine), Some(theirs)) => mine >= theirs,
            _ => self.updated_at >= other.updated_at,
        }
    }

    /// True only when both sides carry the same kind of signal and `self`'s
    /// is newer. A record with no comparable signal never shadows another.
    pub fn supersedes_strictly(&self, other: &SharedRecord) -> bool {
        match (self.version, other.version, self.updated_at, other.updated_at) {
            (Some(mine), Some(theirs), _, _) => mine > theirs,
            (_, _, Some(mine), Some(theirs)) => mine > theirs,
            _ => false,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse a push payload or a page body into records: a single object, an
/// array, or an object wrapping an `items` array.
pub fn records_from_payload(payload: &Value) -> Vec<SharedRecord> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(object) => match object.get("items") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => std::slice::from_ref(payload),
        },
        _ => &[],
    };
    items.iter().filter_map(SharedRecord::from_json).collect()
}

/// What a domain update did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Merged(usize),
    Removed(bool),
    Ignored,
}

// ── Collection ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RecordCollection {
    records: Vec<SharedRecord>,
    locks: FieldLockTable,
}

impl RecordCollection {
    pub fn new(lock_ttl: Duration) -> Self {
        Self { records: Vec::new(), locks: FieldLockTable::new(lock_ttl) }
    }

    pub fn records(&self) -> &[SharedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, id: &RecordId) -> Option<&SharedRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn locks(&self) -> &FieldLockTable {
        &self.locks
    }

    // ── Edits ───────────────────────────────────────────────────────

    pub fn begin_edit(&mut self, id: &RecordId, field: &str) {
        self.locks.begin_edit(id, field);
    }

    pub fn end_edit(&mut self, id: &RecordId, field: &str) {
        self.locks.end_edit(id, field);
    }

    /// Apply a local edit and lock the field until the persist completes.
    /// Returns `false` if the record is unknown.
    pub fn edit_field(&mut self, id: &RecordId, field: &str, value: Value) -> bool {
        self.edit_field_at(id, field, value, Instant::now())
    }

    pub fn edit_field_at(
        &mut self,
        id: &RecordId,
        field: &str,
        value: Value,
        now: Instant,
    ) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| &r.id == id) else {
            return false;
        };
        record.fields.insert(field.to_string(), value);
        self.locks.begin_edit_at(id, field, now);
        true
    }

    // ── Optimistic inserts ──────────────────────────────────────────

    /// Add a local-only record ahead of the confirmed ones.
    pub fn insert_local(&mut self, fields: Map<String, Value>) -> RecordId {
        let record = SharedRecord::local(fields);
        let id = record.id.clone();
        let position = self.records.iter().take_while(|r| r.local_only).count();
        self.records.insert(position, record);
        id
    }

    /// Replace a placeholder with the server's record. Locks taken on the
    /// placeholder move to the new id.
    pub fn confirm_local(&mut self, placeholder: &RecordId, mut confirmed: SharedRecord) -> bool {
        let Some(index) = self.records.iter().position(|r| &r.id == placeholder) else {
            return false;
        };
        confirmed.local_only = false;
        self.locks.rekey(placeholder, &confirmed.id);

        let local = self.records.remove(index);
        let locked = self.locks.locked_fields_at(&confirmed.id, Instant::now());
        for field in locked {
            if let Some(value) = local.fields.get(&field) {
                confirmed.fields.insert(field, value.clone());
            }
        }

        // The server record may already have arrived through a push.
        self.records.retain(|r| r.id != confirmed.id);
        let position = self.records.iter().take_while(|r| r.local_only).count();
        self.records.insert(position, confirmed);
        true
    }

    /// Roll back a failed optimistic insert.
    pub fn discard_local(&mut self, placeholder: &RecordId) -> Option<SharedRecord> {
        let index = self.records.iter().position(|r| &r.id == placeholder && r.local_only)?;
        self.locks.forget(placeholder);
        Some(self.records.remove(index))
    }

    // ── Merges ──────────────────────────────────────────────────────

    /// Replace the collection with a full snapshot.
    pub fn reconcile(&mut self, incoming: Vec<SharedRecord>) {
        self.reconcile_at(incoming, Instant::now());
    }

    pub fn reconcile_at(&mut self, incoming: Vec<SharedRecord>, now: Instant) {
        self.locks.prune_at(now);
        self.records = reconcile::reconcile(&self.records, incoming, &self.locks, now);
    }

    pub fn merge_page(&mut self, page: Vec<SharedRecord>) -> usize {
        self.merge_page_at(page, Instant::now())
    }

    pub fn merge_page_at(&mut self, page: Vec<SharedRecord>, now: Instant) -> usize {
        self.locks.prune_at(now);
        reconcile::merge_page(&mut self.records, page, &self.locks, now)
    }

    /// Apply a confirmed deletion.
    pub fn remove(&mut self, id: &RecordId) -> Option<SharedRecord> {
        let index = self.records.iter().position(|r| &r.id == id)?;
        self.locks.forget(id);
        Some(self.records.remove(index))
    }

    /// Apply a `<domain>:update` push. `deleted`/`removed` events carry the id
    /// of the gone record; anything else carries one or more records.
    pub fn apply_domain_update(&mut self, event: &str, payload: &Value) -> PushOutcome {
        let outcome = match event {
            "deleted" | "removed" => {
                let id = payload.get("id").and_then(Value::as_i64).or_else(|| payload.as_i64());
                match id {
                    Some(id) => PushOutcome::Removed(self.remove(&RecordId::from(id)).is_some()),
                    None => PushOutcome::Ignored,
                }
            }
            _ => {
                let records = records_from_payload(payload);
                if records.is_empty() {
                    PushOutcome::Ignored
                } else {
                    PushOutcome::Merged(self.merge_page(records))
                }
            }
        };
        debug!(event, ?outcome, "domain update applied");
        outcome
    }
}
