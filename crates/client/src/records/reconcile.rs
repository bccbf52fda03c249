// Snapshot merge engine.
//
// Incoming wins unless a field is locked. Records are matched by id, never by
// position, so the same snapshot can be applied twice with the same result.

use std::collections::HashMap;
use std::time::Instant;

use workshop_sync_common::types::RecordId;

use super::locks::FieldLockTable;
use super::SharedRecord;

/// Collapse duplicate ids, keeping the entry with the highest version signal
/// (later occurrence on ties). Order of first occurrence is preserved.
pub fn dedupe(incoming: Vec<SharedRecord>) -> Vec<SharedRecord> {
    let mut slots: HashMap<RecordId, usize> = HashMap::with_capacity(incoming.len());
    let mut out: Vec<SharedRecord> = Vec::with_capacity(incoming.len());
    for record in incoming {
        match slots.get(&record.id) {
            Some(&slot) => {
                if record.supersedes(&out[slot]) {
                    out[slot] = record;
                }
            }
            None => {
                slots.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Keep the local value (or local absence) of every locked field.
fn shield(mut incoming: SharedRecord, local: &SharedRecord, locked: &[String]) -> SharedRecord {
    for field in locked {
        match local.fields.get(field) {
            Some(value) => {
                incoming.fields.insert(field.clone(), value.clone());
            }
            None => {
                incoming.fields.remove(field);
            }
        }
    }
    incoming
}

/// Reconcile a full snapshot with the local collection.
///
/// - local-only records are kept verbatim, first, in local order;
/// - other local records missing from `incoming` count as deleted;
/// - everything else comes from `incoming` (deduplicated, first-occurrence
///   order) with locked fields taken from the local copy.
pub fn reconcile(
    local: &[SharedRecord],
    incoming: Vec<SharedRecord>,
    locks: &FieldLockTable,
    now: Instant,
) -> Vec<SharedRecord> {
    let by_id: HashMap<&RecordId, &SharedRecord> =
        local.iter().filter(|r| !r.local_only).map(|r| (&r.id, r)).collect();

    let mut merged: Vec<SharedRecord> = local.iter().filter(|r| r.local_only).cloned().collect();
    let pending = merged.len();

    for record in dedupe(incoming) {
        if merged[..pending].iter().any(|r| r.id == record.id) {
            continue;
        }
        let record = match by_id.get(&record.id) {
            Some(current) => {
                let locked = locks.locked_fields_at(&record.id, now);
                if locked.is_empty() {
                    record
                } else {
                    shield(record, current, &locked)
                }
            }
            None => record,
        };
        merged.push(record);
    }
    merged
}

/// Apply a partial snapshot (one page or a push payload) as an upsert.
///
/// Same lock and dedupe rules as `reconcile`, but nothing is deleted: known
/// records are updated in place, unknown ones appended in page order. An
/// entry older than the local copy is skipped.
pub fn merge_page(
    local: &mut Vec<SharedRecord>,
    page: Vec<SharedRecord>,
    locks: &FieldLockTable,
    now: Instant,
) -> usize {
    let mut applied = 0;
    for record in dedupe(page) {
        match local.iter().position(|r| r.id == record.id) {
            Some(index) => {
                if local[index].local_only || local[index].supersedes_strictly(&record) {
                    continue;
                }
                let locked = locks.locked_fields_at(&record.id, now);
                let merged = shield(record, &local[index], &locked);
                local[index] = merged;
            }
            None => local.push(record),
        }
        applied += 1;
    }
    applied
}
