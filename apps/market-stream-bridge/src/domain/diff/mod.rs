//! Snapshot Diff Engine
//!
//! Compares two snapshots of the same key and produces the ordered list of
//! delta events that turns the first into the second.
//!
//! # Ordering
//!
//! A batch lists every `Delete`, then every `Update`, then every `Add`. A
//! listener applying events in sequence therefore never holds two entries for
//! a record that moved between identities within one poll (e.g. a book level
//! that shifted price).
//!
//! The engine always compares full, uncapped snapshots. Capping first would
//! turn a level that merely slid below the depth boundary into a `Delete`.

use std::collections::{HashMap, HashSet};

use super::streaming::{DeltaEvent, DeltaPayload, Snapshot, StreamKey, StreamRecord};

/// Diff two record lists of the same key.
///
/// Only `Delete`, `Update` and `Add` payloads are produced; unchanged records
/// produce nothing.
#[must_use]
pub fn diff_records<R: StreamRecord>(previous: &[R], current: &[R]) -> Vec<DeltaPayload<R>> {
    let previous_by_id: HashMap<R::Identity, &R> =
        previous.iter().map(|r| (r.identity(), r)).collect();
    let current_ids: HashSet<R::Identity> = current.iter().map(R::identity).collect();

    let mut changes: Vec<DeltaPayload<R>> = previous
        .iter()
        .filter(|r| !current_ids.contains(&r.identity()))
        .cloned()
        .map(DeltaPayload::Delete)
        .collect();

    let mut adds = Vec::new();
    for record in current {
        match previous_by_id.get(&record.identity()) {
            Some(old) if record.differs_from(old) => {
                changes.push(DeltaPayload::Update(record.clone()));
            }
            Some(_) => {}
            None => adds.push(DeltaPayload::Add(record.clone())),
        }
    }

    changes.extend(adds);
    changes
}

/// Diff two snapshots of the same key into delta events.
///
/// With no previous snapshot the result is a single `Snapshot` event holding
/// the full current state. Events carry the current snapshot's source time.
#[must_use]
pub fn diff<K: StreamKey, R: StreamRecord>(
    previous: Option<&Snapshot<K, R>>,
    current: &Snapshot<K, R>,
) -> Vec<DeltaEvent<K, R>> {
    let Some(previous) = previous else {
        return vec![DeltaEvent::new(
            current.key.clone(),
            DeltaPayload::Snapshot(current.records.clone()),
            current.source_time,
        )];
    };

    diff_records(&previous.records, &current.records)
        .into_iter()
        .map(|payload| DeltaEvent::new(current.key.clone(), payload, current.source_time))
        .collect()
}

/// Apply one delta payload to a listener-side record list.
///
/// `Snapshot` replaces the state, `Clean` clears it, `Sync` leaves it alone.
pub fn apply<R: StreamRecord>(state: &mut Vec<R>, payload: &DeltaPayload<R>) {
    match payload {
        DeltaPayload::Snapshot(records) => state.clone_from(records),
        DeltaPayload::Add(record) => state.push(record.clone()),
        DeltaPayload::Update(record) => {
            let id = record.identity();
            if let Some(slot) = state.iter_mut().find(|r| r.identity() == id) {
                slot.clone_from(record);
            }
        }
        DeltaPayload::Delete(record) => {
            let id = record.identity();
            state.retain(|r| r.identity() != id);
        }
        DeltaPayload::Clean => state.clear(),
        DeltaPayload::Sync => {}
    }
}

// =============================================================================
// Tests
// =============================================================================
