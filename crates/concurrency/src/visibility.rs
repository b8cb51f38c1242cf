//! Version visibility
//!
//! A reader walks a chain newest to oldest and returns the first version
//! it may see:
//!
//! - its own uncommitted version, unless that version is a delete
//! - a committed version with `begin <= read_ts < end`
//!
//! Other transactions' uncommitted versions are skipped.

use tessera_core::{CommitId, Tuple, TupleSlot, TxnId};
use tessera_storage::{TupleVersion, VersionStore};
use std::sync::Arc;

/// Whether `version` is visible to `txn` reading at `read_ts`
pub fn is_visible(version: &TupleVersion, txn: TxnId, read_ts: CommitId) -> bool {
    if version.is_own_pending(txn) {
        return !version.is_tombstone();
    }
    version.is_visible_at(read_ts)
}

/// The version of `slot` that `txn` sees at `read_ts`
///
/// Own writes shadow everything older, including an own delete.
pub fn visible_version(
    store: &VersionStore,
    slot: TupleSlot,
    txn: TxnId,
    read_ts: CommitId,
) -> Option<Arc<TupleVersion>> {
    for version in store.chain(slot) {
        if version.is_own_pending(txn) {
            return if version.is_tombstone() {
                None
            } else {
                Some(version)
            };
        }
        if version.is_visible_at(read_ts) {
            return if version.is_tombstone() {
                None
            } else {
                Some(version)
            };
        }
    }
    None
}

/// Contents of `slot` as seen by `txn` at `read_ts`
pub fn read_visible(
    store: &VersionStore,
    slot: TupleSlot,
    txn: TxnId,
    read_ts: CommitId,
) -> Option<Tuple> {
    visible_version(store, slot, txn, read_ts).and_then(|v| v.data().cloned())
}
