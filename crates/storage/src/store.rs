//! Version store: tile groups, chain heads and the version arena
//!
//! # Design
//!
//! - Tile groups are append-only; a group is never removed
//! - Each slot cell holds the id of its chain head (newest version)
//! - New versions are linked at the head with a CAS on the slot cell
//! - Readers walk `head -> older -> ...` without taking any lock
//!
//! The store enforces no visibility policy. Ownership claims, commit
//! stamping and rollback belong to the transaction manager.

use crate::gc::VersionCollector;
use crate::tile_group::TileGroup;
use crate::version::{TupleVersion, VersionArena, VersionId};
use parking_lot::RwLock;
use std::sync::Arc;
use tessera_core::{CommitId, Tuple, TupleSlot, TxnId};
use tracing::{debug, trace};

/// Default number of slots per tile group
pub const DEFAULT_TILE_GROUP_CAPACITY: u32 = 1024;

/// Shared store of every tuple version chain
#[derive(Debug)]
pub struct VersionStore {
    tile_group_capacity: u32,
    tile_groups: RwLock<Vec<Arc<TileGroup>>>,
    arena: VersionArena,
    collector: VersionCollector,
}

impl VersionStore {
    /// Create an empty store
    pub fn new(tile_group_capacity: u32) -> Self {
        Self {
            tile_group_capacity: tile_group_capacity.max(1),
            tile_groups: RwLock::new(Vec::new()),
            arena: VersionArena::new(),
            collector: VersionCollector::new(),
        }
    }

    /// Slots per tile group
    pub fn tile_group_capacity(&self) -> u32 {
        self.tile_group_capacity
    }

    /// Number of tile groups created so far
    pub fn tile_group_count(&self) -> usize {
        self.tile_groups.read().len()
    }

    /// Number of versions held in the arena
    pub fn version_count(&self) -> usize {
        self.arena.len()
    }

    /// Hand out a fresh, empty slot
    pub fn allocate_slot(&self) -> TupleSlot {
        loop {
            {
                let groups = self.tile_groups.read();
                if let Some(group) = groups.last() {
                    if let Some(offset) = group.allocate() {
                        return TupleSlot::new(group.id(), offset);
                    }
                }
            }

            let mut groups = self.tile_groups.write();
            let full = groups
                .last()
                .map_or(true, |g| g.allocated() >= g.capacity());
            if full {
                let id = groups.len() as u64;
                groups.push(Arc::new(TileGroup::new(id, self.tile_group_capacity)));
                debug!(tile_group_id = id, "Created tile group");
            }
        }
    }

    /// Tile group by id
    pub fn tile_group(&self, id: u64) -> Option<Arc<TileGroup>> {
        self.tile_groups.read().get(id as usize).cloned()
    }

    /// Whether `slot` has been handed out
    pub fn contains_slot(&self, slot: TupleSlot) -> bool {
        self.tile_group(slot.tile_group_id)
            .map_or(false, |g| slot.offset < g.allocated())
    }

    /// Make sure `slot` exists, creating tile groups as needed
    ///
    /// Used when replaying the log, where slots arrive in arbitrary order.
    /// Returns false if the offset does not fit the configured capacity.
    pub fn ensure_slot(&self, slot: TupleSlot) -> bool {
        if slot.offset >= self.tile_group_capacity {
            return false;
        }
        if let Some(group) = self.tile_group(slot.tile_group_id) {
            return group.reserve(slot.offset);
        }

        let mut groups = self.tile_groups.write();
        while groups.len() as u64 <= slot.tile_group_id {
            let id = groups.len() as u64;
            groups.push(Arc::new(TileGroup::new(id, self.tile_group_capacity)));
        }
        groups[slot.tile_group_id as usize].reserve(slot.offset)
    }

    /// Id of the chain head at `slot`
    #[inline]
    pub fn head_id(&self, slot: TupleSlot) -> Option<VersionId> {
        self.tile_group(slot.tile_group_id)
            .and_then(|g| g.head(slot.offset))
    }

    /// Newest version at `slot`
    pub fn head(&self, slot: TupleSlot) -> Option<Arc<TupleVersion>> {
        self.head_id(slot).and_then(|id| self.arena.get(id))
    }

    /// Version by id
    #[inline]
    pub fn version(&self, id: VersionId) -> Option<Arc<TupleVersion>> {
        self.arena.get(id)
    }

    /// Iterate the chain at `slot` from newest to oldest
    pub fn chain(&self, slot: TupleSlot) -> ChainIter<'_> {
        ChainIter {
            store: self,
            next: self.head(slot),
        }
    }

    /// Swap the chain head at `slot` if it still equals `expected`
    pub fn cas_head(
        &self,
        slot: TupleSlot,
        expected: Option<VersionId>,
        new: Option<VersionId>,
    ) -> bool {
        self.tile_group(slot.tile_group_id)
            .map_or(false, |g| g.cas_head(slot.offset, expected, new))
    }

    /// Create an uncommitted version owned by `txn`, not yet linked
    pub fn alloc_pending(
        &self,
        slot: TupleSlot,
        txn: TxnId,
        data: Option<Tuple>,
        older: Option<VersionId>,
    ) -> Arc<TupleVersion> {
        let version = self.arena.alloc_pending(slot, txn, data, older);
        trace!(%slot, txn, version = version.id().0, "Allocated pending version");
        version
    }

    /// Drop a version that was never reachable from a chain
    pub fn discard(&self, id: VersionId) {
        self.arena.remove(id);
    }

    /// Install a committed version as the new head of `slot` (recovery)
    ///
    /// The previous head, if any, is dropped: after a restart no reader can
    /// observe a snapshot older than the recovered state.
    pub fn install_recovered(
        &self,
        slot: TupleSlot,
        data: Option<Tuple>,
        cid: CommitId,
    ) -> bool {
        if !self.ensure_slot(slot) {
            return false;
        }
        let previous = self.head_id(slot);
        let version = self.arena.alloc_committed(slot, cid, data, None);
        if !self.cas_head(slot, previous, Some(version.id())) {
            self.arena.remove(version.id());
            return false;
        }
        if let Some(prev) = previous {
            self.arena.remove(prev);
        }
        true
    }

    /// Retire a version unlinked or superseded at `epoch`
    pub fn retire(&self, id: VersionId, epoch: CommitId) {
        self.collector.retire(id, epoch);
    }

    /// Reclaim retired versions older than `watermark`
    pub fn collect(&self, watermark: CommitId) -> usize {
        self.collector.collect(watermark, &self.arena)
    }

    /// Number of retired versions not yet reclaimed
    pub fn pending_garbage(&self) -> usize {
        self.collector.pending()
    }

    /// `[begin, end)` intervals of committed versions at `slot`, newest first
    pub fn committed_intervals(&self, slot: TupleSlot) -> Vec<(CommitId, CommitId)> {
        self.chain(slot)
            .filter(|v| v.is_committed())
            .map(|v| (v.begin_cid(), v.end_cid()))
            .collect()
    }

    /// Unlink `version` from the head of its chain
    ///
    /// The caller must own `version`, which guarantees it is still the head.
    /// The version keeps its `older` link so that a reader already holding it
    /// still reaches the restored head.
    pub fn unlink_head(&self, version: &TupleVersion) -> bool {
        self.cas_head(version.slot(), Some(version.id()), version.older())
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_GROUP_CAPACITY)
    }
}

/// Newest-to-oldest walk over one version chain
///
/// Stops at the oldest version or at the first link whose target has been
/// reclaimed.
pub struct ChainIter<'a> {
    store: &'a VersionStore,
    next: Option<Arc<TupleVersion>>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = Arc<TupleVersion>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.older().and_then(|id| self.store.version(id));
        Some(current)
    }
}
