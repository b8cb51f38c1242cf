//! Tile groups: fixed-capacity blocks of tuple slots
//!
//! Each slot cell holds the arena id of the newest version in the slot's
//! chain (the chain head). Slots are handed out by bumping `next_offset`
//! and are never reused.

use crate::version::VersionId;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Fixed-capacity block of slot cells
#[derive(Debug)]
pub struct TileGroup {
    id: u64,
    capacity: u32,
    next_offset: AtomicU32,
    heads: Box<[AtomicU64]>,
}

impl TileGroup {
    /// Create an empty tile group
    pub fn new(id: u64, capacity: u32) -> Self {
        let heads = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            id,
            capacity,
            next_offset: AtomicU32::new(0),
            heads,
        }
    }

    /// Tile group id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of slot cells
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots handed out so far
    pub fn allocated(&self) -> u32 {
        self.next_offset.load(Ordering::Acquire).min(self.capacity)
    }

    /// Hand out the next free offset, or `None` when the group is full
    pub fn allocate(&self) -> Option<u32> {
        let mut current = self.next_offset.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.next_offset.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark `offset` as allocated (used by recovery)
    ///
    /// Returns false if the offset lies beyond the group's capacity.
    pub fn reserve(&self, offset: u32) -> bool {
        if offset >= self.capacity {
            return false;
        }
        self.next_offset.fetch_max(offset + 1, Ordering::AcqRel);
        true
    }

    /// Chain head at `offset`
    #[inline]
    pub fn head(&self, offset: u32) -> Option<VersionId> {
        self.heads
            .get(offset as usize)
            .and_then(|cell| VersionId::from_link(cell.load(Ordering::Acquire)))
    }

    /// Swap the chain head at `offset` if it still equals `expected`
    pub fn cas_head(
        &self,
        offset: u32,
        expected: Option<VersionId>,
        new: Option<VersionId>,
    ) -> bool {
        match self.heads.get(offset as usize) {
            Some(cell) => cell
                .compare_exchange(
                    VersionId::to_link(expected),
                    VersionId::to_link(new),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok(),
            None => false,
        }
    }
}
