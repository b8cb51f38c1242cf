//! Tuple lock table for two-phase locking
//!
//! Shared and exclusive locks keyed by tuple slot. A shared lock held alone
//! upgrades to exclusive in place. Locks are held until the owning
//! transaction commits or aborts (strict 2PL); read-committed readers may
//! drop a shared lock right after the read.
//!
//! # Deadlocks
//!
//! A blocked request records wait-for edges to the current holders and
//! searches the graph for a cycle before sleeping. The transaction with the
//! lowest id on the cycle is the victim: if that is the requester it fails
//! at once, otherwise the victim is flagged and woken so it fails out of its
//! own wait. Every request also carries a deadline and fails with
//! `LockTimeout` when it expires.

use crate::registry::{ActiveTransactionRegistry, TxnHandle};
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::time::{Duration, Instant};
use tessera_core::{Error, Result, TupleSlot, TxnId};
use tracing::{debug, warn};

/// Default time a lock request may wait
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Any number of readers
    Shared,
    /// One writer
    Exclusive,
}

#[derive(Debug)]
struct LockEntry {
    holders: SmallVec<[TxnId; 4]>,
    mode: LockMode,
}

enum Grant {
    Granted,
    Blocked(FxHashSet<TxnId>),
}

#[derive(Debug, Default)]
struct LockTableState {
    entries: FxHashMap<TupleSlot, LockEntry>,
    held: FxHashMap<TxnId, FxHashSet<TupleSlot>>,
    waits_for: FxHashMap<TxnId, FxHashSet<TxnId>>,
}

impl LockTableState {
    fn try_grant(&mut self, txn: TxnId, slot: TupleSlot, mode: LockMode) -> Grant {
        match self.entries.get_mut(&slot) {
            None => {
                let mut holders = SmallVec::new();
                holders.push(txn);
                self.entries.insert(slot, LockEntry { holders, mode });
            }
            Some(entry) if entry.holders.contains(&txn) => {
                if mode == LockMode::Exclusive && entry.mode == LockMode::Shared {
                    if entry.holders.len() > 1 {
                        return Grant::Blocked(
                            entry.holders.iter().copied().filter(|h| *h != txn).collect(),
                        );
                    }
                    entry.mode = LockMode::Exclusive;
                }
            }
            Some(entry) => {
                if mode == LockMode::Exclusive || entry.mode == LockMode::Exclusive {
                    return Grant::Blocked(entry.holders.iter().copied().collect());
                }
                entry.holders.push(txn);
            }
        }
        self.held.entry(txn).or_default().insert(slot);
        Grant::Granted
    }

    fn release_slot(&mut self, txn: TxnId, slot: TupleSlot) {
        if let Some(entry) = self.entries.get_mut(&slot) {
            entry.holders.retain(|h| *h != txn);
            if entry.holders.is_empty() {
                self.entries.remove(&slot);
            }
        }
    }

    /// Transactions on a wait-for cycle through `start`, if any
    fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut stack: Vec<(TxnId, Vec<TxnId>)> = vec![(start, vec![start])];
        let mut visited: FxHashSet<TxnId> = FxHashSet::default();
        while let Some((node, path)) = stack.pop() {
            let Some(edges) = self.waits_for.get(&node) else {
                continue;
            };
            for &next in edges {
                if next == start {
                    return Some(path);
                }
                if visited.insert(next) {
                    let mut extended = path.clone();
                    extended.push(next);
                    stack.push((next, extended));
                }
            }
        }
        None
    }
}

/// Slot lock table with deadlock detection
#[derive(Debug)]
pub struct LockTable {
    state: Mutex<LockTableState>,
    released: Condvar,
    timeout: Duration,
}

impl LockTable {
    /// Create a lock table whose requests wait at most `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LockTableState::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire `slot` in `mode` for `txn`, blocking while it conflicts
    ///
    /// # Errors
    ///
    /// - `Deadlock` if `txn` is chosen as victim, here or by another waiter
    /// - `LockTimeout` if the lock is not granted before the deadline
    pub fn acquire(
        &self,
        txn: &TxnHandle,
        slot: TupleSlot,
        mode: LockMode,
        registry: &ActiveTransactionRegistry,
    ) -> Result<()> {
        let id = txn.id();
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut state = self.state.lock();

        loop {
            if txn.is_doomed() {
                state.waits_for.remove(&id);
                return Err(Error::Deadlock { victim: id });
            }

            let blockers = match state.try_grant(id, slot, mode) {
                Grant::Granted => {
                    state.waits_for.remove(&id);
                    return Ok(());
                }
                Grant::Blocked(blockers) => blockers,
            };
            state.waits_for.insert(id, blockers);

            if let Some(cycle) = state.find_cycle(id) {
                let victim = cycle.iter().copied().min().unwrap_or(id);
                warn!(victim, ?cycle, %slot, "Deadlock detected");
                if victim == id {
                    state.waits_for.remove(&id);
                    return Err(Error::Deadlock { victim });
                }
                state.waits_for.remove(&victim);
                if let Some(handle) = registry.get(victim) {
                    handle.doom();
                }
                self.released.notify_all();
            }

            if self.released.wait_until(&mut state, deadline).timed_out() {
                if let Grant::Granted = state.try_grant(id, slot, mode) {
                    state.waits_for.remove(&id);
                    return Ok(());
                }
                state.waits_for.remove(&id);
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                debug!(txn_id = id, %slot, waited_ms, "Lock request timed out");
                return Err(Error::LockTimeout { slot, waited_ms });
            }
        }
    }

    /// Drop a shared lock early if `txn` holds `slot` only in shared mode
    pub fn release_shared(&self, txn: TxnId, slot: TupleSlot) {
        let mut state = self.state.lock();
        let shared = state
            .entries
            .get(&slot)
            .map_or(false, |e| e.mode == LockMode::Shared && e.holders.contains(&txn));
        if !shared {
            return;
        }
        state.release_slot(txn, slot);
        if let Some(held) = state.held.get_mut(&txn) {
            held.remove(&slot);
        }
        drop(state);
        self.released.notify_all();
    }

    /// Release every lock `txn` holds and wake all waiters
    pub fn release_all(&self, txn: TxnId) {
        let mut state = self.state.lock();
        if let Some(slots) = state.held.remove(&txn) {
            for slot in slots {
                state.release_slot(txn, slot);
            }
        }
        state.waits_for.remove(&txn);
        drop(state);
        self.released.notify_all();
    }

    /// Mode `txn` holds on `slot`, if any
    pub fn held_mode(&self, txn: TxnId, slot: TupleSlot) -> Option<LockMode> {
        let state = self.state.lock();
        state
            .entries
            .get(&slot)
            .filter(|e| e.holders.contains(&txn))
            .map(|e| e.mode)
    }

    /// Number of slots with at least one holder
    pub fn locked_slots(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}
