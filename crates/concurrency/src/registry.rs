//! Active transaction registry
//!
//! Every transaction is registered from `begin` until its commit or abort
//! completes. The registry answers two questions for the rest of the
//! manager: which transactions are live (for deadlock victim selection) and
//! what is the oldest snapshot still in use (for version reclamation).

use crate::transaction::TransactionStatus;
use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tessera_core::{CommitId, IsolationLevel, TxnId};

/// Shared, thread-safe view of one live transaction
///
/// The owning `TransactionContext` is single-threaded; this handle is the
/// part other threads may look at.
#[derive(Debug)]
pub struct TxnHandle {
    id: TxnId,
    start_cid: CommitId,
    isolation: IsolationLevel,
    status: AtomicU8,
    doomed: AtomicBool,
}

impl TxnHandle {
    pub(crate) fn new(id: TxnId, start_cid: CommitId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            start_cid,
            isolation,
            status: AtomicU8::new(TransactionStatus::Active.as_u8()),
            doomed: AtomicBool::new(false),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Last commit id published when the transaction began
    pub fn start_cid(&self) -> CommitId {
        self.start_cid
    }

    /// Isolation level
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Whether a deadlock detector picked this transaction as victim
    pub fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Acquire)
    }

    pub(crate) fn doom(&self) {
        self.doomed.store(true, Ordering::Release);
    }
}

/// Registry of live transactions keyed by id
#[derive(Debug, Default)]
pub struct ActiveTransactionRegistry {
    active: DashMap<TxnId, Arc<TxnHandle>, BuildHasherDefault<FxHasher>>,
}

impl ActiveTransactionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction and return its shared handle
    pub fn register(
        &self,
        id: TxnId,
        start_cid: CommitId,
        isolation: IsolationLevel,
    ) -> Arc<TxnHandle> {
        let handle = Arc::new(TxnHandle::new(id, start_cid, isolation));
        self.active.insert(id, Arc::clone(&handle));
        handle
    }

    /// Remove a finished transaction
    pub fn deregister(&self, id: TxnId) -> Option<Arc<TxnHandle>> {
        self.active.remove(&id).map(|(_, handle)| handle)
    }

    /// Look up a live transaction
    pub fn get(&self, id: TxnId) -> Option<Arc<TxnHandle>> {
        self.active.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live transactions
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no transaction is live
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Oldest start commit id among live transactions
    pub fn min_start_cid(&self) -> Option<CommitId> {
        self.active.iter().map(|entry| entry.start_cid()).min()
    }

    /// Ids of all live transactions, unordered
    pub fn active_ids(&self) -> Vec<TxnId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }
}
