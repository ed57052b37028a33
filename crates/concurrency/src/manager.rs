//! Transaction manager: id allocation and the active set.

use otterbrix_core::{Error, Result, TXN_BASE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::trace;

/// An open transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    /// Identifier at or above `TXN_BASE`, unique while active
    pub txn_id: u64,
    /// Commit-id counter value at begin; the visibility window
    pub start_ts: u64,
}

#[derive(Debug)]
struct Counters {
    /// Next commit id to hand out; dense, strictly below `TXN_BASE`
    next_commit_id: u64,
    /// Next transaction id; increments freely above `TXN_BASE`
    next_txn_id: u64,
    /// Active transactions: txn id -> start timestamp
    active: BTreeMap<u64, u64>,
}

/// Allocates transaction and commit ids and tracks the active set.
///
/// All three fields sit behind a single mutex; allocation is small and
/// uncontended so there is no point in splitting the lock.
///
/// # Panics
///
/// Allocation panics when a counter would cross its half of the id space
/// (`next_commit_id` reaching `TXN_BASE`, `next_txn_id` wrapping u64).
/// Both take longer than the hardware's lifetime to reach.
#[derive(Debug)]
pub struct TransactionManager {
    counters: Mutex<Counters>,
}

impl TransactionManager {
    /// Fresh manager: commit ids start at 1, transaction ids at
    /// `TXN_BASE`.
    pub fn new() -> Self {
        Self::with_counters(1, TXN_BASE)
    }

    /// Restore counters after recovery so new ids never collide with
    /// replayed ones.
    pub fn with_counters(next_commit_id: u64, next_txn_id: u64) -> Self {
        assert!(next_commit_id >= 1 && next_commit_id < TXN_BASE);
        assert!(next_txn_id >= TXN_BASE);
        TransactionManager {
            counters: Mutex::new(Counters {
                next_commit_id,
                next_txn_id,
                active: BTreeMap::new(),
            }),
        }
    }

    /// Open a transaction. Its snapshot is the current commit-id counter.
    pub fn begin(&self) -> Transaction {
        let mut counters = self.counters.lock();
        let start_ts = counters.next_commit_id;
        let txn_id = counters.next_txn_id;
        counters.next_txn_id = counters
            .next_txn_id
            .checked_add(1)
            .expect("transaction id overflow");
        counters.active.insert(txn_id, start_ts);
        trace!(txn_id, start_ts, "begin transaction");
        Transaction { txn_id, start_ts }
    }

    /// Allocate a commit id for an active transaction and retire it from
    /// the active set.
    pub fn commit(&self, txn_id: u64) -> Result<u64> {
        let mut counters = self.counters.lock();
        if counters.active.remove(&txn_id).is_none() {
            return Err(Error::Invalid(format!(
                "commit of unknown transaction {}",
                txn_id
            )));
        }
        let commit_id = counters.next_commit_id;
        counters.next_commit_id += 1;
        assert!(counters.next_commit_id < TXN_BASE, "commit id overflow");
        trace!(txn_id, commit_id, "commit transaction");
        Ok(commit_id)
    }

    /// Retire an active transaction without allocating a commit id.
    pub fn abort(&self, txn_id: u64) -> bool {
        let removed = self.counters.lock().active.remove(&txn_id).is_some();
        trace!(txn_id, removed, "abort transaction");
        removed
    }

    /// The smallest start timestamp among active transactions, or the
    /// current commit-id counter when none are active. Versions deleted
    /// below this line are invisible to everyone and may be reclaimed.
    pub fn lowest_active_start_ts(&self) -> u64 {
        let counters = self.counters.lock();
        counters
            .active
            .values()
            .copied()
            .min()
            .unwrap_or(counters.next_commit_id)
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.counters.lock().active.len()
    }

    /// Current value of the commit-id counter.
    pub fn current_commit_id(&self) -> u64 {
        self.counters.lock().next_commit_id
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
