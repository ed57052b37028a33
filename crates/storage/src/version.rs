//! Per-row version bookkeeping.

use otterbrix_core::{Error, Result, NOT_DELETED, TXN_BASE};

/// Stamp marking a slot erased by transaction abort. It is never visible
/// (no start timestamp exceeds it, no transaction id equals it) and gc
/// reclaims it like a dead tombstone.
const ABORTED: u64 = u64::MAX - 1;

/// The MVCC visibility predicate over one version tuple.
///
/// `start_ts == 0 && txn_id == 0` is the "see all committed" snapshot.
#[inline]
pub fn row_visible(insert_id: u64, delete_id: u64, start_ts: u64, txn_id: u64) -> bool {
    if start_ts == 0 && txn_id == 0 {
        return insert_id < TXN_BASE && (delete_id == NOT_DELETED || delete_id >= TXN_BASE);
    }
    let inserted = (insert_id < start_ts && insert_id < TXN_BASE) || insert_id == txn_id;
    let deleted = (delete_id < start_ts && delete_id < TXN_BASE) || delete_id == txn_id;
    inserted && !deleted
}

/// One row group's version block: an insert and a delete stamp per slot.
///
/// The pair is read and written only inside the owning store's
/// single-threaded turn, which is what rules out torn reads across the
/// two fields.
#[derive(Debug, Default, Clone)]
pub struct RowVersionManager {
    inserts: Vec<u64>,
    deletes: Vec<u64>,
}

impl RowVersionManager {
    /// Empty block.
    pub fn new() -> Self {
        RowVersionManager::default()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.inserts.len()
    }

    /// Whether the block has no slots.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
    }

    /// Append a slot stamped with the inserting id. Returns the slot.
    pub fn push(&mut self, insert_id: u64) -> usize {
        self.inserts.push(insert_id);
        self.deletes.push(NOT_DELETED);
        self.inserts.len() - 1
    }

    /// Insert stamp of a slot.
    pub fn insert_id(&self, slot: usize) -> u64 {
        self.inserts[slot]
    }

    /// Delete stamp of a slot.
    pub fn delete_id(&self, slot: usize) -> u64 {
        self.deletes[slot]
    }

    /// Overwrite a slot's insert stamp.
    pub fn set_insert(&mut self, slot: usize, id: u64) {
        self.inserts[slot] = id;
    }

    /// Overwrite a slot's delete stamp.
    pub fn set_delete(&mut self, slot: usize, id: u64) {
        self.deletes[slot] = id;
    }

    /// Stamp a slot deleted by `txn_id`.
    ///
    /// Fails with a write conflict when another transaction or an earlier
    /// commit already holds the delete stamp.
    pub fn try_delete(&mut self, slot: usize, txn_id: u64) -> Result<()> {
        let current = self.deletes[slot];
        if current != NOT_DELETED && current != txn_id {
            return Err(Error::WriteConflict {
                what: format!("slot {} already deleted by {}", slot, current),
            });
        }
        self.deletes[slot] = txn_id;
        Ok(())
    }

    /// Visibility of a slot under a snapshot.
    pub fn visible(&self, slot: usize, start_ts: u64, txn_id: u64) -> bool {
        row_visible(self.inserts[slot], self.deletes[slot], start_ts, txn_id)
    }

    /// Rewrite every stamp equal to `old_id` to `new_id`. Called on commit
    /// to replace the transaction id with the commit id.
    pub fn promote(&mut self, old_id: u64, new_id: u64) {
        for stamp in self.inserts.iter_mut() {
            if *stamp == old_id {
                *stamp = new_id;
            }
        }
        for stamp in self.deletes.iter_mut() {
            if *stamp == old_id {
                *stamp = new_id;
            }
        }
    }

    /// Undo the transaction's footprint: slots it inserted become dead,
    /// slots it deleted revert to live.
    pub fn abort(&mut self, txn_id: u64) {
        for stamp in self.inserts.iter_mut() {
            if *stamp == txn_id {
                *stamp = ABORTED;
            }
        }
        for stamp in self.deletes.iter_mut() {
            if *stamp == txn_id {
                *stamp = NOT_DELETED;
            }
        }
    }

    /// Whether a slot was erased by an abort.
    pub fn is_dead(&self, slot: usize) -> bool {
        self.inserts[slot] == ABORTED
    }

    /// Slots whose committed deletion is invisible to every active
    /// transaction, plus aborted slots. The row group may reclaim them at
    /// the next vacuum.
    pub fn gc(&self, lowest_active: u64) -> Vec<usize> {
        (0..self.len())
            .filter(|&slot| {
                let delete = self.deletes[slot];
                self.inserts[slot] == ABORTED || (delete < lowest_active && delete < TXN_BASE)
            })
            .collect()
    }
}
