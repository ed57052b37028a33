//! Ordered single-field index with MVCC side-buffers.

use otterbrix_core::{CompareOp, Value, NOT_DELETED, TXN_BASE};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One index entry: the mirrored row plus its own version tuple.
///
/// The timestamps are deliberately independent from the table's: an entry
/// may outlive its row's physical identity after a vacuum, and hot search
/// paths answer visibility without a table probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Global row id of the mirrored row
    pub row_id: i64,
    /// Commit id or active txn id of the inserting transaction
    pub insert_id: u64,
    /// [`NOT_DELETED`], a commit id, or an active txn id
    pub delete_id: u64,
}

/// Visibility predicate mirroring table MVCC.
///
/// `start_ts == 0 && txn_id == 0` means "see all committed".
pub fn entry_visible(entry: &IndexEntry, start_ts: u64, txn_id: u64) -> bool {
    if start_ts == 0 && txn_id == 0 {
        return entry.insert_id < TXN_BASE
            && (entry.delete_id == NOT_DELETED || entry.delete_id >= TXN_BASE);
    }
    let inserted =
        (entry.insert_id < start_ts && entry.insert_id < TXN_BASE) || entry.insert_id == txn_id;
    let deleted =
        (entry.delete_id < start_ts && entry.delete_id < TXN_BASE) || entry.delete_id == txn_id;
    inserted && !deleted
}

/// Key wrapper giving [`Value`] the total order required by the B-tree.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey(pub Value);

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.sort_cmp(&other.0)
    }
}

/// Ordered multi-map `key -> entries` for one key column.
///
/// Duplicate keys keep insertion order inside their bucket, which is the
/// order EQ searches yield them in; the caller imposes any final ordering.
#[derive(Debug, Default)]
pub struct SingleFieldIndex {
    name: String,
    column: String,
    unique: bool,
    entries: BTreeMap<IndexKey, Vec<IndexEntry>>,
    pending_inserts: FxHashMap<u64, Vec<(IndexKey, i64)>>,
    pending_deletes: FxHashMap<u64, Vec<(IndexKey, i64)>>,
}

impl SingleFieldIndex {
    /// Empty index over one key column.
    pub fn new(name: impl Into<String>, column: impl Into<String>, unique: bool) -> Self {
        SingleFieldIndex {
            name: name.into(),
            column: column.into(),
            unique,
            ..Default::default()
        }
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key column path.
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Whether duplicate keys are rejected at the planner level.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Total entry count, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an uncommitted entry for `txn_id` and record it in the pending
    /// side-buffer.
    pub fn insert(&mut self, key: Value, row_id: i64, txn_id: u64) {
        let key = IndexKey(key);
        self.pending_inserts
            .entry(txn_id)
            .or_default()
            .push((key.clone(), row_id));
        self.entries.entry(key).or_default().push(IndexEntry {
            row_id,
            insert_id: txn_id,
            delete_id: NOT_DELETED,
        });
    }

    /// Insert an entry carrying explicit timestamps. Used by backfill and
    /// recovery, where the inserting transaction is already committed.
    pub fn insert_committed(&mut self, key: Value, row_id: i64, insert_id: u64, delete_id: u64) {
        self.entries
            .entry(IndexKey(key))
            .or_default()
            .push(IndexEntry {
                row_id,
                insert_id,
                delete_id,
            });
    }

    /// Stamp the live entry for `(key, row_id)` with `txn_id` as deleter
    /// and record it in the pending side-buffer.
    pub fn mark_delete(&mut self, key: Value, row_id: i64, txn_id: u64) {
        let key = IndexKey(key);
        if let Some(bucket) = self.entries.get_mut(&key) {
            if let Some(entry) = bucket
                .iter_mut()
                .find(|e| e.row_id == row_id && e.delete_id == NOT_DELETED)
            {
                entry.delete_id = txn_id;
                self.pending_deletes
                    .entry(txn_id)
                    .or_default()
                    .push((key, row_id));
            }
        }
    }

    /// Stamp the live entry for `(key, row_id)` with a committed delete
    /// id, bypassing the side-buffers. Used by physical WAL replay.
    pub fn mark_delete_committed(&mut self, key: Value, row_id: i64, delete_id: u64) {
        if let Some(bucket) = self.entries.get_mut(&IndexKey(key)) {
            if let Some(entry) = bucket
                .iter_mut()
                .find(|e| e.row_id == row_id && e.delete_id == NOT_DELETED)
            {
                entry.delete_id = delete_id;
            }
        }
    }

    /// Promote the transaction's inserted entries to `commit_id` and drop
    /// the side-buffer bucket.
    pub fn commit_insert(&mut self, txn_id: u64, commit_id: u64) {
        let Some(pending) = self.pending_inserts.remove(&txn_id) else {
            return;
        };
        for (key, row_id) in pending {
            if let Some(bucket) = self.entries.get_mut(&key) {
                if let Some(entry) = bucket
                    .iter_mut()
                    .find(|e| e.row_id == row_id && e.insert_id == txn_id)
                {
                    entry.insert_id = commit_id;
                }
            }
        }
    }

    /// Promote the transaction's delete stamps to `commit_id` and drop the
    /// side-buffer bucket.
    pub fn commit_delete(&mut self, txn_id: u64, commit_id: u64) {
        let Some(pending) = self.pending_deletes.remove(&txn_id) else {
            return;
        };
        for (key, row_id) in pending {
            if let Some(bucket) = self.entries.get_mut(&key) {
                if let Some(entry) = bucket
                    .iter_mut()
                    .find(|e| e.row_id == row_id && e.delete_id == txn_id)
                {
                    entry.delete_id = commit_id;
                }
            }
        }
    }

    /// Remove the transaction's inserted entries entirely.
    pub fn abort_insert(&mut self, txn_id: u64) {
        let Some(pending) = self.pending_inserts.remove(&txn_id) else {
            return;
        };
        for (key, row_id) in pending {
            if let Some(bucket) = self.entries.get_mut(&key) {
                if let Some(pos) = bucket
                    .iter()
                    .position(|e| e.row_id == row_id && e.insert_id == txn_id)
                {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Restore `NOT_DELETED` on the transaction's delete stamps.
    pub fn abort_delete(&mut self, txn_id: u64) {
        let Some(pending) = self.pending_deletes.remove(&txn_id) else {
            return;
        };
        for (key, row_id) in pending {
            if let Some(bucket) = self.entries.get_mut(&key) {
                if let Some(entry) = bucket
                    .iter_mut()
                    .find(|e| e.row_id == row_id && e.delete_id == txn_id)
                {
                    entry.delete_id = NOT_DELETED;
                }
            }
        }
    }

    /// Erase entries whose committed deletion is no longer visible to any
    /// active transaction. The index owns its tombstone lifecycle.
    pub fn gc(&mut self, lowest_active: u64) {
        self.entries.retain(|_, bucket| {
            bucket.retain(|e| !(e.delete_id < lowest_active && e.delete_id < TXN_BASE));
            !bucket.is_empty()
        });
        // Stale pending buckets for transactions long gone keep memory
        // pinned; drop those that can never commit or abort again.
        self.pending_deletes
            .retain(|txn, _| !(*txn < lowest_active && *txn < TXN_BASE));
        self.pending_inserts
            .retain(|txn, _| !(*txn < lowest_active && *txn < TXN_BASE));
    }

    /// Estimated entry count in the equal range for `value`.
    pub fn estimate_eq(&self, value: &Value) -> usize {
        self.entries
            .get(&IndexKey(value.clone()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Yield visible row ids for `op value` under the snapshot.
    ///
    /// EQ yields entries in bucket insertion order; range operators walk
    /// the tree in key order; NE is the complement of the EQ range within
    /// a full walk.
    pub fn search(&self, op: CompareOp, value: &Value, start_ts: u64, txn_id: u64) -> Vec<i64> {
        let key = IndexKey(value.clone());
        let mut out = Vec::new();
        let mut collect = |bucket: &Vec<IndexEntry>| {
            for entry in bucket {
                if entry_visible(entry, start_ts, txn_id) {
                    out.push(entry.row_id);
                }
            }
        };
        match op {
            CompareOp::Eq => {
                if let Some(bucket) = self.entries.get(&key) {
                    collect(bucket);
                }
            }
            CompareOp::Ne => {
                for (k, bucket) in &self.entries {
                    if k != &key {
                        collect(bucket);
                    }
                }
            }
            CompareOp::Lt => {
                for (_, bucket) in self
                    .entries
                    .range((Bound::Unbounded, Bound::Excluded(key)))
                {
                    collect(bucket);
                }
            }
            CompareOp::Le => {
                for (_, bucket) in self.entries.range((Bound::Unbounded, Bound::Included(key))) {
                    collect(bucket);
                }
            }
            CompareOp::Gt => {
                for (_, bucket) in self.entries.range((Bound::Excluded(key), Bound::Unbounded)) {
                    collect(bucket);
                }
            }
            CompareOp::Ge => {
                for (_, bucket) in self.entries.range((Bound::Included(key), Bound::Unbounded)) {
                    collect(bucket);
                }
            }
        }
        out
    }

    /// Drop every entry and side-buffer. Used when a vacuum rebuilds the
    /// table and row ids are reassigned.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_inserts.clear();
        self.pending_deletes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: u64 = TXN_BASE + 1;
    const T2: u64 = TXN_BASE + 2;
    const T3: u64 = TXN_BASE + 3;

    fn entry(row_id: i64, insert_id: u64, delete_id: u64) -> IndexEntry {
        IndexEntry {
            row_id,
            insert_id,
            delete_id,
        }
    }

    #[test]
    fn visibility_committed() {
        let committed = entry(1, 5, NOT_DELETED);
        // Visible to a snapshot after the commit.
        assert!(entry_visible(&committed, 10, T1));
        // Not visible to a snapshot before the commit.
        assert!(!entry_visible(&committed, 3, T1));
        // Visible to the transaction whose id equals the insert stamp.
        assert!(entry_visible(&committed, 3, 5));
    }

    #[test]
    fn visibility_uncommitted() {
        let uncommitted = entry(1, T1, NOT_DELETED);
        assert!(entry_visible(&uncommitted, T1 - 1, T1));
        assert!(!entry_visible(&uncommitted, T1 - 1, T2));
    }

    #[test]
    fn visibility_deleted() {
        let deleted = entry(1, 5, 10);
        assert!(entry_visible(&deleted, 8, T1));
        assert!(!entry_visible(&deleted, 15, T1));
        // The deleting transaction does not see its own victim.
        assert!(!entry_visible(&deleted, 8, 10));
    }

    #[test]
    fn visibility_see_all_committed() {
        assert!(entry_visible(&entry(1, 5, NOT_DELETED), 0, 0));
        assert!(!entry_visible(&entry(1, T1, NOT_DELETED), 0, 0));
        assert!(!entry_visible(&entry(1, 5, 10), 0, 0));
        // Uncommitted delete is still visible in the committed view.
        assert!(entry_visible(&entry(1, 5, T2), 0, 0));
    }

    #[test]
    fn txn_insert_search() {
        let mut index = SingleFieldIndex::new("idx", "val", false);
        index.insert(Value::Int64(42), 0, T1);

        // Visible to own transaction.
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(42), T1 - 1, T1), vec![0]);
        // Not visible to another transaction.
        assert!(index.search(CompareOp::Eq, &Value::Int64(42), T1 - 1, T2).is_empty());

        // Visible after commit.
        index.commit_insert(T1, 10);
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(42), 15, T3), vec![0]);
    }

    #[test]
    fn abort_insert_erases() {
        let mut index = SingleFieldIndex::new("idx", "val", false);
        index.insert(Value::Int64(42), 0, T1);
        index.abort_insert(T1);
        assert!(index.search(CompareOp::Eq, &Value::Int64(42), T1 - 1, T1).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn full_lifecycle() {
        let mut index = SingleFieldIndex::new("idx", "val", false);
        index.insert(Value::Int64(42), 0, T1);
        index.commit_insert(T1, 10);
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(42), 11, T2), vec![0]);

        index.mark_delete(Value::Int64(42), 0, T2);
        index.commit_delete(T2, 20);
        assert!(index.search(CompareOp::Eq, &Value::Int64(42), 21, T3).is_empty());

        index.gc(21);
        assert!(index.is_empty());
    }

    #[test]
    fn abort_delete_restores() {
        let mut index = SingleFieldIndex::new("idx", "val", false);
        index.insert(Value::Int64(7), 3, T1);
        index.commit_insert(T1, 10);

        index.mark_delete(Value::Int64(7), 3, T2);
        assert!(index.search(CompareOp::Eq, &Value::Int64(7), 11, T2).is_empty());

        index.abort_delete(T2);
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(7), 11, T2), vec![3]);
    }

    #[test]
    fn range_searches() {
        let mut index = SingleFieldIndex::new("idx", "a", false);
        for (row, key) in [(0, 1), (1, 2), (2, 2), (3, 3), (4, 5)] {
            index.insert(Value::Int64(key), row, T1);
        }
        index.commit_insert(T1, 1);

        let snap = |op, v: i64| index.search(op, &Value::Int64(v), 2, T2);
        assert_eq!(snap(CompareOp::Lt, 2), vec![0]);
        assert_eq!(snap(CompareOp::Le, 2), vec![0, 1, 2]);
        assert_eq!(snap(CompareOp::Gt, 2), vec![3, 4]);
        assert_eq!(snap(CompareOp::Ge, 3), vec![3, 4]);
        assert_eq!(snap(CompareOp::Ne, 2), vec![0, 3, 4]);
        assert_eq!(snap(CompareOp::Eq, 2), vec![1, 2]);
    }

    #[test]
    fn duplicate_keys_keep_insertion_order() {
        let mut index = SingleFieldIndex::new("idx", "a", false);
        index.insert(Value::Int64(9), 5, T1);
        index.insert(Value::Int64(9), 2, T1);
        index.insert(Value::Int64(9), 8, T1);
        index.commit_insert(T1, 1);
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(9), 2, T2), vec![5, 2, 8]);
    }

    #[test]
    fn estimate_counts_bucket() {
        let mut index = SingleFieldIndex::new("idx", "a", false);
        index.insert(Value::Int64(9), 0, T1);
        index.insert(Value::Int64(9), 1, T1);
        assert_eq!(index.estimate_eq(&Value::Int64(9)), 2);
        assert_eq!(index.estimate_eq(&Value::Int64(1)), 0);
    }
}
