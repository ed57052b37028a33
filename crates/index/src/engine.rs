//! Per-collection index registry with mutation fan-out.

use crate::ordered::SingleFieldIndex;
use otterbrix_core::{CompareOp, Error, Result, Value};
use rustc_hash::FxHashMap;
use tracing::debug;

/// Outcome of index selection for a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexChoice {
    /// Position of the chosen index in the engine
    pub index: usize,
    /// Operator to run against it
    pub op: CompareOp,
    /// Key value to search with
    pub value: Value,
}

/// The ordered set of indexes over one collection.
///
/// Mutations fan out to every index whose key column appears in the row;
/// commit, abort and gc fan out to all of them. Fan-out happens inside the
/// table store's turn so table and indexes stay atomic with respect to
/// readers.
#[derive(Debug, Default)]
pub struct IndexEngine {
    indexes: Vec<SingleFieldIndex>,
    by_column: FxHashMap<String, Vec<usize>>,
}

impl IndexEngine {
    /// Empty registry.
    pub fn new() -> Self {
        IndexEngine::default()
    }

    /// Register a new single-field index.
    pub fn create_index(
        &mut self,
        name: impl Into<String>,
        column: impl Into<String>,
        unique: bool,
    ) -> Result<&mut SingleFieldIndex> {
        let name = name.into();
        let column = column.into();
        if self.indexes.iter().any(|i| i.name() == name) {
            return Err(Error::IndexCreate {
                what: format!("index {} already exists", name),
            });
        }
        debug!(index = %name, column = %column, "create index");
        let position = self.indexes.len();
        self.indexes.push(SingleFieldIndex::new(name, column.clone(), unique));
        self.by_column.entry(column).or_default().push(position);
        Ok(&mut self.indexes[position])
    }

    /// Remove an index by name. Returns whether it existed.
    pub fn drop_index(&mut self, name: &str) -> bool {
        let Some(position) = self.indexes.iter().position(|i| i.name() == name) else {
            return false;
        };
        debug!(index = %name, "drop index");
        self.indexes.remove(position);
        self.by_column.clear();
        for (i, index) in self.indexes.iter().enumerate() {
            self.by_column
                .entry(index.column().to_string())
                .or_default()
                .push(i);
        }
        true
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&SingleFieldIndex> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    /// Look up an index by position.
    pub fn index_at(&self, position: usize) -> Option<&SingleFieldIndex> {
        self.indexes.get(position)
    }

    /// Mutable index by position.
    pub fn index_at_mut(&mut self, position: usize) -> Option<&mut SingleFieldIndex> {
        self.indexes.get_mut(position)
    }

    /// All registered indexes.
    pub fn indexes(&self) -> &[SingleFieldIndex] {
        &self.indexes
    }

    /// Number of registered indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Whether no indexes are registered.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Fan an inserted row out to every applicable index.
    ///
    /// `row` pairs column names with the row's values; only indexes whose
    /// key column appears receive an entry.
    pub fn insert_row(&mut self, row: &[(&str, &Value)], row_id: i64, txn_id: u64) {
        for (column, value) in row {
            if let Some(positions) = self.by_column.get(*column) {
                for &position in positions {
                    self.indexes[position].insert((*value).clone(), row_id, txn_id);
                }
            }
        }
    }

    /// Same as [`IndexEngine::insert_row`] with explicit committed
    /// timestamps; used by backfill and recovery.
    pub fn insert_row_committed(
        &mut self,
        row: &[(&str, &Value)],
        row_id: i64,
        insert_id: u64,
        delete_id: u64,
    ) {
        for (column, value) in row {
            if let Some(positions) = self.by_column.get(*column) {
                for &position in positions {
                    self.indexes[position].insert_committed(
                        (*value).clone(),
                        row_id,
                        insert_id,
                        delete_id,
                    );
                }
            }
        }
    }

    /// Fan a row deletion out to every applicable index.
    pub fn delete_row(&mut self, row: &[(&str, &Value)], row_id: i64, txn_id: u64) {
        for (column, value) in row {
            if let Some(positions) = self.by_column.get(*column) {
                for &position in positions {
                    self.indexes[position].mark_delete((*value).clone(), row_id, txn_id);
                }
            }
        }
    }

    /// Same as [`IndexEngine::delete_row`] with an explicit committed
    /// delete stamp; used by physical WAL replay.
    pub fn delete_row_committed(&mut self, row: &[(&str, &Value)], row_id: i64, delete_id: u64) {
        for (column, value) in row {
            if let Some(positions) = self.by_column.get(*column) {
                for &position in positions {
                    self.indexes[position].mark_delete_committed(
                        (*value).clone(),
                        row_id,
                        delete_id,
                    );
                }
            }
        }
    }

    /// Promote the transaction's stamps in every index.
    pub fn commit(&mut self, txn_id: u64, commit_id: u64) {
        for index in &mut self.indexes {
            index.commit_insert(txn_id, commit_id);
            index.commit_delete(txn_id, commit_id);
        }
    }

    /// Roll the transaction back in every index.
    pub fn abort(&mut self, txn_id: u64) {
        for index in &mut self.indexes {
            index.abort_insert(txn_id);
            index.abort_delete(txn_id);
        }
    }

    /// Garbage-collect every index.
    pub fn gc(&mut self, lowest_active: u64) {
        for index in &mut self.indexes {
            index.gc(lowest_active);
        }
    }

    /// Drop all entries in every index. Used when a vacuum reassigns
    /// row ids and the indexes are rebuilt from the compacted table.
    pub fn clear_all(&mut self) {
        for index in &mut self.indexes {
            index.clear();
        }
    }

    /// Pick the best index for a set of `(column, op, value)` candidates.
    ///
    /// The index whose key column appears in an equality candidate wins;
    /// ties break by smaller estimated output cardinality. Returns `None`
    /// when no index applies and the caller falls back to a pruned scan.
    pub fn select(&self, candidates: &[(&str, CompareOp, &Value)]) -> Option<IndexChoice> {
        let mut best: Option<(usize, usize, CompareOp, Value)> = None;
        for (column, op, value) in candidates {
            if *op != CompareOp::Eq {
                continue;
            }
            let Some(positions) = self.by_column.get(*column) else {
                continue;
            };
            for &position in positions {
                let estimate = self.indexes[position].estimate_eq(value);
                let better = match &best {
                    None => true,
                    Some((_, best_estimate, _, _)) => estimate < *best_estimate,
                };
                if better {
                    best = Some((position, estimate, *op, (*value).clone()));
                }
            }
        }
        best.map(|(index, _, op, value)| IndexChoice { index, op, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otterbrix_core::TXN_BASE;

    const T1: u64 = TXN_BASE + 1;
    const T2: u64 = TXN_BASE + 2;

    fn engine_with_two_indexes() -> IndexEngine {
        let mut engine = IndexEngine::new();
        engine.create_index("idx_a", "a", false).unwrap();
        engine.create_index("idx_b", "b", false).unwrap();
        engine
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut engine = IndexEngine::new();
        engine.create_index("idx", "a", false).unwrap();
        let err = engine.create_index("idx", "b", false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn fan_out_and_commit() {
        let mut engine = engine_with_two_indexes();
        let a = Value::Int64(1);
        let b = Value::String("x".to_string());
        engine.insert_row(&[("a", &a), ("b", &b)], 0, T1);
        engine.commit(T1, 10);

        let idx_a = engine.index("idx_a").unwrap();
        assert_eq!(idx_a.search(CompareOp::Eq, &a, 11, T2), vec![0]);
        let idx_b = engine.index("idx_b").unwrap();
        assert_eq!(idx_b.search(CompareOp::Eq, &b, 11, T2), vec![0]);
    }

    #[test]
    fn abort_rolls_back_all() {
        let mut engine = engine_with_two_indexes();
        let a = Value::Int64(1);
        let b = Value::String("x".to_string());
        engine.insert_row(&[("a", &a), ("b", &b)], 0, T1);
        engine.abort(T1);
        assert!(engine.index("idx_a").unwrap().is_empty());
        assert!(engine.index("idx_b").unwrap().is_empty());
    }

    #[test]
    fn selection_prefers_smaller_range() {
        let mut engine = engine_with_two_indexes();
        // Three rows with a=1, one row with b="x".
        for row in 0..3 {
            engine.insert_row(&[("a", &Value::Int64(1))], row, T1);
        }
        engine.insert_row(&[("b", &Value::String("x".to_string()))], 3, T1);
        engine.commit(T1, 1);

        let a = Value::Int64(1);
        let b = Value::String("x".to_string());
        let choice = engine
            .select(&[("a", CompareOp::Eq, &a), ("b", CompareOp::Eq, &b)])
            .unwrap();
        assert_eq!(choice.index, 1); // idx_b has the smaller bucket
        assert_eq!(choice.value, b);
    }

    #[test]
    fn selection_ignores_ranges_and_unknown_columns() {
        let engine = engine_with_two_indexes();
        let v = Value::Int64(1);
        assert!(engine.select(&[("a", CompareOp::Gt, &v)]).is_none());
        assert!(engine.select(&[("c", CompareOp::Eq, &v)]).is_none());
    }

    #[test]
    fn drop_index_reindexes_columns() {
        let mut engine = engine_with_two_indexes();
        assert!(engine.drop_index("idx_a"));
        assert!(!engine.drop_index("idx_a"));
        let v = Value::String("x".to_string());
        // idx_b still reachable through its column after the rebuild.
        assert!(engine.select(&[("b", CompareOp::Eq, &v)]).is_some());
    }
}
