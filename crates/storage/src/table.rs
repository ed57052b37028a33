//! The MVCC table store: row groups, versions and index fan-out.

use crate::row_group::RowGroup;
use otterbrix_core::{
    decode_row_id, encode_row_id, CollectionName, CompareOp, DataChunk, Error, Result, Schema,
    Value, NOT_DELETED, TXN_BASE,
};
use otterbrix_index::IndexEngine;
use tracing::{debug, trace};

/// A collection's in-memory state: an ordered list of row groups, the
/// column schema and the index engine kept in lockstep.
///
/// The store has no interior locking. It is owned by the memory-storage
/// service, whose single-threaded turn serializes every operation on the
/// same collection; index fan-out happens inside that turn so table and
/// indexes stay atomic with respect to readers.
#[derive(Debug)]
pub struct TableStore {
    name: CollectionName,
    schema: Schema,
    row_groups: Vec<RowGroup>,
    indexes: IndexEngine,
    dropped: bool,
}

impl TableStore {
    /// Empty store for a schema.
    pub fn new(name: CollectionName, schema: Schema) -> Self {
        TableStore {
            name,
            schema,
            row_groups: Vec::new(),
            indexes: IndexEngine::new(),
            dropped: false,
        }
    }

    /// Qualified collection name.
    pub fn name(&self) -> &CollectionName {
        &self.name
    }

    /// Column schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The index engine for this collection.
    pub fn indexes(&self) -> &IndexEngine {
        &self.indexes
    }

    /// Mutable index engine.
    pub fn indexes_mut(&mut self) -> &mut IndexEngine {
        &mut self.indexes
    }

    /// Row groups in identity order.
    pub fn row_groups(&self) -> &[RowGroup] {
        &self.row_groups
    }

    /// Mark the collection dropped; later operations fail with
    /// `CollectionDropped`.
    pub fn mark_dropped(&mut self) {
        self.dropped = true;
    }

    /// Whether the collection was dropped.
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    fn check_not_dropped(&self) -> Result<()> {
        if self.dropped {
            return Err(Error::CollectionDropped {
                name: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn check_constraints(&self, row: &[Value]) -> Result<()> {
        for (definition, value) in self.schema.columns().iter().zip(row) {
            if definition.not_null && value.is_null() {
                return Err(Error::NotNullViolation {
                    column: definition.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Append a chunk of rows stamped with `id` and mirror them into the
    /// indexes. `id` is an active txn id on the write path and a commit id
    /// during physical WAL replay. Returns the assigned global row ids.
    pub fn append(&mut self, chunk: &DataChunk, id: u64) -> Result<Vec<i64>> {
        self.check_not_dropped()?;
        if chunk.column_count() != self.schema.len() {
            return Err(Error::Invalid(format!(
                "chunk width {} does not match schema width {} of {}",
                chunk.column_count(),
                self.schema.len(),
                self.name
            )));
        }
        // Validate the whole batch first so a constraint violation
        // rejects the statement without partial effects.
        for row_index in 0..chunk.cardinality() {
            self.check_constraints(&chunk.row(row_index))?;
        }

        let mut row_ids = Vec::with_capacity(chunk.cardinality());
        let mut offset = 0;
        while offset < chunk.cardinality() {
            if self.row_groups.last().map(RowGroup::is_full).unwrap_or(true) {
                self.row_groups.push(RowGroup::new(self.schema.types()));
            }
            let group_index = self.row_groups.len() - 1;
            let start_slot = self.row_groups[group_index].cardinality();
            let copied = self.row_groups[group_index].append_chunk(chunk, offset, id)?;

            for k in 0..copied {
                let row = chunk.row(offset + k);
                let row_id = encode_row_id(group_index, start_slot + k);
                let pairs: Vec<(&str, &Value)> = self
                    .schema
                    .columns()
                    .iter()
                    .zip(&row)
                    .map(|(d, v)| (d.name.as_str(), v))
                    .collect();
                if id >= TXN_BASE {
                    self.indexes.insert_row(&pairs, row_id, id);
                } else {
                    self.indexes.insert_row_committed(&pairs, row_id, id, NOT_DELETED);
                }
                row_ids.push(row_id);
            }
            offset += copied;
        }
        trace!(collection = %self.name, rows = row_ids.len(), "append");
        Ok(row_ids)
    }

    /// Read one row if it is visible under the snapshot.
    pub fn point_lookup(&self, row_id: i64, start_ts: u64, txn_id: u64) -> Option<Vec<Value>> {
        let (group, slot) = decode_row_id(row_id);
        let group = self.row_groups.get(group)?;
        if slot >= group.cardinality() || !group.versions().visible(slot, start_ts, txn_id) {
            return None;
        }
        Some(group.row(slot))
    }

    /// Scan visible rows in row-id order, optionally pruning row groups
    /// with a `(column, op, value)` hint. Yields `(row_id, values)`.
    pub fn scan<'a>(
        &'a self,
        start_ts: u64,
        txn_id: u64,
        prune: Option<(usize, CompareOp, &'a Value)>,
    ) -> impl Iterator<Item = (i64, Vec<Value>)> + 'a {
        self.row_groups
            .iter()
            .enumerate()
            .filter(move |(_, group)| match prune {
                Some((column, op, value)) => !group.can_skip(column, op, value),
                None => true,
            })
            .flat_map(move |(group_index, group)| {
                (0..group.cardinality()).filter_map(move |slot| {
                    if group.versions().visible(slot, start_ts, txn_id) {
                        Some((encode_row_id(group_index, slot), group.row(slot)))
                    } else {
                        None
                    }
                })
            })
    }

    /// Count visible rows.
    pub fn visible_rows(&self, start_ts: u64, txn_id: u64) -> usize {
        self.scan(start_ts, txn_id, None).count()
    }

    /// Stamp rows deleted by `id` and mirror the tombstones into the
    /// indexes. Fails with `WriteConflict` on the first row another
    /// transaction already deleted; earlier stamps of this call are left
    /// in place and the caller aborts the transaction.
    pub fn delete(&mut self, row_ids: &[i64], id: u64) -> Result<usize> {
        self.check_not_dropped()?;
        for &row_id in row_ids {
            let (group_index, slot) = decode_row_id(row_id);
            let group = self
                .row_groups
                .get_mut(group_index)
                .ok_or_else(|| Error::Invalid(format!("row id {} out of range", row_id)))?;
            if id >= TXN_BASE {
                group.versions_mut().try_delete(slot, id)?;
            } else {
                // Physical replay carries commit stamps directly.
                group.versions_mut().set_delete(slot, id);
            }
            let row = group.row(slot);
            let pairs: Vec<(&str, &Value)> = self
                .schema
                .columns()
                .iter()
                .zip(&row)
                .map(|(d, v)| (d.name.as_str(), v))
                .collect();
            if id >= TXN_BASE {
                self.indexes.delete_row(&pairs, row_id, id);
            } else {
                self.indexes.delete_row_committed(&pairs, row_id, id);
            }
        }
        trace!(collection = %self.name, rows = row_ids.len(), "delete");
        Ok(row_ids.len())
    }

    /// Delete plus insert inside one transaction: the old versions get the
    /// delete stamp, the replacement rows the insert stamp. Returns the
    /// new global row ids.
    pub fn update(&mut self, row_ids: &[i64], new_rows: &DataChunk, id: u64) -> Result<Vec<i64>> {
        self.check_not_dropped()?;
        if new_rows.cardinality() != row_ids.len() {
            return Err(Error::Invalid(format!(
                "update of {} rows with {} replacements",
                row_ids.len(),
                new_rows.cardinality()
            )));
        }
        self.delete(row_ids, id)?;
        self.append(new_rows, id)
    }

    /// Promote the transaction's stamps to the commit id, in every row
    /// group and every index.
    pub fn commit(&mut self, txn_id: u64, commit_id: u64) {
        for group in &mut self.row_groups {
            group.versions_mut().promote(txn_id, commit_id);
        }
        self.indexes.commit(txn_id, commit_id);
    }

    /// Erase the transaction's inserts, restore its deletes, roll back the
    /// indexes.
    pub fn abort(&mut self, txn_id: u64) {
        for group in &mut self.row_groups {
            group.versions_mut().abort(txn_id);
        }
        self.indexes.abort(txn_id);
    }

    /// Physically compact: rebuild row groups without the slots whose
    /// deletion is invisible to every active transaction, reassign row
    /// ids, rebuild the indexes from the surviving rows.
    pub fn vacuum(&mut self, lowest_active: u64) {
        let mut survivors: Vec<(u64, u64, Vec<Value>)> = Vec::new();
        for group in &self.row_groups {
            let reclaimable = group.versions().gc(lowest_active);
            for slot in 0..group.cardinality() {
                if reclaimable.contains(&slot) {
                    continue;
                }
                survivors.push((
                    group.versions().insert_id(slot),
                    group.versions().delete_id(slot),
                    group.row(slot),
                ));
            }
        }
        debug!(collection = %self.name, rows = survivors.len(), "vacuum rewrite");

        self.row_groups.clear();
        self.indexes.clear_all();
        for (insert_id, delete_id, row) in survivors {
            if self.row_groups.last().map(RowGroup::is_full).unwrap_or(true) {
                self.row_groups.push(RowGroup::new(self.schema.types()));
            }
            let group_index = self.row_groups.len() - 1;
            let slot = self.row_groups[group_index]
                .append_row(&row, insert_id)
                .expect("fresh row group rejected append");
            self.row_groups[group_index]
                .versions_mut()
                .set_delete(slot, delete_id);
            let row_id = encode_row_id(group_index, slot);
            let pairs: Vec<(&str, &Value)> = self
                .schema
                .columns()
                .iter()
                .zip(&row)
                .map(|(d, v)| (d.name.as_str(), v))
                .collect();
            self.indexes
                .insert_row_committed(&pairs, row_id, insert_id, delete_id);
        }
    }

    /// Register an index and backfill it from every live slot, copying the
    /// slots' version stamps so MVCC answers stay exact.
    pub fn create_index(&mut self, name: &str, column: &str, unique: bool) -> Result<()> {
        if self.schema.position(column).is_none() {
            return Err(Error::IndexCreate {
                what: format!("unknown column {} in {}", column, self.name),
            });
        }
        let column_index = self.schema.position(column).expect("checked above");
        self.indexes.create_index(name, column, unique)?;
        let index = self.indexes.len() - 1;
        for (group_index, group) in self.row_groups.iter().enumerate() {
            for slot in 0..group.cardinality() {
                if group.versions().is_dead(slot) {
                    continue;
                }
                let key = group.value(column_index, slot);
                let row_id = encode_row_id(group_index, slot);
                let insert_id = group.versions().insert_id(slot);
                let delete_id = group.versions().delete_id(slot);
                self.indexes
                    .index_at_mut(index)
                    .expect("just created")
                    .insert_committed(key, row_id, insert_id, delete_id);
            }
        }
        debug!(collection = %self.name, index = name, column, "index backfilled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otterbrix_core::{ColumnDefinition, LogicalType, ROW_GROUP_CAPACITY};

    const T1: u64 = TXN_BASE + 1;
    const T2: u64 = TXN_BASE + 2;
    const T3: u64 = TXN_BASE + 3;

    fn store() -> TableStore {
        TableStore::new(
            CollectionName::new("db", "t"),
            Schema::new(vec![
                ColumnDefinition::new("a", LogicalType::BigInt),
                ColumnDefinition::new("b", LogicalType::String),
            ]),
        )
    }

    fn chunk(rows: &[(i64, &str)]) -> DataChunk {
        let rows: Vec<Vec<Value>> = rows
            .iter()
            .map(|(a, b)| vec![Value::Int64(*a), Value::String(b.to_string())])
            .collect();
        DataChunk::from_rows(vec![LogicalType::BigInt, LogicalType::String], &rows).unwrap()
    }

    #[test]
    fn append_scan_roundtrip() {
        let mut table = store();
        let ids = table.append(&chunk(&[(1, "x"), (2, "y")]), T1).unwrap();
        assert_eq!(ids, vec![0, 1]);
        table.commit(T1, 1);

        let rows: Vec<_> = table.scan(2, T2, None).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1[0], Value::Int64(1));
        assert_eq!(rows[1].1[1], Value::String("y".to_string()));
    }

    #[test]
    fn own_writes_visible_before_commit() {
        let mut table = store();
        table.append(&chunk(&[(1, "x")]), T1).unwrap();
        assert_eq!(table.visible_rows(T1 - 1, T1), 1);
        assert_eq!(table.visible_rows(T1 - 1, T2), 0);
    }

    #[test]
    fn capacity_boundary_allocates_new_group() {
        let mut table = TableStore::new(
            CollectionName::new("db", "t"),
            Schema::new(vec![ColumnDefinition::new("a", LogicalType::BigInt)]),
        );
        let rows: Vec<Vec<Value>> = (0..ROW_GROUP_CAPACITY + 1)
            .map(|i| vec![Value::Int64(i as i64)])
            .collect();
        let chunk = DataChunk::from_rows(vec![LogicalType::BigInt], &rows).unwrap();
        let ids = table.append(&chunk, T1).unwrap();

        assert_eq!(table.row_groups().len(), 2);
        assert_eq!(table.row_groups()[0].cardinality(), ROW_GROUP_CAPACITY);
        assert_eq!(table.row_groups()[1].cardinality(), 1);
        // The first row of the second group has the encoded group bit set.
        assert_eq!(ids[ROW_GROUP_CAPACITY], encode_row_id(1, 0));
        table.commit(T1, 1);
        assert_eq!(table.visible_rows(2, T2), ROW_GROUP_CAPACITY + 1);
    }

    #[test]
    fn delete_hides_rows_and_conflicts() {
        let mut table = store();
        let ids = table.append(&chunk(&[(1, "x"), (2, "y")]), T1).unwrap();
        table.commit(T1, 1);

        table.delete(&ids[..1], T2).unwrap();
        // Deleter no longer sees the row, another snapshot still does.
        assert_eq!(table.visible_rows(2, T2), 1);
        assert_eq!(table.visible_rows(2, T3), 2);

        // A concurrent delete of the same row conflicts.
        let err = table.delete(&ids[..1], T3).unwrap_err();
        assert!(err.is_conflict());

        table.commit(T2, 2);
        assert_eq!(table.visible_rows(3, T3), 1);
    }

    #[test]
    fn update_is_delete_plus_insert() {
        let mut table = store();
        let ids = table.append(&chunk(&[(1, "x")]), T1).unwrap();
        table.commit(T1, 1);

        let new_ids = table.update(&ids, &chunk(&[(99, "z")]), T2).unwrap();
        assert_ne!(new_ids, ids);
        table.commit(T2, 2);

        let rows: Vec<_> = table.scan(3, T3, None).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0], Value::Int64(99));
    }

    #[test]
    fn abort_erases_inserts_restores_deletes() {
        let mut table = store();
        let ids = table.append(&chunk(&[(1, "x")]), T1).unwrap();
        table.commit(T1, 1);

        table.append(&chunk(&[(2, "y")]), T2).unwrap();
        table.delete(&ids, T2).unwrap();
        table.abort(T2);

        let rows: Vec<_> = table.scan(2, T3, None).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0], Value::Int64(1));
    }

    #[test]
    fn not_null_rejected() {
        let mut table = TableStore::new(
            CollectionName::new("db", "t"),
            Schema::new(vec![
                ColumnDefinition::new("name", LogicalType::String).not_null()
            ]),
        );
        let chunk =
            DataChunk::from_rows(vec![LogicalType::String], &[vec![Value::Null]]).unwrap();
        let err = table.append(&chunk, T1).unwrap_err();
        assert!(matches!(err, Error::NotNullViolation { .. }));
    }

    #[test]
    fn index_stays_in_lockstep() {
        let mut table = store();
        table.create_index("idx_a", "a", false).unwrap();
        table.append(&chunk(&[(1, "x"), (2, "y")]), T1).unwrap();
        table.commit(T1, 1);

        let found = table
            .indexes()
            .index("idx_a")
            .unwrap()
            .search(CompareOp::Eq, &Value::Int64(2), 2, T2);
        assert_eq!(found.len(), 1);
        assert_eq!(
            table.point_lookup(found[0], 2, T2).unwrap()[1],
            Value::String("y".to_string())
        );
    }

    #[test]
    fn index_backfill_copies_stamps() {
        let mut table = store();
        table.append(&chunk(&[(1, "x")]), T1).unwrap();
        table.commit(T1, 1);
        table.append(&chunk(&[(2, "y")]), T2).unwrap(); // still uncommitted

        table.create_index("idx_a", "a", false).unwrap();
        let index = table.indexes().index("idx_a").unwrap();
        // Committed row visible to a fresh snapshot, uncommitted only to T2.
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(1), 2, T3).len(), 1);
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(2), 2, T3).len(), 0);
        assert_eq!(index.search(CompareOp::Eq, &Value::Int64(2), 2, T2).len(), 1);
    }

    #[test]
    fn vacuum_compacts_and_rebuilds() {
        let mut table = store();
        table.create_index("idx_a", "a", false).unwrap();
        let ids = table.append(&chunk(&[(1, "x"), (2, "y"), (3, "z")]), T1).unwrap();
        table.commit(T1, 1);
        table.delete(&ids[..2], T2).unwrap();
        table.commit(T2, 2);

        table.vacuum(3);
        assert_eq!(table.row_groups().len(), 1);
        assert_eq!(table.row_groups()[0].cardinality(), 1);
        let rows: Vec<_> = table.scan(3, T3, None).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0], Value::Int64(3));
        // Index search agrees after the rebuild.
        let found = table
            .indexes()
            .index("idx_a")
            .unwrap()
            .search(CompareOp::Eq, &Value::Int64(3), 3, T3);
        assert_eq!(found, vec![rows[0].0]);
    }

    #[test]
    fn dropped_collection_refuses_writes() {
        let mut table = store();
        table.mark_dropped();
        let err = table.append(&chunk(&[(1, "x")]), T1).unwrap_err();
        assert!(matches!(err, Error::CollectionDropped { .. }));
    }

    #[test]
    fn pruned_scan_skips_disjoint_groups() {
        let mut table = TableStore::new(
            CollectionName::new("db", "t"),
            Schema::new(vec![ColumnDefinition::new("a", LogicalType::BigInt)]),
        );
        let rows: Vec<Vec<Value>> = (0..ROW_GROUP_CAPACITY * 2)
            .map(|i| vec![Value::Int64(i as i64)])
            .collect();
        let chunk = DataChunk::from_rows(vec![LogicalType::BigInt], &rows).unwrap();
        table.append(&chunk, T1).unwrap();
        table.commit(T1, 1);

        // Group 0 holds 0..2047, group 1 holds 2048..4095; an equality on
        // 4000 must only surface from the second group.
        let probe = Value::Int64(4000);
        let hits: Vec<_> = table
            .scan(2, T2, Some((0, CompareOp::Eq, &probe)))
            .filter(|(_, row)| row[0] == probe)
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(decode_row_id(hits[0].0).0, 1);
    }
}
