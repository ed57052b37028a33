//! Capacity-bounded columnar blocks.

use crate::version::RowVersionManager;
use otterbrix_core::{
    ColumnVector, CompareOp, Error, LogicalType, Result, Value, ROW_GROUP_CAPACITY,
};

/// Lazily maintained per-column minimum and maximum, used to skip whole
/// groups during predicate scans. Only orderable columns carry hints;
/// deletes leave them stale, which keeps pruning conservative but safe.
#[derive(Debug, Clone, Default)]
struct ColumnStats {
    min: Option<Value>,
    max: Option<Value>,
}

impl ColumnStats {
    fn observe(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        match &self.min {
            Some(min) if value.sort_cmp(min).is_ge() => {}
            _ => self.min = Some(value.clone()),
        }
        match &self.max {
            Some(max) if value.sort_cmp(max).is_le() => {}
            _ => self.max = Some(value.clone()),
        }
    }
}

/// One column-store block: a typed vector per column plus the row-version
/// block. Append-only in identity; slots are never renumbered while the
/// group lives.
#[derive(Debug)]
pub struct RowGroup {
    columns: Vec<ColumnVector>,
    versions: RowVersionManager,
    stats: Vec<ColumnStats>,
}

impl RowGroup {
    /// Empty group for the given column types.
    pub fn new(types: Vec<LogicalType>) -> Self {
        let stats = types.iter().map(|_| ColumnStats::default()).collect();
        RowGroup {
            columns: types.into_iter().map(ColumnVector::new).collect(),
            versions: RowVersionManager::new(),
            stats,
        }
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of occupied slots, dead ones included.
    pub fn cardinality(&self) -> usize {
        self.versions.len()
    }

    /// Maximum number of slots.
    pub fn capacity(&self) -> usize {
        ROW_GROUP_CAPACITY
    }

    /// Whether the group has no free slots left.
    pub fn is_full(&self) -> bool {
        self.cardinality() >= ROW_GROUP_CAPACITY
    }

    /// Logical column types.
    pub fn types(&self) -> Vec<LogicalType> {
        self.columns.iter().map(|c| c.logical_type().clone()).collect()
    }

    /// The version block.
    pub fn versions(&self) -> &RowVersionManager {
        &self.versions
    }

    /// Mutable version block.
    pub fn versions_mut(&mut self) -> &mut RowVersionManager {
        &mut self.versions
    }

    /// Append one row stamped with `insert_id`. Returns the slot, or
    /// `RowGroupFull` at capacity.
    pub fn append_row(&mut self, row: &[Value], insert_id: u64) -> Result<usize> {
        if self.is_full() {
            return Err(Error::RowGroupFull);
        }
        if row.len() != self.columns.len() {
            return Err(Error::Invalid(format!(
                "row width {} does not match group width {}",
                row.len(),
                self.columns.len()
            )));
        }
        for ((column, value), stats) in self.columns.iter_mut().zip(row).zip(&mut self.stats) {
            column.push(value)?;
            stats.observe(value);
        }
        Ok(self.versions.push(insert_id))
    }

    /// Bulk-copy rows from `chunk`, starting at `offset`, until the chunk
    /// is drained or the group is full. Returns how many rows were
    /// copied; the rest stays with the caller.
    pub fn append_chunk(
        &mut self,
        chunk: &otterbrix_core::DataChunk,
        offset: usize,
        insert_id: u64,
    ) -> Result<usize> {
        let available = ROW_GROUP_CAPACITY - self.cardinality();
        let take = available.min(chunk.cardinality().saturating_sub(offset));
        for row_index in offset..offset + take {
            self.append_row(&chunk.row(row_index), insert_id)?;
        }
        Ok(take)
    }

    /// Read one cell.
    pub fn value(&self, column: usize, slot: usize) -> Value {
        self.columns[column].value(slot)
    }

    /// Overwrite one cell. Pruning hints only widen, so stale hints stay
    /// conservative.
    pub fn set_value(&mut self, column: usize, slot: usize, value: &Value) -> Result<()> {
        self.columns[column].set_value(slot, value)?;
        self.stats[column].observe(value);
        Ok(())
    }

    /// Read one row.
    pub fn row(&self, slot: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.value(slot)).collect()
    }

    /// Whether the whole group can be skipped for `column op value`.
    ///
    /// True only when the hint range is provably disjoint from the
    /// predicate. Groups without hints (all NULL or empty) are skipped for
    /// comparison operators, which never match NULL.
    pub fn can_skip(&self, column: usize, op: CompareOp, value: &Value) -> bool {
        let stats = &self.stats[column];
        let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
            // No non-NULL value was ever appended; comparisons match nothing.
            return true;
        };
        match op {
            CompareOp::Eq => value.sort_cmp(min).is_lt() || value.sort_cmp(max).is_gt(),
            CompareOp::Ne => false,
            CompareOp::Lt => min.sort_cmp(value).is_ge(),
            CompareOp::Le => min.sort_cmp(value).is_gt(),
            CompareOp::Gt => max.sort_cmp(value).is_le(),
            CompareOp::Ge => max.sort_cmp(value).is_lt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otterbrix_core::TXN_BASE;

    const T1: u64 = TXN_BASE + 1;

    fn group() -> RowGroup {
        RowGroup::new(vec![LogicalType::BigInt, LogicalType::String])
    }

    #[test]
    fn append_and_read() {
        let mut g = group();
        let slot = g
            .append_row(&[Value::Int64(7), Value::String("x".to_string())], T1)
            .unwrap();
        assert_eq!(slot, 0);
        assert_eq!(g.cardinality(), 1);
        assert_eq!(g.value(0, 0), Value::Int64(7));
        assert_eq!(g.row(0), vec![Value::Int64(7), Value::String("x".to_string())]);
    }

    #[test]
    fn full_group_rejects_append() {
        let mut g = RowGroup::new(vec![LogicalType::BigInt]);
        for i in 0..ROW_GROUP_CAPACITY {
            g.append_row(&[Value::Int64(i as i64)], T1).unwrap();
        }
        assert!(g.is_full());
        let err = g.append_row(&[Value::Int64(0)], T1).unwrap_err();
        assert!(matches!(err, Error::RowGroupFull));
        // Nothing was lost on the failed append.
        assert_eq!(g.cardinality(), ROW_GROUP_CAPACITY);
    }

    #[test]
    fn width_mismatch_rejected() {
        let mut g = group();
        assert!(g.append_row(&[Value::Int64(1)], T1).is_err());
    }

    #[test]
    fn append_chunk_stops_at_capacity() {
        use otterbrix_core::DataChunk;

        let mut g = RowGroup::new(vec![LogicalType::BigInt]);
        let rows: Vec<Vec<Value>> = (0..ROW_GROUP_CAPACITY + 100)
            .map(|i| vec![Value::Int64(i as i64)])
            .collect();
        let chunk = DataChunk::from_rows(vec![LogicalType::BigInt], &rows).unwrap();

        let copied = g.append_chunk(&chunk, 0, T1).unwrap();
        assert_eq!(copied, ROW_GROUP_CAPACITY);
        assert!(g.is_full());
        // The remainder goes into a fresh group from the same offset.
        let mut g2 = RowGroup::new(vec![LogicalType::BigInt]);
        let copied2 = g2.append_chunk(&chunk, copied, T1).unwrap();
        assert_eq!(copied2, 100);
        assert_eq!(g2.value(0, 0), Value::Int64(ROW_GROUP_CAPACITY as i64));
    }

    #[test]
    fn pruning_hints() {
        let mut g = group();
        for i in [10i64, 20, 30] {
            g.append_row(&[Value::Int64(i), Value::Null], T1).unwrap();
        }
        // Range is [10, 30].
        assert!(g.can_skip(0, CompareOp::Eq, &Value::Int64(5)));
        assert!(g.can_skip(0, CompareOp::Eq, &Value::Int64(35)));
        assert!(!g.can_skip(0, CompareOp::Eq, &Value::Int64(20)));
        assert!(g.can_skip(0, CompareOp::Gt, &Value::Int64(30)));
        assert!(!g.can_skip(0, CompareOp::Gt, &Value::Int64(29)));
        assert!(g.can_skip(0, CompareOp::Lt, &Value::Int64(10)));
        assert!(!g.can_skip(0, CompareOp::Le, &Value::Int64(10)));
        assert!(!g.can_skip(0, CompareOp::Ne, &Value::Int64(20)));
    }

    #[test]
    fn all_null_column_prunes_comparisons() {
        let mut g = group();
        g.append_row(&[Value::Null, Value::Null], T1).unwrap();
        // No comparison matches NULL, so the group is skippable.
        assert!(g.can_skip(0, CompareOp::Eq, &Value::Int64(1)));
    }

    #[test]
    fn set_value_widens_hints() {
        let mut g = group();
        g.append_row(&[Value::Int64(10), Value::Null], T1).unwrap();
        g.set_value(0, 0, &Value::Int64(100)).unwrap();
        assert!(!g.can_skip(0, CompareOp::Eq, &Value::Int64(100)));
    }
}
