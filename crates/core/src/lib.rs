//! Core types for the Otterbrix kernel
//!
//! This crate defines the vocabulary shared by every layer:
//! - Logical types, column definitions and schemas
//! - The polymorphic `Value` scalar and typed column vectors
//! - `DataChunk`, the unit of bulk data movement
//! - The unified error type with the engine's error-code taxonomy
//! - MVCC constants and the row-id encoding

#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod types;
pub mod value;

pub use chunk::{ColumnData, ColumnVector, DataChunk, ValidityMask};
pub use error::{Error, ErrorCode, Result};
pub use types::{CollectionName, ColumnDefinition, CompareOp, LogicalType, Schema, StorageKind};
pub use value::Value;

/// Threshold splitting the u64 id space: values below are commit ids,
/// values at or above are active transaction ids.
pub const TXN_BASE: u64 = 1 << 62;

/// Sentinel for a row version that has never been deleted.
pub const NOT_DELETED: u64 = u64::MAX;

/// Maximum number of rows a row group holds.
pub const ROW_GROUP_CAPACITY: usize = 2048;

/// log2 of [`ROW_GROUP_CAPACITY`]; shift for the global row-id encoding.
pub const ROW_GROUP_SHIFT: u32 = 11;

/// Encode a (row group, slot) pair into a global row id.
#[inline]
pub fn encode_row_id(group: usize, slot: usize) -> i64 {
    ((group as i64) << ROW_GROUP_SHIFT) | slot as i64
}

/// Decode a global row id back into (row group, slot).
#[inline]
pub fn decode_row_id(row_id: i64) -> (usize, usize) {
    (
        (row_id >> ROW_GROUP_SHIFT) as usize,
        (row_id & ((1 << ROW_GROUP_SHIFT) - 1)) as usize,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_id_roundtrip() {
        for (group, slot) in [(0, 0), (0, 2047), (1, 0), (7, 1234), (1 << 20, 2047)] {
            let id = encode_row_id(group, slot);
            assert_eq!(decode_row_id(id), (group, slot));
        }
    }

    #[test]
    fn txn_base_splits_id_space() {
        assert!(1 < TXN_BASE);
        assert!(TXN_BASE < NOT_DELETED);
        // Commit ids stay in the lower half, txn ids in the upper half.
        assert_eq!(TXN_BASE + 1 >= TXN_BASE, true);
    }
}
