//! MVCC columnar storage for the Otterbrix kernel
//!
//! A collection's in-memory state is a list of row groups, each a block
//! of typed column vectors with a row-version block beside it. Visibility
//! follows the snapshot rules in `otterbrix-core`; secondary indexes are
//! kept in lockstep by the table store. Disk-backed collections
//! additionally write `table.otbx` checkpoint files.

#![warn(clippy::all)]

pub mod checkpoint;
pub mod row_group;
pub mod table;
pub mod version;

pub use checkpoint::{CheckpointFooter, CheckpointReader, CheckpointWriter, IndexMeta};
pub use row_group::RowGroup;
pub use table::TableStore;
pub use version::{row_visible, RowVersionManager};
