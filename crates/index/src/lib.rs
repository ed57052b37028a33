//! Secondary indexes for the Otterbrix kernel
//!
//! An index is an ordered multi-map mirroring its table under the same
//! MVCC discipline: every entry carries its own insert/delete timestamps
//! so visibility can be answered without touching the table. Uncommitted
//! work is tracked in per-transaction side-buffers, making commit and
//! rollback proportional to the transaction's footprint in the index.

#![warn(clippy::all)]

pub mod engine;
pub mod ordered;

pub use engine::{IndexChoice, IndexEngine};
pub use ordered::{entry_visible, IndexEntry, IndexKey, SingleFieldIndex};
