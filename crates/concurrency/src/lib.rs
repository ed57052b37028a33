//! Concurrency primitives for the Otterbrix kernel
//!
//! The transaction manager keeps two counters and one set: dense commit
//! ids below `TXN_BASE`, free transaction ids above it, and the active
//! map that yields the lowest active start timestamp used for tombstone
//! garbage collection. The actor module carries the mailbox and
//! promise/future pair every service in the kernel is built on.

#![warn(clippy::all)]

pub mod actor;
pub mod manager;
pub mod snapshot;

pub use actor::{promise, Mailbox, Promise, ReplyFuture};
pub use manager::{Transaction, TransactionManager};
pub use snapshot::Snapshot;
