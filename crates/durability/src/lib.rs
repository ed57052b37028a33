//! Durability pipeline for the Otterbrix kernel
//!
//! A pool of W append-only segment writers partitions a single logical
//! record sequence: record `wal_id = k·W + w` lives in writer `w`'s file.
//! Records are framed `[size:u32_be][payload][crc32c:u32_be]` with a
//! chained CRC inside the payload so missing or reordered records are
//! detectable. Recovery drains every partition, merges by wal_id, and
//! replays only transactions whose commit marker made it to disk.

#![warn(clippy::all)]

pub mod config;
pub mod pool;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod writer;

pub use config::{FsyncPolicy, WalConfig};
pub use pool::WalPool;
pub use reader::scan_partition;
pub use record::{RecordBody, RecordKind, WalCodecError, WalId, WalRecord};
pub use recovery::{recover, RecoveryResult, ReplayAction};
pub use segment::WalSegment;
pub use writer::WalWriter;
