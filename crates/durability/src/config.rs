//! WAL configuration.

/// When segment files are forced to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Every commit marker forces an fsync before the append is
    /// acknowledged. Strongest guarantee, one fsync per transaction.
    OnCommit,
    /// Background flush on a timer; a crash may lose the tail written
    /// since the last flush. Recovery tolerates the torn tail.
    Interval {
        /// Flush period in milliseconds
        millis: u64,
    },
}

/// Tunables for the WAL writer pool.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Number of writer partitions. 1 is valid and common.
    pub workers: usize,
    /// Rotation threshold: a record that would push the current segment
    /// past this size goes into a fresh segment instead.
    pub max_segment_size: u64,
    /// Fsync policy.
    pub fsync: FsyncPolicy,
}

impl WalConfig {
    /// Production defaults: one worker, 64 MiB segments, fsync on commit.
    pub fn new() -> Self {
        WalConfig {
            workers: 1,
            max_segment_size: 64 * 1024 * 1024,
            fsync: FsyncPolicy::OnCommit,
        }
    }

    /// Small segments and strict fsync, for tests that exercise rotation
    /// and crash recovery.
    pub fn for_testing() -> Self {
        WalConfig {
            workers: 1,
            max_segment_size: 64 * 1024,
            fsync: FsyncPolicy::OnCommit,
        }
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        assert!(workers >= 1, "wal needs at least one worker");
        self.workers = workers;
        self
    }

    /// Set the rotation threshold.
    pub fn with_max_segment_size(mut self, bytes: u64) -> Self {
        self.max_segment_size = bytes;
        self
    }

    /// Set the fsync policy.
    pub fn with_fsync(mut self, fsync: FsyncPolicy) -> Self {
        self.fsync = fsync;
        self
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self::new()
    }
}
