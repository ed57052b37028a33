//! One WAL writer partition.

use crate::config::{FsyncPolicy, WalConfig};
use crate::reader::scan_partition;
use crate::record::{RecordBody, RecordKind, WalId, WalRecord};
use crate::segment::{list_segments, segment_file_name, WalSegment};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// Appends records to one partition of the WAL.
///
/// Writer `w` of a pool of `W` issues wal ids `w + W, w + 2W, ...`; the
/// stride keeps the logical sequence disjoint across partitions so the
/// recovery merge can re-establish total order. The chained CRC reseeds
/// to zero at each segment start.
#[derive(Debug)]
pub struct WalWriter {
    dir: PathBuf,
    worker: usize,
    worker_count: usize,
    config: WalConfig,
    segment: WalSegment,
    seq: u64,
    last_wal_id: WalId,
    last_crc: u32,
    last_sync: Instant,
    unsynced: bool,
}

impl WalWriter {
    /// Open the partition: discard any torn tail, remove unreachable
    /// segments after a corruption point, and position for appending.
    pub fn open(
        dir: &Path,
        worker: usize,
        worker_count: usize,
        config: WalConfig,
    ) -> std::io::Result<Self> {
        assert!(worker < worker_count);
        let scan = scan_partition(dir, worker)?;

        for seq in &scan.stale_seqs {
            warn!(worker, seq, "removing wal segment after corruption point");
            std::fs::remove_file(dir.join(segment_file_name(worker, *seq)))?;
        }

        let (segment, seq) = match scan.append_seq {
            Some(seq) => {
                let mut segment = WalSegment::open_append(dir, worker, seq)?;
                if segment.size() != scan.append_offset {
                    warn!(
                        worker,
                        seq,
                        from = segment.size(),
                        to = scan.append_offset,
                        "truncating torn wal tail"
                    );
                    segment.truncate(scan.append_offset)?;
                }
                (segment, seq)
            }
            None => (WalSegment::create(dir, worker, 1)?, 1),
        };

        let last_wal_id = if scan.last_wal_id == 0 {
            worker as WalId
        } else {
            scan.last_wal_id
        };

        Ok(WalWriter {
            dir: dir.to_path_buf(),
            worker,
            worker_count,
            config,
            segment,
            seq,
            last_wal_id,
            last_crc: scan.append_last_crc,
            last_sync: Instant::now(),
            unsynced: false,
        })
    }

    /// Partition index.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Highest wal id this partition has issued.
    pub fn last_wal_id(&self) -> WalId {
        self.last_wal_id
    }

    /// Append one record and return its wal id.
    ///
    /// Rotates to a fresh segment first when the frame would push the
    /// current one past the configured size. With the on-commit policy a
    /// commit marker forces an fsync before the append is acknowledged.
    pub fn append(&mut self, txn_id: u64, body: RecordBody) -> std::io::Result<WalId> {
        let wal_id = self.last_wal_id + self.worker_count as WalId;
        let is_commit = body.kind() == RecordKind::Commit;

        let mut record = WalRecord {
            last_crc: self.last_crc,
            wal_id,
            txn_id,
            body,
        };
        let (mut frame, mut crc) = record.to_bytes();

        if self.segment.size() > 0
            && self.segment.size() + frame.len() as u64 > self.config.max_segment_size
        {
            self.rotate()?;
            // The chain reseeds with the segment, so the frame changes.
            record.last_crc = self.last_crc;
            let rebuilt = record.to_bytes();
            frame = rebuilt.0;
            crc = rebuilt.1;
        }

        self.segment.write(&frame)?;
        self.last_wal_id = wal_id;
        self.last_crc = crc;
        self.unsynced = true;
        self.maybe_sync(is_commit)?;
        Ok(wal_id)
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.segment.sync()?;
        self.seq += 1;
        debug!(worker = self.worker, seq = self.seq, "rotating wal segment");
        self.segment = WalSegment::create(&self.dir, self.worker, self.seq)?;
        self.last_crc = 0;
        Ok(())
    }

    fn maybe_sync(&mut self, is_commit: bool) -> std::io::Result<()> {
        let due = match self.config.fsync {
            FsyncPolicy::OnCommit => is_commit,
            FsyncPolicy::Interval { millis } => {
                self.last_sync.elapsed().as_millis() as u64 >= millis
            }
        };
        if due && self.unsynced {
            self.segment.sync()?;
            self.last_sync = Instant::now();
            self.unsynced = false;
        }
        Ok(())
    }

    /// Force everything written so far to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        if self.unsynced {
            self.segment.sync()?;
            self.last_sync = Instant::now();
            self.unsynced = false;
        }
        Ok(())
    }

    /// Remove closed segments entirely covered by a checkpoint: every
    /// record in them has `wal_id <= up_to`. Returns how many files were
    /// pruned. Wal ids grow monotonically within a partition, so the walk
    /// stops at the first segment that is not covered.
    pub fn truncate_up_to(&mut self, up_to: WalId) -> std::io::Result<usize> {
        let mut pruned = 0;
        for seq in list_segments(&self.dir, self.worker)? {
            if seq >= self.seq {
                break;
            }
            let buffer = WalSegment::read_all(&self.dir, self.worker, seq)?;
            let mut offset = 0;
            let mut max_id = 0;
            while offset < buffer.len() {
                match WalRecord::from_bytes(&buffer[offset..]) {
                    Ok((record, _, consumed)) => {
                        max_id = max_id.max(record.wal_id);
                        offset += consumed;
                    }
                    Err(_) => break,
                }
            }
            if max_id <= up_to {
                debug!(worker = self.worker, seq, max_id, "pruning wal segment");
                std::fs::remove_file(self.dir.join(segment_file_name(self.worker, seq)))?;
                pruned += 1;
            } else {
                break;
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::scan_partition;
    use otterbrix_core::CollectionName;
    use tempfile::tempdir;

    fn insert_body(rows: usize) -> RecordBody {
        RecordBody::PhysicalInsert {
            collection: CollectionName::new("db", "t"),
            chunk: vec![7u8; rows],
            row_start: 0,
            row_count: rows as u64,
        }
    }

    #[test]
    fn wal_ids_stride_by_worker_count() {
        let dir = tempdir().unwrap();
        let mut w0 = WalWriter::open(dir.path(), 0, 2, WalConfig::for_testing().with_workers(2))
            .unwrap();
        let mut w1 = WalWriter::open(dir.path(), 1, 2, WalConfig::for_testing().with_workers(2))
            .unwrap();

        assert_eq!(w0.append(0, RecordBody::Commit).unwrap(), 2);
        assert_eq!(w0.append(0, RecordBody::Commit).unwrap(), 4);
        assert_eq!(w1.append(0, RecordBody::Commit).unwrap(), 3);
        assert_eq!(w1.append(0, RecordBody::Commit).unwrap(), 5);
    }

    #[test]
    fn reopen_continues_sequence_and_chain() {
        let dir = tempdir().unwrap();
        {
            let mut writer =
                WalWriter::open(dir.path(), 0, 1, WalConfig::for_testing()).unwrap();
            assert_eq!(writer.append(7, insert_body(10)).unwrap(), 1);
            assert_eq!(writer.append(7, RecordBody::Commit).unwrap(), 2);
        }
        {
            let mut writer =
                WalWriter::open(dir.path(), 0, 1, WalConfig::for_testing()).unwrap();
            assert_eq!(writer.append(8, insert_body(10)).unwrap(), 3);
        }
        let scan = scan_partition(dir.path(), 0).unwrap();
        assert_eq!(
            scan.records.iter().map(|r| r.wal_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(!scan.torn);
    }

    #[test]
    fn rotation_at_size_boundary() {
        let dir = tempdir().unwrap();
        let config = WalConfig::for_testing().with_max_segment_size(256);
        let mut writer = WalWriter::open(dir.path(), 0, 1, config).unwrap();
        for _ in 0..10 {
            writer.append(1, insert_body(100)).unwrap();
        }
        let seqs = list_segments(dir.path(), 0).unwrap();
        assert!(seqs.len() > 1, "writer should have rotated");

        // Every record is still readable across the rotation.
        let scan = scan_partition(dir.path(), 0).unwrap();
        assert_eq!(scan.records.len(), 10);
        assert!(!scan.torn);
    }

    #[test]
    fn torn_tail_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut writer =
                WalWriter::open(dir.path(), 0, 1, WalConfig::for_testing()).unwrap();
            writer.append(1, insert_body(10)).unwrap();
            writer.append(1, RecordBody::Commit).unwrap();
        }
        // Tear the last record.
        let path = dir.path().join(segment_file_name(0, 1));
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 2]).unwrap();

        let mut writer = WalWriter::open(dir.path(), 0, 1, WalConfig::for_testing()).unwrap();
        // The torn commit is gone; the next id reuses its slot.
        assert_eq!(writer.last_wal_id(), 1);
        assert_eq!(writer.append(1, RecordBody::Commit).unwrap(), 2);

        let scan = scan_partition(dir.path(), 0).unwrap();
        assert_eq!(scan.records.len(), 2);
        assert!(!scan.torn);
    }

    #[test]
    fn truncate_prunes_covered_segments() {
        let dir = tempdir().unwrap();
        let config = WalConfig::for_testing().with_max_segment_size(256);
        let mut writer = WalWriter::open(dir.path(), 0, 1, config).unwrap();
        let mut last = 0;
        for _ in 0..10 {
            last = writer.append(1, insert_body(100)).unwrap();
        }
        let before = list_segments(dir.path(), 0).unwrap().len();
        assert!(before > 2);

        let pruned = writer.truncate_up_to(last).unwrap();
        assert_eq!(pruned, before - 1, "all closed segments were covered");
        // The active segment always survives.
        assert_eq!(list_segments(dir.path(), 0).unwrap().len(), 1);

        // Nothing pruned when the bound predates remaining records.
        assert_eq!(writer.truncate_up_to(0).unwrap(), 0);
    }
}
