//! Sequential WAL readers with torn-tail tolerance.

use crate::record::{WalId, WalRecord};
use crate::segment::{list_segments, WalSegment};
use std::path::Path;
use tracing::warn;

/// Everything learned from draining one writer partition.
#[derive(Debug, Default)]
pub struct PartitionScan {
    /// Records in file order, ending at the first framing, checksum or
    /// chain error.
    pub records: Vec<WalRecord>,
    /// Highest wal id among the good records, 0 when none.
    pub last_wal_id: WalId,
    /// Segment the writer should continue appending to.
    pub append_seq: Option<u64>,
    /// Byte offset of the end of the last good record in that segment.
    pub append_offset: u64,
    /// Payload checksum of the last good record in that segment; seeds
    /// the chain for the next append.
    pub append_last_crc: u32,
    /// Segments after the stop point. Their records are unreachable and
    /// the writer removes them before appending.
    pub stale_seqs: Vec<u64>,
    /// Whether a torn tail or corruption ended the scan early.
    pub torn: bool,
}

/// Drain one partition's segments in sequence order.
///
/// Inside each segment the chained CRC is validated: record N+1 must
/// carry the payload checksum of record N, seeded to zero at segment
/// start. The first violation of framing, checksum or chain ends the
/// scan; everything before it is returned.
pub fn scan_partition(dir: &Path, worker: usize) -> std::io::Result<PartitionScan> {
    let seqs = list_segments(dir, worker)?;
    let mut scan = PartitionScan::default();

    for (position, &seq) in seqs.iter().enumerate() {
        let buffer = WalSegment::read_all(dir, worker, seq)?;
        let mut offset = 0usize;
        let mut chain = 0u32;

        scan.append_seq = Some(seq);
        scan.append_offset = 0;
        scan.append_last_crc = 0;

        while offset < buffer.len() {
            match WalRecord::from_bytes(&buffer[offset..]) {
                Ok((record, crc, consumed)) => {
                    if record.last_crc != chain {
                        warn!(
                            worker,
                            seq,
                            offset,
                            expected = chain,
                            found = record.last_crc,
                            "wal chain break, discarding tail"
                        );
                        scan.torn = true;
                        break;
                    }
                    chain = crc;
                    scan.last_wal_id = scan.last_wal_id.max(record.wal_id);
                    scan.records.push(record);
                    offset += consumed;
                    scan.append_offset = offset as u64;
                    scan.append_last_crc = chain;
                }
                Err(e) => {
                    warn!(worker, seq, offset, error = %e, "wal tail unreadable, discarding");
                    scan.torn = true;
                    break;
                }
            }
        }

        if scan.torn {
            scan.stale_seqs = seqs[position + 1..].to_vec();
            break;
        }
    }

    Ok(scan)
}
