//! Crash recovery: merge the partitions, gate on commit markers.

use crate::reader::scan_partition;
use crate::record::{RecordBody, WalId, WalRecord};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// One step of the replay, in global wal-id order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayAction {
    /// A transaction-less catalog record, applied the moment it is seen.
    Catalog {
        /// Position of the record
        wal_id: WalId,
        /// Serialized plan node
        node: Vec<u8>,
        /// Serialized bound parameters
        params: Vec<u8>,
    },
    /// A committed transaction: its buffered operations in arrival order,
    /// replayed with a commit id re-sequenced into the commit space.
    Transaction {
        /// Position of the commit marker
        commit_wal_id: WalId,
        /// Original transaction id from the records
        txn_id: u64,
        /// Re-sequenced commit id to stamp replayed rows with
        commit_id: u64,
        /// The transaction's records in arrival order
        operations: Vec<WalRecord>,
    },
}

/// Outcome of draining and ordering the whole log.
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Replay steps in global wal-id order
    pub actions: Vec<ReplayAction>,
    /// Highest wal id seen across partitions
    pub max_wal_id: WalId,
    /// First commit id not used by the replay
    pub next_commit_id: u64,
    /// Number of unterminated transactions that were discarded
    pub discarded_txns: usize,
    /// Whether any partition ended in a torn tail
    pub torn: bool,
}

/// Read every partition, merge the streams by wal id, and group records
/// into replay actions.
///
/// Rules:
/// - A DATA record with `txn_id == 0` is a catalog mutation and becomes
///   its own action at its wal-id position.
/// - Any other record is buffered under its transaction id.
/// - A COMMIT marker flushes its transaction's buffer into an action at
///   the marker's position, with the next dense commit id starting from
///   `first_commit_id`.
/// - Buffers still pending at end of log are dropped: the transaction
///   never became durable.
pub fn recover(dir: &Path, workers: usize, first_commit_id: u64) -> std::io::Result<RecoveryResult> {
    let mut merged: Vec<WalRecord> = Vec::new();
    let mut result = RecoveryResult {
        next_commit_id: first_commit_id,
        ..Default::default()
    };

    for worker in 0..workers {
        let scan = scan_partition(dir, worker)?;
        result.torn |= scan.torn;
        result.max_wal_id = result.max_wal_id.max(scan.last_wal_id);
        merged.extend(scan.records);
    }
    // Partition files are individually ordered; the single logical
    // sequence is re-established here.
    merged.sort_by_key(|record| record.wal_id);

    let mut pending: HashMap<u64, Vec<WalRecord>> = HashMap::new();

    for record in merged {
        match &record.body {
            RecordBody::Data { node, params } if record.txn_id == 0 => {
                result.actions.push(ReplayAction::Catalog {
                    wal_id: record.wal_id,
                    node: node.clone(),
                    params: params.clone(),
                });
            }
            RecordBody::Commit => {
                let operations = pending.remove(&record.txn_id).unwrap_or_default();
                let commit_id = result.next_commit_id;
                result.next_commit_id += 1;
                debug!(
                    txn_id = record.txn_id,
                    commit_id,
                    operations = operations.len(),
                    "replaying committed transaction"
                );
                result.actions.push(ReplayAction::Transaction {
                    commit_wal_id: record.wal_id,
                    txn_id: record.txn_id,
                    commit_id,
                    operations,
                });
            }
            _ => {
                pending.entry(record.txn_id).or_default().push(record);
            }
        }
    }

    result.discarded_txns = pending.len();
    if !pending.is_empty() {
        warn!(
            count = pending.len(),
            "discarding transactions without commit markers"
        );
    }
    info!(
        actions = result.actions.len(),
        max_wal_id = result.max_wal_id,
        discarded = result.discarded_txns,
        "wal recovery scan complete"
    );
    Ok(result)
}
