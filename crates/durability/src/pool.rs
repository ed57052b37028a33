//! The WAL writer pool: W partition actors behind one append interface.

use crate::config::WalConfig;
use crate::record::{RecordBody, WalId};
use crate::writer::WalWriter;
use otterbrix_concurrency::{promise, Mailbox, Promise};
use otterbrix_core::{CollectionName, Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

enum WalRequest {
    Append {
        txn_id: u64,
        body: RecordBody,
        reply: Promise<std::io::Result<WalId>>,
    },
    Flush {
        reply: Promise<std::io::Result<()>>,
    },
    TruncateUpTo {
        wal_id: WalId,
        reply: Promise<std::io::Result<usize>>,
    },
    HighWater {
        reply: Promise<WalId>,
    },
}

struct Partition {
    mailbox: Mailbox<WalRequest>,
    healthy: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// W append-only writer actors, one per partition.
///
/// Records for the same collection are routed to the same partition by
/// (database, collection) hash; keyless records round-robin. An I/O
/// failure inside a partition marks it unhealthy and every later append
/// to it is refused until restart.
pub struct WalPool {
    partitions: Vec<Partition>,
    round_robin: AtomicUsize,
}

impl WalPool {
    /// Open every partition and start its actor thread.
    pub fn open(dir: &Path, config: WalConfig) -> Result<Self> {
        let workers = config.workers;
        let mut partitions = Vec::with_capacity(workers);
        for worker in 0..workers {
            let mut writer = WalWriter::open(dir, worker, workers, config.clone())?;
            let mailbox: Mailbox<WalRequest> = Mailbox::new();
            let healthy = Arc::new(AtomicBool::new(true));
            let thread = {
                let mailbox = mailbox.clone();
                let healthy = Arc::clone(&healthy);
                std::thread::Builder::new()
                    .name(format!("wal-{}", worker))
                    .spawn(move || {
                        while let Some(request) = mailbox.recv() {
                            match request {
                                WalRequest::Append {
                                    txn_id,
                                    body,
                                    reply,
                                } => {
                                    let result = writer.append(txn_id, body);
                                    if let Err(e) = &result {
                                        error!(worker = writer.worker(), error = %e,
                                               "wal append failed, partition unhealthy");
                                        healthy.store(false, Ordering::SeqCst);
                                    }
                                    reply.fulfill(result);
                                }
                                WalRequest::Flush { reply } => {
                                    let result = writer.flush();
                                    if result.is_err() {
                                        healthy.store(false, Ordering::SeqCst);
                                    }
                                    reply.fulfill(result);
                                }
                                WalRequest::TruncateUpTo { wal_id, reply } => {
                                    reply.fulfill(writer.truncate_up_to(wal_id));
                                }
                                WalRequest::HighWater { reply } => {
                                    reply.fulfill(writer.last_wal_id());
                                }
                            }
                        }
                        let _ = writer.flush();
                    })
                    .expect("spawn wal worker thread")
            };
            partitions.push(Partition {
                mailbox,
                healthy,
                thread: Some(thread),
            });
        }
        info!(workers, "wal pool started");
        Ok(WalPool {
            partitions,
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Number of writer partitions.
    pub fn workers(&self) -> usize {
        self.partitions.len()
    }

    /// Whether a partition still accepts writes.
    pub fn is_healthy(&self, partition: usize) -> bool {
        self.partitions[partition].healthy.load(Ordering::SeqCst)
    }

    /// Partition a collection's records are routed to.
    pub fn route(&self, key: Option<&CollectionName>) -> usize {
        match key {
            Some(name) => {
                let mut hasher = DefaultHasher::new();
                name.database.hash(&mut hasher);
                name.collection.hash(&mut hasher);
                (hasher.finish() % self.partitions.len() as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.partitions.len(),
        }
    }

    /// Append a record, routed by `key`, and wait for the partition's
    /// acknowledgment. This is the dispatcher's durability suspension
    /// point.
    pub fn append(
        &self,
        key: Option<&CollectionName>,
        txn_id: u64,
        body: RecordBody,
    ) -> Result<WalId> {
        let partition = self.route(key);
        self.append_to(partition, txn_id, body)
    }

    /// Append to an explicit partition. Commit markers use this to land
    /// in the same partition as the transaction's data records.
    pub fn append_to(&self, partition: usize, txn_id: u64, body: RecordBody) -> Result<WalId> {
        let slot = &self.partitions[partition];
        if !slot.healthy.load(Ordering::SeqCst) {
            return Err(Error::WalUnhealthy {
                partition,
                what: "previous write failed".to_string(),
            });
        }
        let (reply, future) = promise();
        if !slot.mailbox.push(WalRequest::Append {
            txn_id,
            body,
            reply,
        }) {
            return Err(Error::WalUnhealthy {
                partition,
                what: "writer shut down".to_string(),
            });
        }
        match future.wait() {
            Some(Ok(wal_id)) => Ok(wal_id),
            Some(Err(e)) => Err(Error::WalUnhealthy {
                partition,
                what: e.to_string(),
            }),
            None => Err(Error::WalUnhealthy {
                partition,
                what: "writer died mid-request".to_string(),
            }),
        }
    }

    /// Fsync every partition.
    pub fn flush_all(&self) -> Result<()> {
        let mut futures = Vec::with_capacity(self.partitions.len());
        for slot in &self.partitions {
            let (reply, future) = promise();
            if slot.mailbox.push(WalRequest::Flush { reply }) {
                futures.push(future);
            }
        }
        for future in futures {
            match future.wait() {
                Some(Ok(())) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(Error::Internal("wal writer died during flush".to_string()))
                }
            }
        }
        Ok(())
    }

    /// Prune closed segments fully covered by `up_to` in every partition.
    pub fn truncate_up_to(&self, up_to: WalId) -> Result<usize> {
        let mut pruned = 0;
        for slot in &self.partitions {
            let (reply, future) = promise();
            if slot.mailbox.push(WalRequest::TruncateUpTo {
                wal_id: up_to,
                reply,
            }) {
                match future.wait() {
                    Some(Ok(count)) => pruned += count,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(Error::Internal(
                            "wal writer died during truncation".to_string(),
                        ))
                    }
                }
            }
        }
        Ok(pruned)
    }

    /// Highest wal id issued across all partitions.
    pub fn high_water_mark(&self) -> Result<WalId> {
        let mut highest = 0;
        for slot in &self.partitions {
            let (reply, future) = promise();
            if slot.mailbox.push(WalRequest::HighWater { reply }) {
                match future.wait() {
                    Some(id) => highest = highest.max(id),
                    None => {
                        return Err(Error::Internal("wal writer died during query".to_string()))
                    }
                }
            }
        }
        Ok(highest)
    }

    /// Stop every partition actor, flushing on the way out.
    pub fn shutdown(&mut self) {
        for slot in &self.partitions {
            slot.mailbox.close();
        }
        for slot in &mut self.partitions {
            if let Some(thread) = slot.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for WalPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
