//! The memory-storage service: the actor owning all table stores.
//!
//! One thread drains the mailbox, so every operation on the same
//! collection is applied in the order received and index fan-out stays
//! atomic with respect to readers. The dispatcher suspends on the reply
//! future of each request; that is its storage-apply suspension point.

use otterbrix_concurrency::{promise, Mailbox, Promise};
use otterbrix_core::{
    CollectionName, DataChunk, Error, Result, Schema, StorageKind, Value,
};
use otterbrix_executor::{execute_select, Predicate, QueryOutput, RowContext, SelectPlan, TableProvider};
use otterbrix_storage::{CheckpointWriter, TableStore};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

struct CollectionContext {
    table: TableStore,
    storage: StorageKind,
}

#[derive(Default)]
struct StorageState {
    collections: FxHashMap<CollectionName, CollectionContext>,
}

impl TableProvider for StorageState {
    fn table(&self, name: &CollectionName) -> Result<&TableStore> {
        let context = self
            .collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })?;
        if context.table.is_dropped() {
            return Err(Error::CollectionDropped {
                name: name.to_string(),
            });
        }
        Ok(&context.table)
    }
}

impl StorageState {
    fn table_mut(&mut self, name: &CollectionName) -> Result<&mut TableStore> {
        let context = self
            .collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })?;
        if context.table.is_dropped() {
            return Err(Error::CollectionDropped {
                name: name.to_string(),
            });
        }
        Ok(&mut context.table)
    }
}

enum StorageRequest {
    CreateCollection {
        name: CollectionName,
        schema: Schema,
        storage: StorageKind,
        reply: Promise<Result<()>>,
    },
    DropCollection {
        name: CollectionName,
        reply: Promise<Result<()>>,
    },
    InstallTable {
        name: CollectionName,
        table: Box<TableStore>,
        storage: StorageKind,
        reply: Promise<()>,
    },
    CreateIndex {
        name: CollectionName,
        index_name: String,
        column: String,
        unique: bool,
        reply: Promise<Result<()>>,
    },
    DropIndex {
        name: CollectionName,
        index_name: String,
        reply: Promise<Result<bool>>,
    },
    NextRowId {
        name: CollectionName,
        reply: Promise<Result<i64>>,
    },
    Append {
        name: CollectionName,
        chunk: DataChunk,
        id: u64,
        reply: Promise<Result<Vec<i64>>>,
    },
    Delete {
        name: CollectionName,
        row_ids: Vec<i64>,
        id: u64,
        reply: Promise<Result<usize>>,
    },
    Update {
        name: CollectionName,
        row_ids: Vec<i64>,
        new_rows: DataChunk,
        id: u64,
        reply: Promise<Result<Vec<i64>>>,
    },
    Commit {
        collections: Vec<CollectionName>,
        txn_id: u64,
        commit_id: u64,
        reply: Promise<()>,
    },
    Abort {
        collections: Vec<CollectionName>,
        txn_id: u64,
        reply: Promise<()>,
    },
    Select {
        plan: Box<SelectPlan>,
        start_ts: u64,
        txn_id: u64,
        reply: Promise<Result<QueryOutput>>,
    },
    CollectRows {
        name: CollectionName,
        predicate: Option<Predicate>,
        limit: Option<usize>,
        start_ts: u64,
        txn_id: u64,
        reply: Promise<Result<Vec<(i64, Vec<Value>)>>>,
    },
    Vacuum {
        lowest_active: u64,
        reply: Promise<()>,
    },
    Checkpoint {
        root: PathBuf,
        safe_ts: u64,
        max_wal_id: u64,
        reply: Promise<Result<Vec<CollectionName>>>,
    },
}

fn handle(state: &mut StorageState, request: StorageRequest) {
    match request {
        StorageRequest::CreateCollection {
            name,
            schema,
            storage,
            reply,
        } => {
            debug!(collection = %name, "create collection");
            state.collections.insert(
                name.clone(),
                CollectionContext {
                    table: TableStore::new(name, schema),
                    storage,
                },
            );
            reply.fulfill(Ok(()));
        }
        StorageRequest::DropCollection { name, reply } => {
            let result = match state.collections.remove(&name) {
                Some(mut context) => {
                    context.table.mark_dropped();
                    debug!(collection = %name, "drop collection");
                    Ok(())
                }
                None => Err(Error::CollectionNotExists {
                    name: name.to_string(),
                }),
            };
            reply.fulfill(result);
        }
        StorageRequest::InstallTable {
            name,
            table,
            storage,
            reply,
        } => {
            state.collections.insert(
                name,
                CollectionContext {
                    table: *table,
                    storage,
                },
            );
            reply.fulfill(());
        }
        StorageRequest::CreateIndex {
            name,
            index_name,
            column,
            unique,
            reply,
        } => {
            let result = state
                .table_mut(&name)
                .and_then(|table| table.create_index(&index_name, &column, unique));
            reply.fulfill(result);
        }
        StorageRequest::DropIndex {
            name,
            index_name,
            reply,
        } => {
            let result = state
                .table_mut(&name)
                .map(|table| table.indexes_mut().drop_index(&index_name));
            reply.fulfill(result);
        }
        StorageRequest::NextRowId { name, reply } => {
            let result = state.table(&name).map(|table| {
                let groups = table.row_groups();
                match groups.last() {
                    Some(last) if !last.is_full() => otterbrix_core::encode_row_id(
                        groups.len() - 1,
                        last.cardinality(),
                    ),
                    Some(_) => otterbrix_core::encode_row_id(groups.len(), 0),
                    None => 0,
                }
            });
            reply.fulfill(result);
        }
        StorageRequest::Append {
            name,
            chunk,
            id,
            reply,
        } => {
            let result = state
                .table_mut(&name)
                .and_then(|table| table.append(&chunk, id));
            reply.fulfill(result);
        }
        StorageRequest::Delete {
            name,
            row_ids,
            id,
            reply,
        } => {
            let result = state
                .table_mut(&name)
                .and_then(|table| table.delete(&row_ids, id));
            reply.fulfill(result);
        }
        StorageRequest::Update {
            name,
            row_ids,
            new_rows,
            id,
            reply,
        } => {
            let result = state
                .table_mut(&name)
                .and_then(|table| table.update(&row_ids, &new_rows, id));
            reply.fulfill(result);
        }
        StorageRequest::Commit {
            collections,
            txn_id,
            commit_id,
            reply,
        } => {
            for name in collections {
                if let Ok(table) = state.table_mut(&name) {
                    table.commit(txn_id, commit_id);
                }
            }
            reply.fulfill(());
        }
        StorageRequest::Abort {
            collections,
            txn_id,
            reply,
        } => {
            for name in collections {
                if let Ok(table) = state.table_mut(&name) {
                    table.abort(txn_id);
                }
            }
            reply.fulfill(());
        }
        StorageRequest::Select {
            plan,
            start_ts,
            txn_id,
            reply,
        } => {
            reply.fulfill(execute_select(&plan, &*state, start_ts, txn_id));
        }
        StorageRequest::CollectRows {
            name,
            predicate,
            limit,
            start_ts,
            txn_id,
            reply,
        } => {
            let result = state.table(&name).and_then(|table| {
                let columns: Vec<String> = table
                    .schema()
                    .columns()
                    .iter()
                    .map(|c| c.name.clone())
                    .collect();
                let mut out = Vec::new();
                for (row_id, values) in table.scan(start_ts, txn_id, None) {
                    if let Some(predicate) = &predicate {
                        if !predicate.matches(&RowContext::new(&columns, &values))? {
                            continue;
                        }
                    }
                    out.push((row_id, values));
                    if limit.map(|l| out.len() >= l).unwrap_or(false) {
                        break;
                    }
                }
                Ok(out)
            });
            reply.fulfill(result);
        }
        StorageRequest::Vacuum {
            lowest_active,
            reply,
        } => {
            for context in state.collections.values_mut() {
                context.table.vacuum(lowest_active);
            }
            reply.fulfill(());
        }
        StorageRequest::Checkpoint {
            root,
            safe_ts,
            max_wal_id,
            reply,
        } => {
            let mut written = Vec::new();
            let mut failure = None;
            for (name, context) in &state.collections {
                if context.storage != StorageKind::Disk {
                    continue;
                }
                let dir = root.join(&name.database).join(&name.collection);
                match CheckpointWriter::write(&dir, &context.table, safe_ts, max_wal_id) {
                    Ok(()) => written.push(name.clone()),
                    Err(e) => {
                        warn!(collection = %name, error = %e, "checkpoint failed");
                        failure = Some(e);
                        break;
                    }
                }
            }
            reply.fulfill(match failure {
                Some(e) => Err(e),
                None => Ok(written),
            });
        }
    }
}

/// Handle to the storage service thread.
pub struct MemoryStorage {
    mailbox: Mailbox<StorageRequest>,
    thread: Option<JoinHandle<()>>,
}

impl MemoryStorage {
    /// Start the service thread with no collections.
    pub fn start() -> Self {
        let mailbox: Mailbox<StorageRequest> = Mailbox::new();
        let thread = {
            let mailbox = mailbox.clone();
            std::thread::Builder::new()
                .name("memory-storage".to_string())
                .spawn(move || {
                    let mut state = StorageState::default();
                    while let Some(request) = mailbox.recv() {
                        handle(&mut state, request);
                    }
                })
                .expect("spawn memory-storage thread")
        };
        info!("memory storage started");
        MemoryStorage {
            mailbox,
            thread: Some(thread),
        }
    }

    fn call<T>(&self, build: impl FnOnce(Promise<T>) -> StorageRequest) -> Result<T> {
        let (reply, future) = promise();
        if !self.mailbox.push(build(reply)) {
            return Err(Error::Internal("memory storage shut down".to_string()));
        }
        future
            .wait()
            .ok_or_else(|| Error::Internal("memory storage died mid-request".to_string()))
    }

    /// Create an empty collection.
    pub fn create_collection(
        &self,
        name: CollectionName,
        schema: Schema,
        storage: StorageKind,
    ) -> Result<()> {
        self.call(|reply| StorageRequest::CreateCollection {
            name,
            schema,
            storage,
            reply,
        })?
    }

    /// Drop a collection.
    pub fn drop_collection(&self, name: CollectionName) -> Result<()> {
        self.call(|reply| StorageRequest::DropCollection { name, reply })?
    }

    /// Install a pre-built table, replacing any existing one. Used when
    /// loading checkpoints.
    pub fn install_table(
        &self,
        name: CollectionName,
        table: TableStore,
        storage: StorageKind,
    ) -> Result<()> {
        self.call(|reply| StorageRequest::InstallTable {
            name,
            table: Box::new(table),
            storage,
            reply,
        })
    }

    /// Create and backfill an index.
    pub fn create_index(
        &self,
        name: CollectionName,
        index_name: String,
        column: String,
        unique: bool,
    ) -> Result<()> {
        self.call(|reply| StorageRequest::CreateIndex {
            name,
            index_name,
            column,
            unique,
            reply,
        })?
    }

    /// Drop an index. Returns whether it existed.
    pub fn drop_index(&self, name: CollectionName, index_name: String) -> Result<bool> {
        self.call(|reply| StorageRequest::DropIndex {
            name,
            index_name,
            reply,
        })?
    }

    /// The global row id the next append to this collection will assign.
    pub fn next_row_id(&self, name: CollectionName) -> Result<i64> {
        self.call(|reply| StorageRequest::NextRowId { name, reply })?
    }

    /// Append rows stamped with `id`.
    pub fn append(&self, name: CollectionName, chunk: DataChunk, id: u64) -> Result<Vec<i64>> {
        self.call(|reply| StorageRequest::Append {
            name,
            chunk,
            id,
            reply,
        })?
    }

    /// Stamp rows deleted by `id`.
    pub fn delete(&self, name: CollectionName, row_ids: Vec<i64>, id: u64) -> Result<usize> {
        self.call(|reply| StorageRequest::Delete {
            name,
            row_ids,
            id,
            reply,
        })?
    }

    /// Replace rows inside one transaction.
    pub fn update(
        &self,
        name: CollectionName,
        row_ids: Vec<i64>,
        new_rows: DataChunk,
        id: u64,
    ) -> Result<Vec<i64>> {
        self.call(|reply| StorageRequest::Update {
            name,
            row_ids,
            new_rows,
            id,
            reply,
        })?
    }

    /// Promote a transaction's stamps in the collections it touched.
    pub fn commit(
        &self,
        collections: Vec<CollectionName>,
        txn_id: u64,
        commit_id: u64,
    ) -> Result<()> {
        self.call(|reply| StorageRequest::Commit {
            collections,
            txn_id,
            commit_id,
            reply,
        })
    }

    /// Roll a transaction back in the collections it touched.
    pub fn abort(&self, collections: Vec<CollectionName>, txn_id: u64) -> Result<()> {
        self.call(|reply| StorageRequest::Abort {
            collections,
            txn_id,
            reply,
        })
    }

    /// Run a read pipeline under a snapshot.
    pub fn select(&self, plan: SelectPlan, start_ts: u64, txn_id: u64) -> Result<QueryOutput> {
        self.call(|reply| StorageRequest::Select {
            plan: Box::new(plan),
            start_ts,
            txn_id,
            reply,
        })?
    }

    /// Visible rows matching a predicate, with their row ids. Feeds
    /// delete and update.
    pub fn collect_rows(
        &self,
        name: CollectionName,
        predicate: Option<Predicate>,
        limit: Option<usize>,
        start_ts: u64,
        txn_id: u64,
    ) -> Result<Vec<(i64, Vec<Value>)>> {
        self.call(|reply| StorageRequest::CollectRows {
            name,
            predicate,
            limit,
            start_ts,
            txn_id,
            reply,
        })?
    }

    /// Physically compact every collection.
    pub fn vacuum(&self, lowest_active: u64) -> Result<()> {
        self.call(|reply| StorageRequest::Vacuum {
            lowest_active,
            reply,
        })
    }

    /// Write checkpoint files for every disk-backed collection. Returns
    /// the collections written.
    pub fn checkpoint(
        &self,
        root: PathBuf,
        safe_ts: u64,
        max_wal_id: u64,
    ) -> Result<Vec<CollectionName>> {
        self.call(|reply| StorageRequest::Checkpoint {
            root,
            safe_ts,
            max_wal_id,
            reply,
        })?
    }

    /// Stop the service thread, draining queued requests first.
    pub fn shutdown(&mut self) {
        self.mailbox.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}
