//! The database facade: open, recover, serve, close.

use crate::catalog::{Catalog, IndexDef};
use crate::config::EngineConfig;
use crate::dispatcher::{Dispatcher, SessionId};
use crate::memory_storage::MemoryStorage;
use otterbrix_concurrency::TransactionManager;
use otterbrix_core::{CollectionName, DataChunk, Error, Result, StorageKind, NOT_DELETED, TXN_BASE};
use otterbrix_durability::{recover, RecordBody, ReplayAction, WalPool};
use otterbrix_executor::{Cursor, LogicalPlan, PlanParameters};
use otterbrix_storage::CheckpointReader;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// An embedded Otterbrix instance.
///
/// Opening loads every disk-backed collection's checkpoint, replays the
/// WAL on top of it (committed transactions only, in global wal-id
/// order) and starts the services. All sessions go through
/// [`Otterbrix::execute`].
pub struct Otterbrix {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    storage: Arc<MemoryStorage>,
    wal: Arc<WalPool>,
    txns: Arc<TransactionManager>,
    dispatcher: Dispatcher,
    next_session: AtomicU64,
}

impl Otterbrix {
    /// Open or create a database rooted at `config.root`.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(config.root())?;
        let catalog = Arc::new(Catalog::new());
        let storage = Arc::new(MemoryStorage::start());

        // Step 1: checkpoint images. Each brings its schema, its rows and
        // its index definitions; the footer's watermark gates replay.
        let mut watermarks: FxHashMap<CollectionName, u64> = FxHashMap::default();
        let mut max_stamp = 0u64;
        for (name, dir) in discover_collection_dirs(&config)? {
            match CheckpointReader::load(&dir, name.clone()) {
                Ok(Some((table, footer))) => {
                    if !catalog.has_database(&name.database) {
                        catalog.create_database(&name.database)?;
                    }
                    catalog.create_collection(&name, footer.schema.clone(), StorageKind::Disk)?;
                    for index in table.indexes().indexes() {
                        catalog.add_index(
                            &name,
                            IndexDef {
                                name: index.name().to_string(),
                                column: index.column().to_string(),
                                unique: index.is_unique(),
                            },
                        )?;
                    }
                    max_stamp = max_stamp.max(max_commit_stamp(&table));
                    watermarks.insert(name.clone(), footer.max_wal_id);
                    storage.install_table(name, table, StorageKind::Disk)?;
                }
                Ok(None) => {}
                Err(e) => {
                    // The collection starts empty; WAL replay fills in
                    // whatever the log still covers.
                    warn!(collection = %name, error = %e, "checkpoint unreadable, starting empty");
                }
            }
        }

        // Step 2: drain and order the log before the writers reopen it.
        let first_commit_id = max_stamp + 1;
        let recovery = recover(&config.wal_dir(), config.wal.workers, first_commit_id)?;

        let txns = Arc::new(TransactionManager::with_counters(
            recovery.next_commit_id,
            TXN_BASE,
        ));
        let wal = Arc::new(WalPool::open(&config.wal_dir(), config.wal.clone())?);
        let dispatcher = Dispatcher::new(
            config.root.clone(),
            Arc::clone(&catalog),
            Arc::clone(&storage),
            Arc::clone(&wal),
            Arc::clone(&txns),
        );

        // Step 3: replay. Catalog records land the moment they are seen,
        // committed transactions at their marker's position, so DDL is
        // always applied before the DML it enables.
        let action_count = recovery.actions.len();
        for action in recovery.actions {
            match action {
                ReplayAction::Catalog { node, .. } => match LogicalPlan::from_bytes(&node) {
                    Ok(plan) => {
                        if let Err(e) = dispatcher.apply_ddl(&plan, true) {
                            warn!(error = %e, "catalog replay failed, skipping record");
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable catalog record, skipping"),
                },
                ReplayAction::Transaction {
                    commit_id,
                    operations,
                    ..
                } => {
                    for op in operations {
                        replay_operation(&storage, &watermarks, op.wal_id, op.body, commit_id);
                    }
                }
            }
        }
        info!(
            actions = action_count,
            discarded = recovery.discarded_txns,
            "recovery complete"
        );

        Ok(Otterbrix {
            config,
            catalog,
            storage,
            wal,
            txns,
            dispatcher,
            next_session: AtomicU64::new(1),
        })
    }

    /// Allocate a session id.
    pub fn new_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Execute a plan for a session.
    pub fn execute(&self, session: SessionId, plan: LogicalPlan) -> Cursor {
        self.dispatcher.execute(session, plan, PlanParameters::none())
    }

    /// Execute a plan with bound parameters.
    pub fn execute_with_params(
        &self,
        session: SessionId,
        plan: LogicalPlan,
        params: PlanParameters,
    ) -> Cursor {
        self.dispatcher.execute(session, plan, params)
    }

    /// Open a session-bound transaction.
    pub fn begin_transaction(&self, session: SessionId) -> Result<()> {
        self.dispatcher.begin_transaction(session)
    }

    /// Commit a session-bound transaction, returning its commit id.
    pub fn commit_transaction(&self, session: SessionId) -> Result<u64> {
        self.dispatcher.commit_transaction(session)
    }

    /// Abort a session-bound transaction.
    pub fn abort_transaction(&self, session: SessionId) -> Result<()> {
        self.dispatcher.abort_transaction(session)
    }

    /// Drop a session's in-flight state.
    pub fn close_session(&self, session: SessionId) {
        self.dispatcher.close_session(session)
    }

    /// Flush committed state of disk-backed collections and prune the
    /// WAL where safe.
    pub fn checkpoint(&self) -> Cursor {
        self.execute(0, LogicalPlan::Checkpoint)
    }

    /// The catalog, for inspection.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush the WAL and stop the services. Dropping the instance does
    /// the same; this makes the flush error observable.
    pub fn close(self) -> Result<()> {
        self.wal.flush_all()?;
        Ok(())
    }
}

/// `<root>/<database>/<collection>` directories, skipping the WAL.
fn discover_collection_dirs(
    config: &EngineConfig,
) -> Result<Vec<(CollectionName, std::path::PathBuf)>> {
    let mut out = Vec::new();
    if !config.root().exists() {
        return Ok(out);
    }
    for db_entry in std::fs::read_dir(config.root())? {
        let db_entry = db_entry?;
        if !db_entry.file_type()?.is_dir() {
            continue;
        }
        let database = db_entry.file_name().to_string_lossy().to_string();
        if database == "wal" {
            continue;
        }
        for coll_entry in std::fs::read_dir(db_entry.path())? {
            let coll_entry = coll_entry?;
            if !coll_entry.file_type()?.is_dir() {
                continue;
            }
            let collection = coll_entry.file_name().to_string_lossy().to_string();
            out.push((CollectionName::new(&database, collection), coll_entry.path()));
        }
    }
    out.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(out)
}

/// Highest commit stamp inside a loaded table, so restored counters never
/// collide with replayed ids.
fn max_commit_stamp(table: &otterbrix_storage::TableStore) -> u64 {
    let mut max = 0;
    for group in table.row_groups() {
        let versions = group.versions();
        for slot in 0..group.cardinality() {
            let insert = versions.insert_id(slot);
            if insert < TXN_BASE {
                max = max.max(insert);
            }
            let delete = versions.delete_id(slot);
            if delete != NOT_DELETED && delete < TXN_BASE {
                max = max.max(delete);
            }
        }
    }
    max
}

/// Apply one physical record with its re-sequenced commit id, honoring
/// the per-collection checkpoint watermark.
fn replay_operation(
    storage: &MemoryStorage,
    watermarks: &FxHashMap<CollectionName, u64>,
    wal_id: u64,
    body: RecordBody,
    commit_id: u64,
) {
    let covered = |name: &CollectionName| watermarks.get(name).map_or(false, |w| wal_id <= *w);
    let outcome: Result<()> = match body {
        RecordBody::PhysicalInsert {
            collection, chunk, ..
        } => {
            if covered(&collection) {
                return;
            }
            rmp_serde::from_slice::<DataChunk>(&chunk)
                .map_err(Error::from)
                .and_then(|chunk| storage.append(collection, chunk, commit_id).map(|_| ()))
        }
        RecordBody::PhysicalDelete {
            collection, row_ids, ..
        } => {
            if covered(&collection) {
                return;
            }
            storage.delete(collection, row_ids, commit_id).map(|_| ())
        }
        RecordBody::PhysicalUpdate {
            collection,
            row_ids,
            new_chunk,
            ..
        } => {
            if covered(&collection) {
                return;
            }
            rmp_serde::from_slice::<DataChunk>(&new_chunk)
                .map_err(Error::from)
                .and_then(|chunk| {
                    storage
                        .update(collection, row_ids, chunk, commit_id)
                        .map(|_| ())
                })
        }
        RecordBody::Data { .. } | RecordBody::Commit => {
            // Transactional DATA records are not produced by this
            // dispatcher; commit markers never reach here.
            warn!(wal_id, "unexpected record shape inside transaction, skipping");
            Ok(())
        }
    };
    if let Err(e) = outcome {
        warn!(wal_id, commit_id, error = %e, "replay operation failed, skipping");
    }
}
