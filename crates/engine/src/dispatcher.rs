//! The execution dispatcher.
//!
//! Routes a compiled logical plan to the WAL, the memory storage and the
//! catalog, enforcing the ordering contract:
//!
//! 1. Validate against the catalog.
//! 2. Join the session's transaction, or begin a statement-scoped one.
//! 3. Write the WAL record and wait for the partition's acknowledgment.
//! 4. Apply to storage and indexes under the transaction id.
//! 5. Allocate the commit id, write the COMMIT marker (ordered after all
//!    of the transaction's data records), then promote stamps in storage.
//!
//! A failure past step 3 aborts the transaction in storage; the WAL
//! records stay behind but recovery ignores them because no commit
//! marker exists.

use crate::catalog::{Catalog, IndexDef};
use crate::memory_storage::MemoryStorage;
use otterbrix_concurrency::{Snapshot, Transaction, TransactionManager};
use otterbrix_core::{CollectionName, DataChunk, Error, Result, Value};
use otterbrix_durability::{RecordBody, WalPool};
use otterbrix_executor::{
    Cursor, InsertSource, LogicalPlan, PlanParameters, RowContext, SelectPlan,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identifier of a client session.
pub type SessionId = u64;

#[derive(Debug, Default, Clone)]
struct TxnFootprint {
    touched: Vec<CollectionName>,
    partitions: FxHashSet<usize>,
}

impl TxnFootprint {
    fn touch(&mut self, name: &CollectionName, partition: usize) {
        if !self.touched.contains(name) {
            self.touched.push(name.clone());
        }
        self.partitions.insert(partition);
    }
}

#[derive(Debug)]
struct SessionTxn {
    txn: Transaction,
    footprint: TxnFootprint,
}

/// The dispatcher actor. One instance serves every session; per-statement
/// state lives on the stack of [`Dispatcher::execute`], session-bound
/// transactions in the session map.
pub struct Dispatcher {
    root: PathBuf,
    catalog: Arc<Catalog>,
    storage: Arc<MemoryStorage>,
    wal: Arc<WalPool>,
    txns: Arc<TransactionManager>,
    sessions: Mutex<FxHashMap<SessionId, SessionTxn>>,
}

impl Dispatcher {
    /// Wire a dispatcher over the shared services.
    pub fn new(
        root: PathBuf,
        catalog: Arc<Catalog>,
        storage: Arc<MemoryStorage>,
        wal: Arc<WalPool>,
        txns: Arc<TransactionManager>,
    ) -> Self {
        Dispatcher {
            root,
            catalog,
            storage,
            wal,
            txns,
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Execute a plan for a session. Failures come back as error cursors;
    /// the engine itself never goes down over a user error.
    pub fn execute(&self, session: SessionId, plan: LogicalPlan, params: PlanParameters) -> Cursor {
        match self.execute_inner(session, plan, params) {
            Ok(cursor) => cursor,
            Err(e) => {
                if !e.is_user_error() {
                    warn!(session, error = %e, "plan execution failed");
                }
                Cursor::from_error(&e)
            }
        }
    }

    /// Open a session-bound transaction.
    pub fn begin_transaction(&self, session: SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session) {
            return Err(Error::Invalid(format!(
                "session {} already has an open transaction",
                session
            )));
        }
        let txn = self.txns.begin();
        sessions.insert(
            session,
            SessionTxn {
                txn,
                footprint: TxnFootprint::default(),
            },
        );
        Ok(())
    }

    /// Commit a session-bound transaction.
    pub fn commit_transaction(&self, session: SessionId) -> Result<u64> {
        let state = self
            .sessions
            .lock()
            .remove(&session)
            .ok_or_else(|| Error::Invalid(format!("session {} has no transaction", session)))?;
        self.commit_txn(state.txn, state.footprint)
    }

    /// Abort a session-bound transaction.
    pub fn abort_transaction(&self, session: SessionId) -> Result<()> {
        let state = self
            .sessions
            .lock()
            .remove(&session)
            .ok_or_else(|| Error::Invalid(format!("session {} has no transaction", session)))?;
        self.abort_txn(state.txn, &state.footprint);
        Ok(())
    }

    /// Drop a session's in-flight state. Closing the session is the
    /// coarse cancellation path; acknowledged WAL writes stay behind and
    /// recovery discards them without a commit marker.
    pub fn close_session(&self, session: SessionId) {
        if let Some(state) = self.sessions.lock().remove(&session) {
            self.abort_txn(state.txn, &state.footprint);
        }
    }

    fn execute_inner(
        &self,
        session: SessionId,
        plan: LogicalPlan,
        _params: PlanParameters,
    ) -> Result<Cursor> {
        match plan {
            LogicalPlan::Select(select) => self.run_select(session, select),
            LogicalPlan::Insert {
                collection,
                columns,
                source,
            } => self.run_insert(session, collection, columns, source),
            LogicalPlan::Delete {
                collection,
                predicate,
                limit,
            } => self.run_delete(session, collection, predicate, limit),
            LogicalPlan::Update {
                collection,
                set,
                predicate,
                limit,
            } => self.run_update(session, collection, set, predicate, limit),
            LogicalPlan::Checkpoint => self.run_checkpoint(),
            LogicalPlan::Vacuum => {
                self.storage.vacuum(self.txns.lowest_active_start_ts())?;
                Ok(Cursor::ok(0))
            }
            ddl => self.run_ddl(ddl),
        }
    }

    // ---------------------------------------------------------------
    // DDL
    // ---------------------------------------------------------------

    fn run_ddl(&self, plan: LogicalPlan) -> Result<Cursor> {
        self.validate_ddl(&plan)?;
        // Catalog mutations are transaction-less DATA records, applied
        // immediately on replay.
        let node = plan.to_bytes()?;
        let params = PlanParameters::none().to_bytes()?;
        self.wal
            .append(plan.collection(), 0, RecordBody::Data { node, params })?;
        self.apply_ddl(&plan, false)?;
        Ok(Cursor::ok(0))
    }

    fn validate_ddl(&self, plan: &LogicalPlan) -> Result<()> {
        match plan {
            LogicalPlan::CreateDatabase { database } => {
                if self.catalog.has_database(database) {
                    return Err(Error::DatabaseAlreadyExists {
                        name: database.clone(),
                    });
                }
            }
            LogicalPlan::DropDatabase { database } => {
                if !self.catalog.has_database(database) {
                    return Err(Error::DatabaseNotExists {
                        name: database.clone(),
                    });
                }
            }
            LogicalPlan::CreateCollection { collection, .. } => {
                if !self.catalog.has_database(&collection.database) {
                    return Err(Error::DatabaseNotExists {
                        name: collection.database.clone(),
                    });
                }
                if self.catalog.has_collection(collection) {
                    return Err(Error::CollectionAlreadyExists {
                        name: collection.to_string(),
                    });
                }
            }
            LogicalPlan::DropCollection { collection } => {
                self.catalog.collection(collection)?;
            }
            LogicalPlan::CreateIndex {
                collection, column, ..
            } => {
                let entry = self.catalog.collection(collection)?;
                if entry.schema.position(column).is_none() {
                    return Err(Error::IndexCreate {
                        what: format!("unknown column {} in {}", column, collection),
                    });
                }
            }
            LogicalPlan::DropIndex { collection, .. } => {
                self.catalog.collection(collection)?;
            }
            other => {
                return Err(Error::Internal(format!(
                    "not a catalog plan: {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Apply a catalog plan to the catalog and the storage service.
    ///
    /// With `idempotent` set (WAL replay), already-applied records are
    /// skipped with a log line instead of failing: a record may race a
    /// checkpoint that already reflects it.
    pub fn apply_ddl(&self, plan: &LogicalPlan, idempotent: bool) -> Result<()> {
        let outcome = self.apply_ddl_inner(plan);
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if idempotent && e.is_user_error() => {
                debug!(error = %e, "catalog replay record already applied");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn apply_ddl_inner(&self, plan: &LogicalPlan) -> Result<()> {
        match plan {
            LogicalPlan::CreateDatabase { database } => self.catalog.create_database(database),
            LogicalPlan::DropDatabase { database } => {
                for name in self.catalog.drop_database(database)? {
                    let _ = self.storage.drop_collection(name);
                }
                Ok(())
            }
            LogicalPlan::CreateCollection {
                collection,
                schema,
                storage,
            } => {
                self.catalog
                    .create_collection(collection, schema.clone(), *storage)?;
                self.storage
                    .create_collection(collection.clone(), schema.clone(), *storage)
            }
            LogicalPlan::DropCollection { collection } => {
                self.catalog.drop_collection(collection)?;
                self.storage.drop_collection(collection.clone())
            }
            LogicalPlan::CreateIndex {
                collection,
                name,
                column,
                unique,
            } => {
                self.catalog.add_index(
                    collection,
                    IndexDef {
                        name: name.clone(),
                        column: column.clone(),
                        unique: *unique,
                    },
                )?;
                self.storage.create_index(
                    collection.clone(),
                    name.clone(),
                    column.clone(),
                    *unique,
                )
            }
            LogicalPlan::DropIndex { collection, name } => {
                self.catalog.remove_index(collection, name)?;
                self.storage.drop_index(collection.clone(), name.clone())?;
                Ok(())
            }
            other => Err(Error::Internal(format!("not a catalog plan: {:?}", other))),
        }
    }

    // ---------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------

    /// The transaction a statement runs under: the session's when one is
    /// open, a fresh statement-scoped one otherwise.
    fn statement_txn(&self, session: SessionId) -> (Transaction, bool) {
        if let Some(state) = self.sessions.lock().get(&session) {
            return (state.txn, false);
        }
        (self.txns.begin(), true)
    }

    fn note_footprint(
        &self,
        session: SessionId,
        statement_scoped: bool,
        footprint: &mut TxnFootprint,
        name: &CollectionName,
        partition: usize,
    ) {
        footprint.touch(name, partition);
        if !statement_scoped {
            if let Some(state) = self.sessions.lock().get_mut(&session) {
                state.footprint.touch(name, partition);
            }
        }
    }

    fn commit_txn(&self, txn: Transaction, footprint: TxnFootprint) -> Result<u64> {
        let commit_id = self.txns.commit(txn.txn_id)?;
        if footprint.partitions.len() > 1 {
            // The marker's partition fsyncs on commit; the others must be
            // durable before the marker exists anywhere.
            self.wal.flush_all()?;
        }
        let partition = footprint
            .partitions
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.wal.route(None));
        self.wal
            .append_to(partition, txn.txn_id, RecordBody::Commit)?;
        self.storage
            .commit(footprint.touched, txn.txn_id, commit_id)?;
        Ok(commit_id)
    }

    fn abort_txn(&self, txn: Transaction, footprint: &TxnFootprint) {
        let _ = self.storage.abort(footprint.touched.clone(), txn.txn_id);
        self.txns.abort(txn.txn_id);
    }

    /// Finish a statement: commit a statement-scoped transaction, leave a
    /// session-bound one open.
    fn finish_statement(
        &self,
        statement_scoped: bool,
        txn: Transaction,
        footprint: TxnFootprint,
    ) -> Result<()> {
        if statement_scoped {
            self.commit_txn(txn, footprint)?;
        }
        Ok(())
    }

    fn fail_statement(
        &self,
        session: SessionId,
        statement_scoped: bool,
        txn: Transaction,
        footprint: &TxnFootprint,
        error: Error,
    ) -> Error {
        if statement_scoped {
            self.abort_txn(txn, footprint);
        } else {
            // A write conflict aborts the whole session transaction.
            self.close_session(session);
        }
        error
    }

    // ---------------------------------------------------------------
    // DML
    // ---------------------------------------------------------------

    fn bind_insert_rows(
        &self,
        collection: &CollectionName,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<DataChunk> {
        let entry = self.catalog.collection(collection)?;
        let schema = &entry.schema;

        // Map provided columns onto schema positions once.
        let positions: Vec<usize> = if columns.is_empty() {
            (0..schema.len()).collect()
        } else {
            columns
                .iter()
                .map(|name| {
                    schema.position(name).ok_or_else(|| Error::Invalid(format!(
                        "unknown column {} in {}",
                        name, collection
                    )))
                })
                .collect::<Result<_>>()?
        };

        let mut bound = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != positions.len() {
                return Err(Error::Invalid(format!(
                    "insert row has {} values for {} columns",
                    row.len(),
                    positions.len()
                )));
            }
            let mut full: Vec<Option<Value>> = vec![None; schema.len()];
            for (value, position) in row.into_iter().zip(&positions) {
                full[*position] = Some(value);
            }
            let mut out = Vec::with_capacity(schema.len());
            for (definition, slot) in schema.columns().iter().zip(full) {
                // Missing values take the declared default at bind time.
                let value = match slot {
                    Some(value) => value,
                    None => definition.default.clone().unwrap_or(Value::Null),
                };
                let value = value.coerce(&definition.logical_type)?;
                if definition.not_null && value.is_null() {
                    return Err(Error::NotNullViolation {
                        column: definition.name.clone(),
                    });
                }
                out.push(value);
            }
            bound.push(out);
        }
        DataChunk::from_rows(schema.types(), &bound)
    }

    fn run_insert(
        &self,
        session: SessionId,
        collection: CollectionName,
        columns: Vec<String>,
        source: InsertSource,
    ) -> Result<Cursor> {
        let rows = match source {
            InsertSource::Rows(rows) => rows,
            InsertSource::Query(select) => {
                let snapshot = self.read_snapshot(session);
                self.storage
                    .select(*select, snapshot.start_ts, snapshot.txn_id)?
                    .rows
            }
        };
        // Bind before the WAL write so user errors never reach the log.
        let chunk = self.bind_insert_rows(&collection, &columns, rows)?;
        if chunk.cardinality() == 0 {
            return Ok(Cursor::ok(0));
        }

        let (txn, statement_scoped) = self.statement_txn(session);
        let mut footprint = TxnFootprint::default();
        let partition = self.wal.route(Some(&collection));
        self.note_footprint(session, statement_scoped, &mut footprint, &collection, partition);

        let row_start = self.storage.next_row_id(collection.clone())? as u64;
        let row_count = chunk.cardinality() as u64;
        let encoded = rmp_serde::to_vec(&chunk).map_err(Error::from)?;
        self.wal.append_to(
            partition,
            txn.txn_id,
            RecordBody::PhysicalInsert {
                collection: collection.clone(),
                chunk: encoded,
                row_start,
                row_count,
            },
        )?;

        match self.storage.append(collection, chunk, txn.txn_id) {
            Ok(ids) => {
                self.finish_statement(statement_scoped, txn, footprint)?;
                Ok(Cursor::ok(ids.len()))
            }
            Err(e) => Err(self.fail_statement(session, statement_scoped, txn, &footprint, e)),
        }
    }

    fn run_delete(
        &self,
        session: SessionId,
        collection: CollectionName,
        predicate: Option<otterbrix_executor::Predicate>,
        limit: Option<usize>,
    ) -> Result<Cursor> {
        self.catalog.collection(&collection)?;
        let (txn, statement_scoped) = self.statement_txn(session);

        let victims = match self.storage.collect_rows(
            collection.clone(),
            predicate,
            limit,
            txn.start_ts,
            txn.txn_id,
        ) {
            Ok(rows) => rows,
            Err(e) => {
                if statement_scoped {
                    self.txns.abort(txn.txn_id);
                }
                return Err(e);
            }
        };
        if victims.is_empty() {
            if statement_scoped {
                self.txns.abort(txn.txn_id);
            }
            return Ok(Cursor::ok(0));
        }

        let mut footprint = TxnFootprint::default();
        let partition = self.wal.route(Some(&collection));
        self.note_footprint(session, statement_scoped, &mut footprint, &collection, partition);

        let row_ids: Vec<i64> = victims.iter().map(|(id, _)| *id).collect();
        self.wal.append_to(
            partition,
            txn.txn_id,
            RecordBody::PhysicalDelete {
                collection: collection.clone(),
                row_ids: row_ids.clone(),
                count: row_ids.len() as u64,
            },
        )?;

        match self.storage.delete(collection, row_ids, txn.txn_id) {
            Ok(count) => {
                self.finish_statement(statement_scoped, txn, footprint)?;
                Ok(Cursor::ok(count))
            }
            Err(e) => Err(self.fail_statement(session, statement_scoped, txn, &footprint, e)),
        }
    }

    fn run_update(
        &self,
        session: SessionId,
        collection: CollectionName,
        set: Vec<(String, otterbrix_executor::ScalarExpr)>,
        predicate: Option<otterbrix_executor::Predicate>,
        limit: Option<usize>,
    ) -> Result<Cursor> {
        let entry = self.catalog.collection(&collection)?;
        let schema = entry.schema;
        let columns: Vec<String> = schema.columns().iter().map(|c| c.name.clone()).collect();

        let (txn, statement_scoped) = self.statement_txn(session);
        let victims = match self.storage.collect_rows(
            collection.clone(),
            predicate,
            limit,
            txn.start_ts,
            txn.txn_id,
        ) {
            Ok(rows) => rows,
            Err(e) => {
                if statement_scoped {
                    self.txns.abort(txn.txn_id);
                }
                return Err(e);
            }
        };
        if victims.is_empty() {
            if statement_scoped {
                self.txns.abort(txn.txn_id);
            }
            return Ok(Cursor::ok(0));
        }

        // Updates are delete plus insert: build the replacement rows by
        // patching the old values through the SET expressions.
        let build = || -> Result<(Vec<i64>, DataChunk)> {
            let mut row_ids = Vec::with_capacity(victims.len());
            let mut new_rows = Vec::with_capacity(victims.len());
            for (row_id, values) in &victims {
                let context = RowContext::new(&columns, values);
                let mut replacement = values.clone();
                for (column, expr) in &set {
                    let position = schema.position(column).ok_or_else(|| {
                        Error::Invalid(format!("unknown column {} in {}", column, collection))
                    })?;
                    let value = expr
                        .evaluate(&context)?
                        .coerce(&schema.columns()[position].logical_type)?;
                    if schema.columns()[position].not_null && value.is_null() {
                        return Err(Error::NotNullViolation {
                            column: column.clone(),
                        });
                    }
                    replacement[position] = value;
                }
                row_ids.push(*row_id);
                new_rows.push(replacement);
            }
            Ok((row_ids, DataChunk::from_rows(schema.types(), &new_rows)?))
        };
        let (row_ids, new_chunk) = match build() {
            Ok(result) => result,
            Err(e) => {
                if statement_scoped {
                    self.txns.abort(txn.txn_id);
                }
                return Err(e);
            }
        };

        let mut footprint = TxnFootprint::default();
        let partition = self.wal.route(Some(&collection));
        self.note_footprint(session, statement_scoped, &mut footprint, &collection, partition);

        let encoded = rmp_serde::to_vec(&new_chunk).map_err(Error::from)?;
        self.wal.append_to(
            partition,
            txn.txn_id,
            RecordBody::PhysicalUpdate {
                collection: collection.clone(),
                row_ids: row_ids.clone(),
                new_chunk: encoded,
                count: row_ids.len() as u64,
            },
        )?;

        match self
            .storage
            .update(collection, row_ids, new_chunk, txn.txn_id)
        {
            Ok(ids) => {
                self.finish_statement(statement_scoped, txn, footprint)?;
                Ok(Cursor::ok(ids.len()))
            }
            Err(e) => Err(self.fail_statement(session, statement_scoped, txn, &footprint, e)),
        }
    }

    // ---------------------------------------------------------------
    // Reads, checkpoint
    // ---------------------------------------------------------------

    /// The snapshot a read runs under: the session transaction when one
    /// is open, otherwise a detached snapshot at the current commit
    /// counter (sees everything committed so far, holds nothing open).
    fn read_snapshot(&self, session: SessionId) -> Snapshot {
        if let Some(state) = self.sessions.lock().get(&session) {
            return Snapshot::of(&state.txn);
        }
        Snapshot {
            start_ts: self.txns.current_commit_id(),
            txn_id: 0,
        }
    }

    fn run_select(&self, session: SessionId, select: SelectPlan) -> Result<Cursor> {
        self.catalog.collection(&select.collection)?;
        if let Some(join) = &select.join {
            self.catalog.collection(&join.right)?;
        }
        let snapshot = self.read_snapshot(session);
        let output = self
            .storage
            .select(select, snapshot.start_ts, snapshot.txn_id)?;
        Ok(Cursor::with_rows(output.columns, output.rows, snapshot.start_ts))
    }

    fn run_checkpoint(&self) -> Result<Cursor> {
        // An open transaction may already have records below the
        // high-water mark that the image cannot reflect; the checkpoint
        // waits for a quiet moment instead of publishing a watermark
        // that would swallow them on replay.
        if self.txns.active_count() > 0 {
            return Err(Error::Invalid(
                "checkpoint deferred: transactions are active".to_string(),
            ));
        }
        // Everything acknowledged must be on disk before the image claims
        // to cover it.
        self.wal.flush_all()?;
        let high_water = self.wal.high_water_mark()?;
        let safe_ts = self.txns.lowest_active_start_ts();
        let written = self
            .storage
            .checkpoint(self.root.clone(), safe_ts, high_water)?;
        if written.is_empty() {
            return Ok(Cursor::ok(0));
        }
        // Memory-resident collections live entirely in the WAL; their
        // history must survive truncation. Segments are pruned only when
        // every collection is covered by a checkpoint image.
        let all_disk = self
            .catalog
            .all_collections()
            .iter()
            .all(|(_, entry)| entry.storage == otterbrix_core::StorageKind::Disk);
        if all_disk {
            let pruned = self.wal.truncate_up_to(high_water)?;
            debug!(pruned, high_water, "wal truncated after checkpoint");
        } else {
            debug!("skipping wal truncation, memory-resident collections present");
        }
        Ok(Cursor::ok(written.len()))
    }
}
