//! # Otterbrix
//!
//! An embeddable transactional columnar database kernel: MVCC table
//! storage, secondary indexes with transaction side-buffers, a
//! partitioned write-ahead log with crash recovery, and a dispatcher
//! that executes logical plans over concurrent sessions.
//!
//! # Quick Start
//!
//! ```no_run
//! use otterbrix::{
//!     ColumnDefinition, EngineConfig, InsertSource, LogicalPlan, LogicalType, Otterbrix,
//!     CollectionName, Schema, SelectPlan, StorageKind, Value,
//! };
//!
//! fn main() -> otterbrix::Result<()> {
//!     let db = Otterbrix::open(EngineConfig::new("./data"))?;
//!     let session = db.new_session();
//!
//!     db.execute(session, LogicalPlan::CreateDatabase { database: "db".into() });
//!     db.execute(session, LogicalPlan::CreateCollection {
//!         collection: CollectionName::new("db", "t"),
//!         schema: Schema::new(vec![
//!             ColumnDefinition::new("a", LogicalType::BigInt),
//!             ColumnDefinition::new("b", LogicalType::String),
//!         ]),
//!         storage: StorageKind::Disk,
//!     });
//!     db.execute(session, LogicalPlan::Insert {
//!         collection: CollectionName::new("db", "t"),
//!         columns: vec![],
//!         source: InsertSource::Rows(vec![
//!             vec![Value::Int64(1), Value::String("x".into())],
//!         ]),
//!     });
//!
//!     let cursor = db.execute(
//!         session,
//!         LogicalPlan::Select(SelectPlan::scan(CollectionName::new("db", "t"))),
//!     );
//!     assert_eq!(cursor.len(), 1);
//!     db.close()
//! }
//! ```

#![warn(clippy::all)]

pub use otterbrix_core::{
    CollectionName, ColumnDefinition, CompareOp, DataChunk, Error, ErrorCode, LogicalType, Result,
    Schema, StorageKind, Value,
};

pub use otterbrix_concurrency::{Snapshot, Transaction, TransactionManager};
pub use otterbrix_durability::{FsyncPolicy, WalConfig};
pub use otterbrix_engine::{Catalog, Dispatcher, EngineConfig, Otterbrix, SessionId};
pub use otterbrix_executor::{
    AggregateFunc, AggregateUdf, ArithOp, Cursor, InsertSource, JoinKind, JoinSpec, LogicalPlan,
    PlanParameters, Predicate, ProjectionItem, ScalarExpr, SelectPlan, SortOrder, UdfRegistry,
};
pub use otterbrix_executor::udf;
pub use otterbrix_index::{IndexEngine, SingleFieldIndex};
pub use otterbrix_storage::{RowGroup, TableStore};
