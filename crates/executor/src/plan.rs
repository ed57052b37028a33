//! The logical plan tree.
//!
//! Plans arrive from the upstream binder already typed and bound. DDL
//! nodes are serialized into WAL DATA records verbatim, so every variant
//! here is a stable serde shape.

use crate::expr::{Predicate, ScalarExpr};
use otterbrix_core::{CollectionName, Result, Schema, StorageKind, Value};
use serde::{Deserialize, Serialize};

/// Bound parameter values accompanying a plan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanParameters {
    /// Positional parameter values
    pub values: Vec<Value>,
}

impl PlanParameters {
    /// No parameters.
    pub fn none() -> Self {
        PlanParameters::default()
    }

    /// Serialize for a WAL DATA record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from a WAL DATA record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Where inserted rows come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InsertSource {
    /// Literal bound rows
    Rows(Vec<Vec<Value>>),
    /// Rows produced by a child read plan
    Query(Box<SelectPlan>),
}

/// Join kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// Matching pairs only
    Inner,
    /// All left rows, NULL-padded right
    Left,
    /// All right rows, NULL-padded left
    Right,
    /// Union of left and right behavior
    Full,
    /// Cartesian product
    Cross,
}

/// One join against a second collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Join kind
    pub kind: JoinKind,
    /// Right-side collection
    pub right: CollectionName,
    /// Join condition; absent for cross joins
    pub on: Option<Predicate>,
}

/// Aggregate functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateFunc {
    /// Row count; counts non-NULL when an argument is present
    Count,
    /// Sum of a numeric argument
    Sum,
    /// Minimum
    Min,
    /// Maximum
    Max,
    /// Arithmetic mean
    Avg,
    /// User-registered aggregate kernel
    Udf(String),
}

/// One output column of a read pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProjectionItem {
    /// Every column of the scan output
    AllColumns,
    /// A scalar expression
    Expr {
        /// Expression
        expr: ScalarExpr,
        /// Output name; defaults to a rendered form of the expression
        alias: Option<String>,
    },
    /// An aggregate over the group
    Aggregate {
        /// Aggregate function
        func: AggregateFunc,
        /// Argument; absent means `COUNT(*)`
        arg: Option<ScalarExpr>,
        /// DISTINCT modifier
        distinct: bool,
        /// Output name
        alias: Option<String>,
    },
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending, NULL first
    Asc,
    /// Descending, NULL last
    Desc,
}

/// A read pipeline rooted at one collection: scan or index scan, then
/// join, filter, group, sort and limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectPlan {
    /// Base collection
    pub collection: CollectionName,
    /// Output columns in order
    pub projection: Vec<ProjectionItem>,
    /// WHERE predicate
    pub predicate: Option<Predicate>,
    /// Optional join
    pub join: Option<JoinSpec>,
    /// GROUP BY column names
    pub group_by: Vec<String>,
    /// HAVING predicate, evaluated over the aggregate output
    pub having: Option<Predicate>,
    /// ORDER BY keys
    pub order_by: Vec<(ScalarExpr, SortOrder)>,
    /// LIMIT
    pub limit: Option<usize>,
}

impl SelectPlan {
    /// Bare `SELECT * FROM collection`.
    pub fn scan(collection: CollectionName) -> Self {
        SelectPlan {
            collection,
            projection: vec![ProjectionItem::AllColumns],
            predicate: None,
            join: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Attach a WHERE predicate.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Attach an ORDER BY key.
    pub fn order_by(mut self, expr: ScalarExpr, order: SortOrder) -> Self {
        self.order_by.push((expr, order));
        self
    }

    /// Attach a LIMIT.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The logical plan the dispatcher executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    /// Create a database
    CreateDatabase {
        /// Database name
        database: String,
    },
    /// Drop a database and every collection in it
    DropDatabase {
        /// Database name
        database: String,
    },
    /// Create a collection
    CreateCollection {
        /// Qualified name
        collection: CollectionName,
        /// Column schema
        schema: Schema,
        /// Memory-resident or disk-backed
        storage: StorageKind,
    },
    /// Drop a collection
    DropCollection {
        /// Qualified name
        collection: CollectionName,
    },
    /// Create a single-field index
    CreateIndex {
        /// Parent collection
        collection: CollectionName,
        /// Index name
        name: String,
        /// Key column path
        column: String,
        /// Unique flag
        unique: bool,
    },
    /// Drop an index
    DropIndex {
        /// Parent collection
        collection: CollectionName,
        /// Index name
        name: String,
    },
    /// Insert rows
    Insert {
        /// Target collection
        collection: CollectionName,
        /// Column names the source rows provide, in source order;
        /// empty means full schema order
        columns: Vec<String>,
        /// Row source
        source: InsertSource,
    },
    /// Delete rows matching a predicate
    Delete {
        /// Target collection
        collection: CollectionName,
        /// WHERE predicate; absent deletes everything
        predicate: Option<Predicate>,
        /// LIMIT
        limit: Option<usize>,
    },
    /// Update rows matching a predicate
    Update {
        /// Target collection
        collection: CollectionName,
        /// SET assignments
        set: Vec<(String, ScalarExpr)>,
        /// WHERE predicate; absent updates everything
        predicate: Option<Predicate>,
        /// LIMIT
        limit: Option<usize>,
    },
    /// Read pipeline
    Select(SelectPlan),
    /// Flush committed state of disk-backed collections and prune the WAL
    Checkpoint,
    /// Physically compact collections and their indexes
    Vacuum,
}

impl LogicalPlan {
    /// The collection this plan primarily targets, when there is one.
    pub fn collection(&self) -> Option<&CollectionName> {
        match self {
            LogicalPlan::CreateCollection { collection, .. }
            | LogicalPlan::DropCollection { collection }
            | LogicalPlan::CreateIndex { collection, .. }
            | LogicalPlan::DropIndex { collection, .. }
            | LogicalPlan::Insert { collection, .. }
            | LogicalPlan::Delete { collection, .. }
            | LogicalPlan::Update { collection, .. } => Some(collection),
            LogicalPlan::Select(select) => Some(&select.collection),
            _ => None,
        }
    }

    /// Whether this is a catalog mutation, written to the WAL as a
    /// transaction-less DATA record and applied immediately on replay.
    pub fn is_catalog(&self) -> bool {
        matches!(
            self,
            LogicalPlan::CreateDatabase { .. }
                | LogicalPlan::DropDatabase { .. }
                | LogicalPlan::CreateCollection { .. }
                | LogicalPlan::DropCollection { .. }
                | LogicalPlan::CreateIndex { .. }
                | LogicalPlan::DropIndex { .. }
        )
    }

    /// Whether this plan only reads.
    pub fn is_read_only(&self) -> bool {
        matches!(self, LogicalPlan::Select(_))
    }

    /// Serialize for a WAL DATA record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize from a WAL DATA record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otterbrix_core::{ColumnDefinition, CompareOp, LogicalType};

    #[test]
    fn plan_bytes_roundtrip() {
        let plan = LogicalPlan::CreateCollection {
            collection: CollectionName::new("db", "t"),
            schema: Schema::new(vec![
                ColumnDefinition::new("a", LogicalType::BigInt).not_null(),
                ColumnDefinition::new("b", LogicalType::String)
                    .with_default(Value::String("pending".to_string())),
            ]),
            storage: StorageKind::Disk,
        };
        let bytes = plan.to_bytes().unwrap();
        assert_eq!(LogicalPlan::from_bytes(&bytes).unwrap(), plan);
    }

    #[test]
    fn select_builder_roundtrip() {
        let plan = LogicalPlan::Select(
            SelectPlan::scan(CollectionName::new("db", "t"))
                .with_predicate(Predicate::compare("a", CompareOp::Gt, Value::Int64(1)))
                .order_by(ScalarExpr::column("a"), SortOrder::Asc)
                .with_limit(10),
        );
        let bytes = plan.to_bytes().unwrap();
        let back = LogicalPlan::from_bytes(&bytes).unwrap();
        assert_eq!(back, plan);
        assert!(back.is_read_only());
        assert!(!back.is_catalog());
    }

    #[test]
    fn catalog_classification() {
        assert!(LogicalPlan::CreateDatabase {
            database: "db".to_string()
        }
        .is_catalog());
        assert!(!LogicalPlan::Checkpoint.is_catalog());
        assert!(!LogicalPlan::Vacuum.is_read_only());
    }

    #[test]
    fn target_collection() {
        let plan = LogicalPlan::Delete {
            collection: CollectionName::new("db", "t"),
            predicate: None,
            limit: None,
        };
        assert_eq!(plan.collection(), Some(&CollectionName::new("db", "t")));
        assert_eq!(LogicalPlan::Checkpoint.collection(), None);
    }

    #[test]
    fn parameters_roundtrip() {
        let params = PlanParameters {
            values: vec![Value::Int64(1), Value::String("x".to_string()), Value::Null],
        };
        let bytes = params.to_bytes().unwrap();
        assert_eq!(PlanParameters::from_bytes(&bytes).unwrap(), params);
    }
}
