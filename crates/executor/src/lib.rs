//! Plan and execution layer for the Otterbrix kernel
//!
//! The logical plan is the typed tree the dispatcher receives from the
//! upstream binder; the physical layer lowers a read pipeline onto the
//! table store (index scan or pruned table scan, then filter, join,
//! group, sort, limit) and materializes cursors. The UDF registry holds
//! user-supplied row and aggregate kernels.

#![warn(clippy::all)]

pub mod cursor;
pub mod expr;
pub mod physical;
pub mod plan;
pub mod udf;

pub use cursor::Cursor;
pub use expr::{ArithOp, Predicate, RowContext, ScalarExpr};
pub use physical::{execute_select, QueryOutput, TableProvider};
pub use plan::{
    AggregateFunc, InsertSource, JoinKind, JoinSpec, LogicalPlan, PlanParameters, ProjectionItem,
    SelectPlan, SortOrder,
};
pub use udf::{AggregateUdf, UdfRegistry};
