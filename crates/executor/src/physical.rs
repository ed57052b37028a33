//! Lowering read pipelines onto the table store.
//!
//! The pipeline is fixed: base access (index scan when the selection rule
//! finds one, pruned table scan otherwise), then join, filter, group or
//! project, sort, limit. The caller supplies the snapshot; everything
//! here is pure with respect to storage.

use crate::expr::{Predicate, RowContext, ScalarExpr};
use crate::plan::{AggregateFunc, JoinKind, ProjectionItem, SelectPlan, SortOrder};
use crate::udf;
use otterbrix_core::{CollectionName, Error, Result, Value};
use otterbrix_storage::TableStore;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::trace;

/// Read access to the collections a plan touches.
pub trait TableProvider {
    /// The table store behind a qualified name.
    fn table(&self, name: &CollectionName) -> Result<&TableStore>;
}

/// Materialized output of a read pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    /// Output column names in order
    pub columns: Vec<String>,
    /// Row-major values
    pub rows: Vec<Vec<Value>>,
}

/// Rows of the base collection, through an index when one applies.
fn base_rows(
    plan: &SelectPlan,
    table: &TableStore,
    start_ts: u64,
    txn_id: u64,
) -> Vec<Vec<Value>> {
    let candidates = plan
        .predicate
        .as_ref()
        .map(|p| p.index_candidates())
        .unwrap_or_default();

    if let Some(choice) = table.indexes().select(&candidates) {
        trace!(collection = %table.name(), index = choice.index, "index scan");
        let index = table
            .indexes()
            .index_at(choice.index)
            .expect("selected index exists");
        return index
            .search(choice.op, &choice.value, start_ts, txn_id)
            .into_iter()
            .filter_map(|row_id| table.point_lookup(row_id, start_ts, txn_id))
            .collect();
    }

    // No index: a pruned scan. The first orderable candidate becomes the
    // row-group skip hint.
    let hint = candidates.iter().find_map(|(column, op, value)| {
        let position = table.schema().position(column)?;
        let orderable = table.schema().columns()[position]
            .logical_type
            .is_orderable();
        orderable.then_some((position, *op, *value))
    });
    table
        .scan(start_ts, txn_id, hint)
        .map(|(_, values)| values)
        .collect()
}

fn join_rows(
    left_columns: &[String],
    left_rows: Vec<Vec<Value>>,
    right_columns: &[String],
    right_rows: Vec<Vec<Value>>,
    kind: JoinKind,
    on: Option<&Predicate>,
    all_columns: &[String],
) -> Result<Vec<Vec<Value>>> {
    let null_left = vec![Value::Null; left_columns.len()];
    let null_right = vec![Value::Null; right_columns.len()];
    let mut out = Vec::new();
    let mut right_matched = vec![false; right_rows.len()];

    for left in &left_rows {
        let mut matched = false;
        for (right_index, right) in right_rows.iter().enumerate() {
            let mut combined = left.clone();
            combined.extend(right.iter().cloned());
            let keep = match (kind, on) {
                (JoinKind::Cross, _) => true,
                (_, Some(predicate)) => {
                    predicate.matches(&RowContext::new(all_columns, &combined))?
                }
                (_, None) => true,
            };
            if keep {
                matched = true;
                right_matched[right_index] = true;
                out.push(combined);
            }
        }
        if !matched && matches!(kind, JoinKind::Left | JoinKind::Full) {
            let mut combined = left.clone();
            combined.extend(null_right.iter().cloned());
            out.push(combined);
        }
    }

    if matches!(kind, JoinKind::Right | JoinKind::Full) {
        for (right_index, right) in right_rows.iter().enumerate() {
            if !right_matched[right_index] {
                let mut combined = null_left.clone();
                combined.extend(right.iter().cloned());
                out.push(combined);
            }
        }
    }
    Ok(out)
}

fn projection_name(item: &ProjectionItem) -> String {
    match item {
        ProjectionItem::AllColumns => "*".to_string(),
        ProjectionItem::Expr { expr, alias } => alias.clone().unwrap_or_else(|| match expr {
            ScalarExpr::Column(name) => name.clone(),
            other => format!("{:?}", other).to_lowercase(),
        }),
        ProjectionItem::Aggregate { func, alias, .. } => {
            alias.clone().unwrap_or_else(|| match func {
                AggregateFunc::Count => "count".to_string(),
                AggregateFunc::Sum => "sum".to_string(),
                AggregateFunc::Min => "min".to_string(),
                AggregateFunc::Max => "max".to_string(),
                AggregateFunc::Avg => "avg".to_string(),
                AggregateFunc::Udf(name) => name.clone(),
            })
        }
    }
}

fn sort_rows(
    columns: &[String],
    rows: &mut [Vec<Value>],
    keys: &[(ScalarExpr, SortOrder)],
) -> Result<()> {
    // Precompute key tuples; evaluation errors surface before the sort.
    let mut decorated: Vec<(Vec<Value>, usize)> = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let context = RowContext::new(columns, row);
        let mut key = Vec::with_capacity(keys.len());
        for (expr, _) in keys {
            key.push(expr.evaluate(&context)?);
        }
        decorated.push((key, index));
    }
    decorated.sort_by(|(a, ai), (b, bi)| {
        for (position, (_, order)) in keys.iter().enumerate() {
            let ord = a[position].sort_cmp(&b[position]);
            let ord = match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        ai.cmp(bi)
    });
    let originals: Vec<Vec<Value>> = rows.to_vec();
    for (target, (_, source)) in decorated.into_iter().enumerate() {
        rows[target] = originals[source].clone();
    }
    Ok(())
}

/// Group key with a total order, so group output is deterministic.
#[derive(PartialEq)]
struct GroupKey(Vec<Value>);

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            let ord = a.sort_cmp(b);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

fn numeric_sum(values: &[Value]) -> Value {
    let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if non_null.is_empty() {
        return Value::Null;
    }
    if non_null.iter().all(|v| v.as_i64().is_some()) {
        Value::Int64(non_null.iter().filter_map(|v| v.as_i64()).sum())
    } else {
        Value::Double(non_null.iter().filter_map(|v| v.as_f64()).sum())
    }
}

fn aggregate_value(
    func: &AggregateFunc,
    arg: Option<&ScalarExpr>,
    distinct: bool,
    columns: &[String],
    rows: &[Vec<Value>],
) -> Result<Value> {
    // COUNT(*) short-circuits before argument evaluation.
    if matches!(func, AggregateFunc::Count) && arg.is_none() {
        return Ok(Value::Int64(rows.len() as i64));
    }
    let arg = arg.ok_or_else(|| Error::PhysicalPlan {
        what: "aggregate requires an argument".to_string(),
    })?;

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        values.push(arg.evaluate(&RowContext::new(columns, row))?);
    }
    if distinct {
        values.sort_by(|a, b| a.sort_cmp(b));
        values.dedup_by(|a, b| a.sort_cmp(b) == Ordering::Equal);
    }

    match func {
        AggregateFunc::Count => Ok(Value::Int64(
            values.iter().filter(|v| !v.is_null()).count() as i64
        )),
        AggregateFunc::Sum => Ok(numeric_sum(&values)),
        AggregateFunc::Min => Ok(values
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        AggregateFunc::Max => Ok(values
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        AggregateFunc::Avg => {
            let count = values.iter().filter(|v| !v.is_null()).count();
            if count == 0 {
                return Ok(Value::Null);
            }
            let sum = numeric_sum(&values).as_f64().unwrap_or(0.0);
            Ok(Value::Double(sum / count as f64))
        }
        AggregateFunc::Udf(name) => {
            let sample = values.first().cloned().unwrap_or(Value::Null);
            let kernel = udf::global().aggregate(name, std::slice::from_ref(&sample))?;
            let mut state = (kernel.init)();
            for value in &values {
                (kernel.consume)(&mut state, std::slice::from_ref(value))?;
            }
            (kernel.finalize)(state)
        }
    }
}

fn project_plain(
    projection: &[ProjectionItem],
    source_columns: &[String],
    rows: &[Vec<Value>],
) -> Result<QueryOutput> {
    let mut columns = Vec::new();
    for item in projection {
        match item {
            ProjectionItem::AllColumns => columns.extend(source_columns.iter().cloned()),
            other => columns.push(projection_name(other)),
        }
    }
    let mut out_rows = Vec::with_capacity(rows.len());
    for row in rows {
        let context = RowContext::new(source_columns, row);
        let mut out = Vec::with_capacity(columns.len());
        for item in projection {
            match item {
                ProjectionItem::AllColumns => out.extend(row.iter().cloned()),
                ProjectionItem::Expr { expr, .. } => out.push(expr.evaluate(&context)?),
                ProjectionItem::Aggregate { .. } => {
                    return Err(Error::PhysicalPlan {
                        what: "aggregate outside a grouped pipeline".to_string(),
                    })
                }
            }
        }
        out_rows.push(out);
    }
    Ok(QueryOutput {
        columns,
        rows: out_rows,
    })
}

fn project_grouped(plan: &SelectPlan, source_columns: &[String], rows: &[Vec<Value>]) -> Result<QueryOutput> {
    // Bucket rows by the GROUP BY key; no key means one global group,
    // which exists even for empty input (COUNT over nothing is 0).
    let mut groups: BTreeMap<GroupKey, Vec<Vec<Value>>> = BTreeMap::new();
    if plan.group_by.is_empty() {
        groups.insert(GroupKey(Vec::new()), rows.to_vec());
    } else {
        for row in rows {
            let context = RowContext::new(source_columns, row);
            let mut key = Vec::with_capacity(plan.group_by.len());
            for column in &plan.group_by {
                key.push(context.get(column)?);
            }
            groups.entry(GroupKey(key)).or_default().push(row.clone());
        }
    }

    let columns: Vec<String> = plan.projection.iter().map(projection_name).collect();
    let mut out_rows = Vec::with_capacity(groups.len());
    for (_, group_rows) in groups {
        let mut out = Vec::with_capacity(plan.projection.len());
        for item in &plan.projection {
            match item {
                ProjectionItem::AllColumns => {
                    return Err(Error::PhysicalPlan {
                        what: "SELECT * cannot be grouped".to_string(),
                    })
                }
                ProjectionItem::Expr { expr, .. } => {
                    // Group columns are constant inside the group, so the
                    // first row stands for all of them.
                    let representative = group_rows.first().ok_or_else(|| Error::PhysicalPlan {
                        what: "grouped expression over empty group".to_string(),
                    })?;
                    out.push(expr.evaluate(&RowContext::new(source_columns, representative))?);
                }
                ProjectionItem::Aggregate {
                    func,
                    arg,
                    distinct,
                    ..
                } => out.push(aggregate_value(
                    func,
                    arg.as_ref(),
                    *distinct,
                    source_columns,
                    &group_rows,
                )?),
            }
        }
        out_rows.push(out);
    }
    Ok(QueryOutput {
        columns,
        rows: out_rows,
    })
}

/// Execute a read pipeline under the `(start_ts, txn_id)` snapshot.
pub fn execute_select(
    plan: &SelectPlan,
    provider: &dyn TableProvider,
    start_ts: u64,
    txn_id: u64,
) -> Result<QueryOutput> {
    let table = provider.table(&plan.collection)?;
    let mut source_columns: Vec<String> = table
        .schema()
        .columns()
        .iter()
        .map(|c| c.name.clone())
        .collect();
    let mut rows = base_rows(plan, table, start_ts, txn_id);

    if let Some(join) = &plan.join {
        let right = provider.table(&join.right)?;
        let right_columns: Vec<String> = right
            .schema()
            .columns()
            .iter()
            .map(|c| format!("{}.{}", join.right.collection, c.name))
            .collect();
        let right_rows: Vec<Vec<Value>> = right
            .scan(start_ts, txn_id, None)
            .map(|(_, values)| values)
            .collect();

        let left_columns = source_columns.clone();
        let mut all_columns = left_columns.clone();
        all_columns.extend(right_columns.iter().cloned());
        rows = join_rows(
            &left_columns,
            rows,
            &right_columns,
            right_rows,
            join.kind,
            join.on.as_ref(),
            &all_columns,
        )?;
        source_columns = all_columns;
    }

    if let Some(predicate) = &plan.predicate {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if predicate.matches(&RowContext::new(&source_columns, &row))? {
                kept.push(row);
            }
        }
        rows = kept;
    }

    let grouped = !plan.group_by.is_empty()
        || plan
            .projection
            .iter()
            .any(|item| matches!(item, ProjectionItem::Aggregate { .. }));

    let mut output = if grouped {
        let mut output = project_grouped(plan, &source_columns, &rows)?;
        if let Some(having) = &plan.having {
            let mut kept = Vec::with_capacity(output.rows.len());
            for row in output.rows {
                if having.matches(&RowContext::new(&output.columns, &row))? {
                    kept.push(row);
                }
            }
            output.rows = kept;
        }
        if !plan.order_by.is_empty() {
            sort_rows(&output.columns, &mut output.rows, &plan.order_by)?;
        }
        output
    } else {
        // Sorting happens over the scan output so ORDER BY may reference
        // columns the projection drops.
        let mut rows = rows;
        if !plan.order_by.is_empty() {
            sort_rows(&source_columns, &mut rows, &plan.order_by)?;
        }
        project_plain(&plan.projection, &source_columns, &rows)?
    };

    if let Some(limit) = plan.limit {
        output.rows.truncate(limit);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::JoinSpec;
    use otterbrix_core::{
        ColumnDefinition, CompareOp, DataChunk, LogicalType, Schema, TXN_BASE,
    };
    use rustc_hash::FxHashMap;

    const T1: u64 = TXN_BASE + 1;
    const READER: u64 = TXN_BASE + 50;

    struct Tables {
        map: FxHashMap<CollectionName, TableStore>,
    }

    impl TableProvider for Tables {
        fn table(&self, name: &CollectionName) -> Result<&TableStore> {
            self.map.get(name).ok_or_else(|| Error::CollectionNotExists {
                name: name.to_string(),
            })
        }
    }

    fn users_and_orders() -> Tables {
        let mut users = TableStore::new(
            CollectionName::new("db", "users"),
            Schema::new(vec![
                ColumnDefinition::new("id", LogicalType::BigInt),
                ColumnDefinition::new("name", LogicalType::String),
            ]),
        );
        let rows: Vec<Vec<Value>> = [(1, "ann"), (2, "bob"), (3, "cyd")]
            .iter()
            .map(|(id, name)| vec![Value::Int64(*id), Value::String(name.to_string())])
            .collect();
        users
            .append(
                &DataChunk::from_rows(vec![LogicalType::BigInt, LogicalType::String], &rows)
                    .unwrap(),
                T1,
            )
            .unwrap();
        users.commit(T1, 1);

        let mut orders = TableStore::new(
            CollectionName::new("db", "orders"),
            Schema::new(vec![
                ColumnDefinition::new("user_id", LogicalType::BigInt),
                ColumnDefinition::new("total", LogicalType::BigInt),
            ]),
        );
        let rows: Vec<Vec<Value>> = [(1, 10), (1, 20), (3, 30)]
            .iter()
            .map(|(u, t)| vec![Value::Int64(*u), Value::Int64(*t)])
            .collect();
        orders
            .append(
                &DataChunk::from_rows(vec![LogicalType::BigInt, LogicalType::BigInt], &rows)
                    .unwrap(),
                T1,
            )
            .unwrap();
        orders.commit(T1, 1);

        let mut map = FxHashMap::default();
        map.insert(CollectionName::new("db", "users"), users);
        map.insert(CollectionName::new("db", "orders"), orders);
        Tables { map }
    }

    #[test]
    fn filtered_ordered_scan() {
        let tables = users_and_orders();
        let plan = SelectPlan::scan(CollectionName::new("db", "users"))
            .with_predicate(Predicate::compare("id", CompareOp::Gt, Value::Int64(1)))
            .order_by(ScalarExpr::column("id"), SortOrder::Asc);
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.columns, vec!["id", "name"]);
        assert_eq!(output.rows.len(), 2);
        assert_eq!(output.rows[0][0], Value::Int64(2));
        assert_eq!(output.rows[1][0], Value::Int64(3));
    }

    #[test]
    fn descending_order_and_limit() {
        let tables = users_and_orders();
        let plan = SelectPlan::scan(CollectionName::new("db", "users"))
            .order_by(ScalarExpr::column("id"), SortOrder::Desc)
            .with_limit(2);
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.rows.len(), 2);
        assert_eq!(output.rows[0][0], Value::Int64(3));
        assert_eq!(output.rows[1][0], Value::Int64(2));
    }

    #[test]
    fn projection_with_expression() {
        let tables = users_and_orders();
        let mut plan = SelectPlan::scan(CollectionName::new("db", "users"));
        plan.projection = vec![ProjectionItem::Expr {
            expr: ScalarExpr::Arith {
                op: crate::expr::ArithOp::Add,
                left: Box::new(ScalarExpr::column("id")),
                right: Box::new(ScalarExpr::literal(Value::Int64(100))),
            },
            alias: Some("id_plus".to_string()),
        }];
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.columns, vec!["id_plus"]);
        assert_eq!(output.rows[0][0], Value::Int64(101));
    }

    #[test]
    fn global_aggregates() {
        let tables = users_and_orders();
        let mut plan = SelectPlan::scan(CollectionName::new("db", "orders"));
        plan.projection = vec![
            ProjectionItem::Aggregate {
                func: AggregateFunc::Count,
                arg: None,
                distinct: false,
                alias: None,
            },
            ProjectionItem::Aggregate {
                func: AggregateFunc::Sum,
                arg: Some(ScalarExpr::column("total")),
                distinct: false,
                alias: None,
            },
            ProjectionItem::Aggregate {
                func: AggregateFunc::Avg,
                arg: Some(ScalarExpr::column("total")),
                distinct: false,
                alias: None,
            },
            ProjectionItem::Aggregate {
                func: AggregateFunc::Count,
                arg: Some(ScalarExpr::column("user_id")),
                distinct: true,
                alias: Some("buyers".to_string()),
            },
        ];
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0][0], Value::Int64(3));
        assert_eq!(output.rows[0][1], Value::Int64(60));
        assert_eq!(output.rows[0][2], Value::Double(20.0));
        assert_eq!(output.rows[0][3], Value::Int64(2));
    }

    #[test]
    fn aggregate_over_empty_input_yields_one_row() {
        let tables = users_and_orders();
        let mut plan = SelectPlan::scan(CollectionName::new("db", "orders"))
            .with_predicate(Predicate::compare("total", CompareOp::Gt, Value::Int64(999)));
        plan.projection = vec![ProjectionItem::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
            alias: None,
        }];
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0][0], Value::Int64(0));
    }

    #[test]
    fn group_by_with_having() {
        let tables = users_and_orders();
        let mut plan = SelectPlan::scan(CollectionName::new("db", "orders"));
        plan.projection = vec![
            ProjectionItem::Expr {
                expr: ScalarExpr::column("user_id"),
                alias: None,
            },
            ProjectionItem::Aggregate {
                func: AggregateFunc::Sum,
                arg: Some(ScalarExpr::column("total")),
                distinct: false,
                alias: Some("spent".to_string()),
            },
        ];
        plan.group_by = vec!["user_id".to_string()];
        plan.having = Some(Predicate::compare("spent", CompareOp::Gt, Value::Int64(25)));
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.columns, vec!["user_id", "spent"]);
        assert_eq!(output.rows.len(), 2);
        // Groups come out in key order.
        assert_eq!(output.rows[0], vec![Value::Int64(1), Value::Int64(30)]);
        assert_eq!(output.rows[1], vec![Value::Int64(3), Value::Int64(30)]);
    }

    #[test]
    fn inner_and_left_join() {
        let tables = users_and_orders();
        let join = |kind| {
            let mut plan = SelectPlan::scan(CollectionName::new("db", "users"));
            plan.join = Some(JoinSpec {
                kind,
                right: CollectionName::new("db", "orders"),
                on: Some(Predicate::Compare {
                    left: ScalarExpr::column("id"),
                    op: CompareOp::Eq,
                    right: ScalarExpr::column("orders.user_id"),
                }),
            });
            plan.order_by = vec![(ScalarExpr::column("id"), SortOrder::Asc)];
            plan
        };

        let inner = execute_select(&join(JoinKind::Inner), &tables, 2, READER).unwrap();
        assert_eq!(inner.rows.len(), 3);

        let left = execute_select(&join(JoinKind::Left), &tables, 2, READER).unwrap();
        // bob has no orders but survives with NULL padding.
        assert_eq!(left.rows.len(), 4);
        let bob = left
            .rows
            .iter()
            .find(|r| r[1] == Value::String("bob".to_string()))
            .unwrap();
        assert_eq!(bob[2], Value::Null);
        assert_eq!(bob[3], Value::Null);
    }

    #[test]
    fn cross_join_counts() {
        let tables = users_and_orders();
        let mut plan = SelectPlan::scan(CollectionName::new("db", "users"));
        plan.join = Some(JoinSpec {
            kind: JoinKind::Cross,
            right: CollectionName::new("db", "orders"),
            on: None,
        });
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.rows.len(), 9);
        assert_eq!(output.columns.len(), 4);
    }

    #[test]
    fn index_scan_agrees_with_table_scan() {
        let mut tables = users_and_orders();
        tables
            .map
            .get_mut(&CollectionName::new("db", "users"))
            .unwrap()
            .create_index("idx_id", "id", false)
            .unwrap();

        let plan = SelectPlan::scan(CollectionName::new("db", "users"))
            .with_predicate(Predicate::compare("id", CompareOp::Eq, Value::Int64(2)));
        let output = execute_select(&plan, &tables, 2, READER).unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0][1], Value::String("bob".to_string()));
    }

    #[test]
    fn unknown_collection_errors() {
        let tables = users_and_orders();
        let plan = SelectPlan::scan(CollectionName::new("db", "nope"));
        let err = execute_select(&plan, &tables, 2, READER).unwrap_err();
        assert!(matches!(err, Error::CollectionNotExists { .. }));
    }
}
