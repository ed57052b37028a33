//! End-to-end scenarios through the logical-plan API.

use otterbrix::{
    CollectionName, ColumnDefinition, CompareOp, EngineConfig, ErrorCode, InsertSource,
    LogicalPlan, LogicalType, Otterbrix, Predicate, ProjectionItem, ScalarExpr, Schema,
    SelectPlan, SessionId, SortOrder, StorageKind, Value,
};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Otterbrix {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Otterbrix::open(EngineConfig::for_testing(dir.path())).unwrap()
}

fn table_name() -> CollectionName {
    CollectionName::new("db", "t")
}

fn create_bigint_string_table(db: &Otterbrix, session: SessionId, storage: StorageKind) {
    let cursor = db.execute(
        session,
        LogicalPlan::CreateDatabase {
            database: "db".to_string(),
        },
    );
    assert!(cursor.is_success(), "{}", cursor.what());
    let cursor = db.execute(
        session,
        LogicalPlan::CreateCollection {
            collection: table_name(),
            schema: Schema::new(vec![
                ColumnDefinition::new("a", LogicalType::BigInt),
                ColumnDefinition::new("b", LogicalType::String),
            ]),
            storage,
        },
    );
    assert!(cursor.is_success(), "{}", cursor.what());
}

fn insert_rows(db: &Otterbrix, session: SessionId, rows: Vec<Vec<Value>>) -> usize {
    let cursor = db.execute(
        session,
        LogicalPlan::Insert {
            collection: table_name(),
            columns: vec![],
            source: InsertSource::Rows(rows),
        },
    );
    assert!(cursor.is_success(), "{}", cursor.what());
    cursor.affected()
}

fn count_rows(db: &Otterbrix, session: SessionId) -> i64 {
    let mut plan = SelectPlan::scan(table_name());
    plan.projection = vec![ProjectionItem::Aggregate {
        func: otterbrix::AggregateFunc::Count,
        arg: Some(ScalarExpr::column("a")),
        distinct: false,
        alias: None,
    }];
    let cursor = db.execute(session, LogicalPlan::Select(plan));
    assert!(cursor.is_success(), "{}", cursor.what());
    cursor.rows()[0][0].as_i64().unwrap()
}

#[test]
fn insert_then_filtered_ordered_scan() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);

    insert_rows(
        &db,
        session,
        vec![
            vec![Value::Int64(1), Value::String("x".to_string())],
            vec![Value::Int64(2), Value::String("y".to_string())],
            vec![Value::Int64(3), Value::String("z".to_string())],
        ],
    );

    let cursor = db.execute(
        session,
        LogicalPlan::Select(
            SelectPlan::scan(table_name())
                .with_predicate(Predicate::compare("a", CompareOp::Gt, Value::Int64(1)))
                .order_by(ScalarExpr::column("a"), SortOrder::Asc),
        ),
    );
    assert!(cursor.is_success());
    assert_eq!(cursor.len(), 2);
    assert_eq!(
        cursor.row(0).unwrap(),
        &[Value::Int64(2), Value::String("y".to_string())]
    );
    assert_eq!(
        cursor.row(1).unwrap(),
        &[Value::Int64(3), Value::String("z".to_string())]
    );
}

#[test]
fn not_null_and_default_enforcement() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    db.execute(
        session,
        LogicalPlan::CreateDatabase {
            database: "db".to_string(),
        },
    );
    let cursor = db.execute(
        session,
        LogicalPlan::CreateCollection {
            collection: table_name(),
            schema: Schema::new(vec![
                ColumnDefinition::new("name", LogicalType::String).not_null(),
                ColumnDefinition::new("tag", LogicalType::String)
                    .not_null()
                    .with_default(Value::String("pending".to_string())),
            ]),
            storage: StorageKind::Memory,
        },
    );
    assert!(cursor.is_success());

    // Missing column takes the declared default.
    let cursor = db.execute(
        session,
        LogicalPlan::Insert {
            collection: table_name(),
            columns: vec!["name".to_string()],
            source: InsertSource::Rows(vec![vec![Value::String("a".to_string())]]),
        },
    );
    assert!(cursor.is_success());
    assert_eq!(cursor.affected(), 1);

    // Explicit NULL into NOT NULL rejects the statement.
    let cursor = db.execute(
        session,
        LogicalPlan::Insert {
            collection: table_name(),
            columns: vec!["name".to_string(), "tag".to_string()],
            source: InsertSource::Rows(vec![vec![
                Value::Null,
                Value::String("x".to_string()),
            ]]),
        },
    );
    assert!(cursor.is_error());

    let cursor = db.execute(session, LogicalPlan::Select(SelectPlan::scan(table_name())));
    assert_eq!(cursor.len(), 1);
    assert_eq!(
        cursor.row(0).unwrap(),
        &[
            Value::String("a".to_string()),
            Value::String("pending".to_string())
        ]
    );
}

#[test]
fn index_search_agrees_with_scan() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);

    let rows: Vec<Vec<Value>> = (0..200)
        .map(|i| vec![Value::Int64(i % 10), Value::String(format!("r{}", i))])
        .collect();
    insert_rows(&db, session, rows);

    let cursor = db.execute(
        session,
        LogicalPlan::CreateIndex {
            collection: table_name(),
            name: "idx_a".to_string(),
            column: "a".to_string(),
            unique: false,
        },
    );
    assert!(cursor.is_success(), "{}", cursor.what());

    let query = |db: &Otterbrix| {
        db.execute(
            session,
            LogicalPlan::Select(
                SelectPlan::scan(table_name())
                    .with_predicate(Predicate::compare("a", CompareOp::Eq, Value::Int64(7)))
                    .order_by(ScalarExpr::column("b"), SortOrder::Asc),
            ),
        )
    };
    // Indexed query; 20 of 200 rows have a = 7.
    let indexed = query(&db);
    assert!(indexed.is_success());
    assert_eq!(indexed.len(), 20);

    // The same query after the index is gone must agree row for row.
    let cursor = db.execute(
        session,
        LogicalPlan::DropIndex {
            collection: table_name(),
            name: "idx_a".to_string(),
        },
    );
    assert!(cursor.is_success());
    let scanned = query(&db);
    assert_eq!(indexed.rows(), scanned.rows());
}

#[test]
fn duplicate_ddl_reports_user_errors() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);

    let cursor = db.execute(
        session,
        LogicalPlan::CreateDatabase {
            database: "db".to_string(),
        },
    );
    assert_eq!(cursor.code(), ErrorCode::DatabaseAlreadyExists);

    let cursor = db.execute(
        session,
        LogicalPlan::CreateCollection {
            collection: table_name(),
            schema: Schema::new(vec![ColumnDefinition::new("a", LogicalType::BigInt)]),
            storage: StorageKind::Memory,
        },
    );
    assert_eq!(cursor.code(), ErrorCode::CollectionAlreadyExists);

    let cursor = db.execute(
        session,
        LogicalPlan::Select(SelectPlan::scan(CollectionName::new("db", "missing"))),
    );
    assert_eq!(cursor.code(), ErrorCode::CollectionNotExists);

    let cursor = db.execute(
        session,
        LogicalPlan::Select(SelectPlan::scan(CollectionName::new("nope", "t"))),
    );
    assert_eq!(cursor.code(), ErrorCode::DatabaseNotExists);
}

#[test]
fn session_transaction_isolation() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let writer = db.new_session();
    let reader = db.new_session();
    create_bigint_string_table(&db, writer, StorageKind::Memory);

    db.begin_transaction(writer).unwrap();
    insert_rows(
        &db,
        writer,
        vec![vec![Value::Int64(1), Value::String("x".to_string())]],
    );

    // The writer sees its own uncommitted row, the reader does not.
    assert_eq!(count_rows(&db, writer), 1);
    assert_eq!(count_rows(&db, reader), 0);

    db.commit_transaction(writer).unwrap();
    assert_eq!(count_rows(&db, reader), 1);

    // An aborted transaction leaves nothing behind.
    db.begin_transaction(writer).unwrap();
    insert_rows(
        &db,
        writer,
        vec![vec![Value::Int64(2), Value::String("y".to_string())]],
    );
    assert_eq!(count_rows(&db, writer), 2);
    db.abort_transaction(writer).unwrap();
    assert_eq!(count_rows(&db, reader), 1);
}

#[test]
fn concurrent_delete_conflicts() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let first = db.new_session();
    let second = db.new_session();
    create_bigint_string_table(&db, first, StorageKind::Memory);
    insert_rows(
        &db,
        first,
        vec![vec![Value::Int64(1), Value::String("x".to_string())]],
    );

    // First session holds an uncommitted delete of the row.
    db.begin_transaction(first).unwrap();
    let cursor = db.execute(
        first,
        LogicalPlan::Delete {
            collection: table_name(),
            predicate: None,
            limit: None,
        },
    );
    assert!(cursor.is_success());
    assert_eq!(cursor.affected(), 1);

    // The second session's delete of the same row must conflict.
    let cursor = db.execute(
        second,
        LogicalPlan::Delete {
            collection: table_name(),
            predicate: None,
            limit: None,
        },
    );
    assert_eq!(cursor.code(), ErrorCode::WriteConflict);

    // Only the conflicting transaction died; the first commits fine.
    db.commit_transaction(first).unwrap();
    assert_eq!(count_rows(&db, second), 0);
}

#[test]
fn update_moves_rows() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);
    insert_rows(
        &db,
        session,
        (0..10)
            .map(|i| vec![Value::Int64(i), Value::String(format!("r{}", i))])
            .collect(),
    );

    let cursor = db.execute(
        session,
        LogicalPlan::Update {
            collection: table_name(),
            set: vec![("a".to_string(), ScalarExpr::literal(Value::Int64(999)))],
            predicate: Some(Predicate::compare("a", CompareOp::Eq, Value::Int64(5))),
            limit: None,
        },
    );
    assert!(cursor.is_success());
    assert_eq!(cursor.affected(), 1);

    let by_value = |v: i64| {
        let cursor = db.execute(
            session,
            LogicalPlan::Select(SelectPlan::scan(table_name()).with_predicate(
                Predicate::compare("a", CompareOp::Eq, Value::Int64(v)),
            )),
        );
        cursor.len()
    };
    assert_eq!(by_value(999), 1);
    assert_eq!(by_value(5), 0);
    assert_eq!(count_rows(&db, session), 10);
}

#[test]
fn vacuum_keeps_visible_state() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);
    insert_rows(
        &db,
        session,
        (0..100)
            .map(|i| vec![Value::Int64(i), Value::String(format!("r{}", i))])
            .collect(),
    );
    let cursor = db.execute(
        session,
        LogicalPlan::Delete {
            collection: table_name(),
            predicate: Some(Predicate::compare("a", CompareOp::Lt, Value::Int64(50))),
            limit: None,
        },
    );
    assert_eq!(cursor.affected(), 50);

    let cursor = db.execute(session, LogicalPlan::Vacuum);
    assert!(cursor.is_success());
    assert_eq!(count_rows(&db, session), 50);

    let cursor = db.execute(
        session,
        LogicalPlan::Select(
            SelectPlan::scan(table_name())
                .with_predicate(Predicate::compare("a", CompareOp::Eq, Value::Int64(75))),
        ),
    );
    assert_eq!(cursor.len(), 1);
}

#[test]
fn row_udf_in_projection() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);
    insert_rows(
        &db,
        session,
        vec![
            vec![Value::Int64(3), Value::String("x".to_string())],
            vec![Value::Int64(4), Value::String("y".to_string())],
        ],
    );

    otterbrix::udf::global().register_row(
        "square",
        vec![LogicalType::BigInt],
        std::sync::Arc::new(|args| {
            let v = args[0].as_i64().unwrap_or(0);
            Ok(Value::Int64(v * v))
        }),
    );

    let mut plan = SelectPlan::scan(table_name());
    plan.projection = vec![ProjectionItem::Expr {
        expr: ScalarExpr::UdfCall {
            name: "square".to_string(),
            args: vec![ScalarExpr::column("a")],
        },
        alias: Some("sq".to_string()),
    }];
    plan.order_by = vec![(ScalarExpr::column("a"), SortOrder::Asc)];
    let cursor = db.execute(session, LogicalPlan::Select(plan));
    assert!(cursor.is_success(), "{}", cursor.what());
    assert_eq!(cursor.rows()[0][0], Value::Int64(9));
    assert_eq!(cursor.rows()[1][0], Value::Int64(16));

    // Unknown functions surface through the cursor.
    let mut plan = SelectPlan::scan(table_name());
    plan.projection = vec![ProjectionItem::Expr {
        expr: ScalarExpr::UdfCall {
            name: "nope".to_string(),
            args: vec![],
        },
        alias: None,
    }];
    let cursor = db.execute(session, LogicalPlan::Select(plan));
    assert_eq!(cursor.code(), ErrorCode::UnrecognizedFunction);
}

#[test]
fn aggregate_udf_over_groups() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);
    insert_rows(
        &db,
        session,
        vec![
            vec![Value::Int64(2), Value::String("a".to_string())],
            vec![Value::Int64(3), Value::String("a".to_string())],
            vec![Value::Int64(4), Value::String("b".to_string())],
        ],
    );

    otterbrix::udf::global().register_aggregate(
        "product",
        vec![LogicalType::BigInt],
        otterbrix::AggregateUdf {
            init: std::sync::Arc::new(|| Value::Int64(1)),
            consume: std::sync::Arc::new(|state, args| {
                let merged = state.as_i64().unwrap_or(1) * args[0].as_i64().unwrap_or(1);
                *state = Value::Int64(merged);
                Ok(())
            }),
            merge: std::sync::Arc::new(|state, other| {
                let merged = state.as_i64().unwrap_or(1) * other.as_i64().unwrap_or(1);
                *state = Value::Int64(merged);
                Ok(())
            }),
            finalize: std::sync::Arc::new(Ok),
        },
    );

    let mut plan = SelectPlan::scan(table_name());
    plan.projection = vec![
        ProjectionItem::Expr {
            expr: ScalarExpr::column("b"),
            alias: None,
        },
        ProjectionItem::Aggregate {
            func: otterbrix::AggregateFunc::Udf("product".to_string()),
            arg: Some(ScalarExpr::column("a")),
            distinct: false,
            alias: Some("product".to_string()),
        },
    ];
    plan.group_by = vec!["b".to_string()];
    let cursor = db.execute(session, LogicalPlan::Select(plan));
    assert!(cursor.is_success(), "{}", cursor.what());
    assert_eq!(cursor.len(), 2);
    assert_eq!(
        cursor.row(0).unwrap(),
        &[Value::String("a".to_string()), Value::Int64(6)]
    );
    assert_eq!(
        cursor.row(1).unwrap(),
        &[Value::String("b".to_string()), Value::Int64(4)]
    );
}

#[test]
fn limits_bound_dml_and_reads() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let session = db.new_session();
    create_bigint_string_table(&db, session, StorageKind::Memory);
    insert_rows(
        &db,
        session,
        (0..20)
            .map(|i| vec![Value::Int64(i), Value::String(format!("r{}", i))])
            .collect(),
    );

    let cursor = db.execute(
        session,
        LogicalPlan::Select(SelectPlan::scan(table_name()).with_limit(5)),
    );
    assert_eq!(cursor.len(), 5);

    let cursor = db.execute(
        session,
        LogicalPlan::Delete {
            collection: table_name(),
            predicate: None,
            limit: Some(3),
        },
    );
    assert_eq!(cursor.affected(), 3);
    assert_eq!(count_rows(&db, session), 17);
}
