use proptest::prelude::*;
use snapdb::executor::AccessPath;
use snapdb::{DataType, Database, Expr, Query, TableBuilder, Value};

const DEPARTMENTS: [&str; 5] = ["Engineering", "Sales", "Support", "Finance", "Legal"];

fn employees(rows: i64) -> Database {
    let db = Database::in_memory();
    db.create_table(
        TableBuilder::new("employees")
            .primary_key("id")
            .column_not_null("name", DataType::Text)
            .column_not_null("department", DataType::Text)
            .column("salary", DataType::Integer)
            .build(),
    )
    .unwrap();
    db.create_index("idx_emp_dept", "employees", &["department"], false)
        .unwrap();

    let txn = db.begin_default();
    for id in 0..rows {
        let department = DEPARTMENTS[(id % 5) as usize];
        db.insert(
            &txn,
            "employees",
            vec![
                id.into(),
                format!("emp{}", id).into(),
                department.into(),
                (40_000 + id * 10).into(),
            ],
        )
        .unwrap();
    }
    db.commit(&txn).unwrap();
    db
}

#[test]
fn test_equality_on_indexed_column_uses_index() {
    let db = employees(1000);
    let query = Query::from("employees")
        .filter(Expr::col("department").eq(Expr::lit("Engineering")));

    let explain = db.explain(&query).unwrap();
    assert_eq!(explain.index_name(), Some("idx_emp_dept"));
    assert!((explain.selectivity - 0.2).abs() < 1e-9);
    assert!((explain.estimated_rows - 200.0).abs() < 1e-6);
    assert!(explain.cost < explain.seq_scan_cost);

    let txn = db.begin_default();
    let result = db.execute(&txn, &query).unwrap();
    assert_eq!(result.len(), 200);
    db.commit(&txn).unwrap();
}

#[test]
fn test_broad_predicates_scan_sequentially() {
    let db = employees(1000);
    for filter in [
        Expr::col("department").neq(Expr::lit("Engineering")),
        Expr::col("department").is_not_null(),
    ] {
        let explain = db.explain(&Query::from("employees").filter(filter)).unwrap();
        assert_eq!(explain.access, AccessPath::SeqScan);
    }
}

#[test]
fn test_primary_key_lookup() {
    let db = employees(500);
    let query = Query::from("employees")
        .filter(Expr::col("id").eq(Expr::lit(42)))
        .select(vec![Expr::col("name")]);
    let explain = db.explain(&query).unwrap();
    assert!(explain.uses_index());

    let txn = db.begin_default();
    let result = db.execute(&txn, &query).unwrap();
    assert_eq!(result.scalar(), Some(&Value::from("emp42")));
    db.commit(&txn).unwrap();
}

#[test]
fn test_statistics_follow_modifications() {
    let db = employees(100);
    assert_eq!(db.analyze("employees").unwrap().row_count, 100);

    let txn = db.begin_default();
    db.delete(
        &txn,
        "employees",
        Some(Expr::col("department").eq(Expr::lit("Legal"))),
    )
    .unwrap();
    db.commit(&txn).unwrap();

    let stats = db.analyze("employees").unwrap();
    assert_eq!(stats.row_count, 80);
    let department = db
        .catalog()
        .get_table("employees")
        .unwrap()
        .column_index("department")
        .unwrap();
    assert_eq!(stats.columns[department].distinct, 4);
}

#[test]
fn test_grouped_report() {
    let db = employees(50);
    let txn = db.begin_default();
    let result = db
        .execute(
            &txn,
            &Query::from("employees")
                .filter(Expr::col("salary").gte(Expr::lit(40_100)))
                .group_by(vec![Expr::col("department")])
                .select_as(Expr::col("department"), "department")
                .select_as(Expr::count_star(), "headcount")
                .order_by(Expr::col("department")),
        )
        .unwrap();
    db.commit(&txn).unwrap();

    assert_eq!(result.columns, vec!["department", "headcount"]);
    assert_eq!(result.len(), 5);
    assert_eq!(result.rows[0][0], Value::from("Engineering"));
    let total: i64 = result
        .column("headcount")
        .unwrap()
        .iter()
        .map(|v| match v {
            Value::Integer(n) => *n,
            _ => 0,
        })
        .sum();
    assert_eq!(total, 40);
}

fn sorted_ids(rows: Vec<Vec<Value>>) -> Vec<i64> {
    let mut ids: Vec<i64> = rows
        .into_iter()
        .filter_map(|row| match row[0] {
            Value::Integer(id) => Some(id),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_index_created_during_inserts_is_complete() {
    let db = std::sync::Arc::new(employees(0));
    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for id in 0..400i64 {
                let txn = db.begin_default();
                let department = DEPARTMENTS[(id % 5) as usize];
                db.insert(
                    &txn,
                    "employees",
                    vec![id.into(), format!("emp{}", id).into(), department.into(), Value::Null],
                )
                .unwrap();
                db.commit(&txn).unwrap();
            }
        })
    };
    db.create_index("idx_emp_name", "employees", &["name"], true)
        .unwrap();
    writer.join().unwrap();

    let reports = db.verify().unwrap();
    assert!(reports.iter().all(|r| r.is_healthy()), "{:?}", reports);
    let txn = db.begin_default();
    for id in [0i64, 199, 399] {
        let query = Query::from("employees")
            .filter(Expr::col("name").eq(Expr::lit(format!("emp{}", id))));
        assert!(db.explain(&query).unwrap().uses_index());
        assert_eq!(db.execute(&txn, &query).unwrap().len(), 1);
    }
    db.commit(&txn).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn indexed_filters_match_full_scan(
        scores in proptest::collection::vec(proptest::option::of(0i64..20), 1..120),
        low in 0i64..20,
        width in 0i64..8,
    ) {
        let db = Database::in_memory();
        db.create_table(
            TableBuilder::new("scores")
                .primary_key("id")
                .column("score", DataType::Integer)
                .build(),
        )
        .unwrap();
        db.create_index("idx_scores_score", "scores", &["score"], false).unwrap();

        let txn = db.begin_default();
        for (id, score) in scores.iter().enumerate() {
            let score = score.map_or(Value::Null, Value::Integer);
            db.insert(&txn, "scores", vec![(id as i64).into(), score]).unwrap();
        }
        db.commit(&txn).unwrap();

        let high = low + width;
        let filters: Vec<(Expr, Box<dyn Fn(i64) -> bool>)> = vec![
            (Expr::col("score").eq(Expr::lit(low)), Box::new(move |s: i64| s == low)),
            (
                Expr::col("score").between(Expr::lit(low), Expr::lit(high)),
                Box::new(move |s: i64| s >= low && s <= high),
            ),
            (Expr::col("score").gt(Expr::lit(low)), Box::new(move |s: i64| s > low)),
            (Expr::col("score").lte(Expr::lit(high)), Box::new(move |s: i64| s <= high)),
        ];
        let txn = db.begin_default();
        for (filter, keep) in filters {
            let via_query = db
                .execute(&txn, &Query::from("scores").filter(filter))
                .unwrap();
            let expected: Vec<Vec<Value>> = db
                .scan(&txn, "scores")
                .unwrap()
                .into_iter()
                .map(|(_, row)| row)
                .filter(|row| matches!(row[1], Value::Integer(s) if keep(s)))
                .collect();
            prop_assert_eq!(sorted_ids(via_query.rows), sorted_ids(expected));
        }
        db.commit(&txn).unwrap();
    }
}
