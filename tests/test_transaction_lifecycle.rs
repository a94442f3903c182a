use snapdb::{DataType, Database, Error, Expr, IsolationLevel, TableBuilder, Value};

fn accounts() -> Database {
    let db = Database::in_memory();
    db.create_table(
        TableBuilder::new("accounts")
            .primary_key("id")
            .column_not_null("owner", DataType::Text)
            .column("balance", DataType::Integer)
            .build(),
    )
    .unwrap();
    db.create_index("accounts_owner_idx", "accounts", &["owner"], false)
        .unwrap();

    let txn = db.begin_default();
    for (id, owner, balance) in [(1, "ana", 100), (2, "ben", 50), (3, "cy", 0)] {
        db.insert(&txn, "accounts", vec![id.into(), owner.into(), balance.into()])
            .unwrap();
    }
    db.commit(&txn).unwrap();
    db
}

fn balances(db: &Database) -> Vec<Vec<Value>> {
    let txn = db.begin_default();
    let mut rows: Vec<Vec<Value>> = db
        .scan(&txn, "accounts")
        .unwrap()
        .into_iter()
        .map(|(_, row)| row)
        .collect();
    db.commit(&txn).unwrap();
    rows.sort_by_key(|row| match row[0] {
        Value::Integer(id) => id,
        _ => 0,
    });
    rows
}

#[test]
fn test_transaction_lifecycle() {
    let db = accounts();

    // BEGIN / COMMIT
    let txn = db.begin(IsolationLevel::ReadCommitted);
    assert_eq!(db.active_transactions(), 1);
    db.update(
        &txn,
        "accounts",
        Some(Expr::col("id").eq(Expr::lit(1))),
        &[("balance", Expr::col("balance").sub(Expr::lit(30)))],
    )
    .unwrap();
    db.commit(&txn).unwrap();
    assert_eq!(db.active_transactions(), 0);
    assert_eq!(balances(&db)[0][2], Value::Integer(70));

    // BEGIN / ROLLBACK
    let txn = db.begin(IsolationLevel::ReadCommitted);
    db.delete(&txn, "accounts", None).unwrap();
    assert!(db.scan(&txn, "accounts").unwrap().is_empty());
    db.abort(&txn).unwrap();
    assert_eq!(balances(&db).len(), 3);

    // a finished transaction cannot be reused
    assert!(matches!(db.abort(&txn), Err(Error::TransactionNotActive(_))));
    assert!(matches!(
        db.insert(&txn, "accounts", vec![9.into(), "zed".into(), 1.into()]),
        Err(Error::TransactionNotActive(_))
    ));
}

#[test]
fn test_abort_restores_every_structure() {
    let db = accounts();
    let before_rows = balances(&db);
    let before_versions: usize = db.verify().unwrap().iter().map(|r| r.versions).sum();

    let txn = db.begin(IsolationLevel::RepeatableRead);
    db.insert(&txn, "accounts", vec![4.into(), "dee".into(), 10.into()])
        .unwrap();
    db.update(
        &txn,
        "accounts",
        Some(Expr::col("owner").eq(Expr::lit("ben"))),
        &[("owner", Expr::lit("benjamin"))],
    )
    .unwrap();
    db.delete(&txn, "accounts", Some(Expr::col("id").eq(Expr::lit(3))))
        .unwrap();
    db.abort(&txn).unwrap();

    assert_eq!(balances(&db), before_rows);
    let reports = db.verify().unwrap();
    assert!(reports.iter().all(|r| r.is_healthy()), "{:?}", reports);
    let after_versions: usize = reports.iter().map(|r| r.versions).sum();
    assert_eq!(after_versions, before_versions);

    // the old key is reachable through the index again, the new one is gone
    let txn = db.begin_default();
    let query = snapdb::Query::from("accounts").filter(Expr::col("owner").eq(Expr::lit("ben")));
    assert_eq!(db.execute(&txn, &query).unwrap().len(), 1);
    let renamed = snapdb::Query::from("accounts")
        .filter(Expr::col("owner").eq(Expr::lit("benjamin")));
    assert!(db.execute(&txn, &renamed).unwrap().is_empty());
    db.commit(&txn).unwrap();
}

#[test]
fn test_failed_statement_rolls_back_only_itself() {
    let db = accounts();
    let txn = db.begin_default();
    db.insert(&txn, "accounts", vec![4.into(), "dee".into(), 10.into()])
        .unwrap();

    // multi-row update that trips the primary key halfway through
    let err = db
        .update(&txn, "accounts", None, &[("id", Expr::lit(1))])
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation { .. }));

    let rows = db.scan(&txn, "accounts").unwrap();
    assert_eq!(rows.len(), 4);
    db.commit(&txn).unwrap();
    assert_eq!(balances(&db).len(), 4);
    assert!(db.verify().unwrap().iter().all(|r| r.is_healthy()));
}

#[test]
fn test_read_only_commit_and_own_writes() {
    let db = accounts();
    let txn = db.begin(IsolationLevel::Serializable);
    let loc = db
        .insert(&txn, "accounts", vec![5.into(), "eve".into(), 5.into()])
        .unwrap();
    assert_eq!(
        db.read(&txn, "accounts", loc).unwrap(),
        Some(vec![5.into(), "eve".into(), 5.into()])
    );

    let other = db.begin(IsolationLevel::ReadCommitted);
    assert_eq!(db.read(&other, "accounts", loc).unwrap(), None);
    db.commit(&other).unwrap();

    db.commit(&txn).unwrap();
    assert_eq!(balances(&db).len(), 4);
}
