use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use snapdb::{
    DataType, Database, EngineConfig, Error, Expr, IsolationLevel, Query, TableBuilder, Value,
};

fn counters(config: EngineConfig) -> Arc<Database> {
    let db = Database::open(config).unwrap();
    db.create_table(
        TableBuilder::new("counters")
            .primary_key("id")
            .column_not_null("value", DataType::Integer)
            .build(),
    )
    .unwrap();
    let txn = db.begin_default();
    db.insert(&txn, "counters", vec![1.into(), 0.into()]).unwrap();
    db.insert(&txn, "counters", vec![2.into(), 0.into()]).unwrap();
    db.commit(&txn).unwrap();
    Arc::new(db)
}

fn counter(id: i64) -> Option<Expr> {
    Some(Expr::col("id").eq(Expr::lit(id)))
}

fn read_counter(db: &Database, txn: &snapdb::Transaction, id: i64) -> Value {
    db.execute(
        txn,
        &Query::from("counters")
            .filter(Expr::col("id").eq(Expr::lit(id)))
            .select(vec![Expr::col("value")]),
    )
    .unwrap()
    .scalar()
    .cloned()
    .unwrap()
}

fn increment(db: &Database, txn: &snapdb::Transaction, id: i64) -> snapdb::Result<usize> {
    db.update(
        txn,
        "counters",
        counter(id),
        &[("value", Expr::col("value").add(Expr::lit(1)))],
    )
}

#[test]
fn test_serializable_counter_retry() {
    let db = counters(EngineConfig::default());
    let first = db.begin(IsolationLevel::Serializable);
    let second = db.begin(IsolationLevel::Serializable);
    assert_eq!(read_counter(&db, &first, 1), Value::Integer(0));
    assert_eq!(read_counter(&db, &second, 1), Value::Integer(0));

    increment(&db, &first, 1).unwrap();
    db.commit(&first).unwrap();

    let err = increment(&db, &second, 1).unwrap_err();
    assert!(matches!(err, Error::SerializationFailure { .. }));
    assert!(err.requires_restart());

    // retry from scratch
    let retry = db.begin(IsolationLevel::Serializable);
    assert_eq!(read_counter(&db, &retry, 1), Value::Integer(1));
    increment(&db, &retry, 1).unwrap();
    db.commit(&retry).unwrap();

    let check = db.begin_default();
    assert_eq!(read_counter(&db, &check, 1), Value::Integer(2));
    db.commit(&check).unwrap();
}

#[test]
fn test_deadlock_aborts_one_side() {
    let db = counters(EngineConfig::default().lock_timeout(Duration::from_secs(10)));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = [(1i64, 2i64), (2, 1)]
        .into_iter()
        .map(|(first, second)| {
            let db = db.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let txn = db.begin(IsolationLevel::ReadCommitted);
                increment(&db, &txn, first).unwrap();
                barrier.wait();
                match increment(&db, &txn, second) {
                    Ok(_) => {
                        db.commit(&txn).unwrap();
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
        })
        .collect();

    let results: Vec<snapdb::Result<()>> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();
    let deadlocks = results
        .iter()
        .filter(|r| matches!(r, Err(Error::DeadlockDetected(_))))
        .count();
    assert_eq!(deadlocks, 1, "{:?}", results);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

    // only the survivor's increments are visible
    let check = db.begin_default();
    assert_eq!(read_counter(&db, &check, 1), Value::Integer(1));
    assert_eq!(read_counter(&db, &check, 2), Value::Integer(1));
    db.commit(&check).unwrap();
    assert_eq!(db.active_transactions(), 0);
}

#[test]
fn test_read_committed_writer_waits_then_conflicts() {
    let db = counters(EngineConfig::default());
    let holder = db.begin(IsolationLevel::ReadCommitted);
    increment(&db, &holder, 1).unwrap();

    let waiter = {
        let db = db.clone();
        thread::spawn(move || {
            let txn = db.begin(IsolationLevel::ReadCommitted);
            let result = increment(&db, &txn, 1);
            let _ = db.abort(&txn);
            result
        })
    };
    thread::sleep(Duration::from_millis(50));
    db.commit(&holder).unwrap();

    assert!(matches!(
        waiter.join().unwrap(),
        Err(Error::WriteConflict { .. })
    ));
}

#[test]
fn test_waiter_proceeds_after_holder_aborts() {
    let db = counters(EngineConfig::default());
    let holder = db.begin(IsolationLevel::ReadCommitted);
    increment(&db, &holder, 1).unwrap();

    let waiter = {
        let db = db.clone();
        thread::spawn(move || {
            let txn = db.begin(IsolationLevel::ReadCommitted);
            let updated = increment(&db, &txn, 1)?;
            db.commit(&txn)?;
            Ok::<usize, Error>(updated)
        })
    };
    thread::sleep(Duration::from_millis(50));
    db.abort(&holder).unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), 1);
    let check = db.begin_default();
    assert_eq!(read_counter(&db, &check, 1), Value::Integer(1));
    db.commit(&check).unwrap();
}

#[test]
fn test_lock_timeout() {
    let db = counters(EngineConfig::default().lock_timeout(Duration::from_millis(50)));
    let holder = db.begin(IsolationLevel::ReadCommitted);
    increment(&db, &holder, 1).unwrap();

    let txn = db.begin(IsolationLevel::ReadCommitted);
    assert!(matches!(
        increment(&db, &txn, 1),
        Err(Error::LockTimeout { .. })
    ));
    // a timeout only fails the statement
    increment(&db, &txn, 2).unwrap();
    db.commit(&txn).unwrap();
    db.commit(&holder).unwrap();
}

#[test]
fn test_idle_transactions_are_swept() {
    let db = counters(
        EngineConfig::default()
            .idle_timeout(Duration::from_millis(20))
            .abort_idle(true),
    );
    let idle = db.begin(IsolationLevel::RepeatableRead);
    increment(&db, &idle, 1).unwrap();
    let busy = db.begin(IsolationLevel::ReadCommitted);

    thread::sleep(Duration::from_millis(60));
    read_counter(&db, &busy, 2);
    let swept = db.sweep_idle();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].id, idle.id);
    assert!(swept[0].aborted);
    assert!(swept[0].idle >= Duration::from_millis(20));

    assert!(matches!(
        db.commit(&idle),
        Err(Error::TransactionNotActive(_))
    ));
    assert_eq!(read_counter(&db, &busy, 1), Value::Integer(0));
    db.commit(&busy).unwrap();
}

#[test]
fn test_idle_monitor_aborts_in_background() {
    let db = counters(
        EngineConfig::default()
            .idle_timeout(Duration::from_millis(10))
            .sweep_interval(Duration::from_millis(10))
            .abort_idle(true),
    );
    let monitor = db.spawn_idle_monitor().unwrap();
    let idle = db.begin_default();

    let mut waited = Duration::ZERO;
    while db.active_transactions() > 0 && waited < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    monitor.stop();
    assert_eq!(db.active_transactions(), 0);
    assert!(matches!(
        db.commit(&idle),
        Err(Error::TransactionNotActive(_))
    ));
}
