mod support;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use quarry_core::pool::{ConnectionPool, Connector, QueryResult};
use quarry_core::{GovernorError, PoolSettings};
use tokio::time::Instant;

use support::FakeConnector;

fn settings(max_connections: usize) -> PoolSettings {
    PoolSettings {
        max_connections,
        acquire_timeout_ms: 200,
        query_timeout_secs: 5,
        ..PoolSettings::default()
    }
}

async fn run(pool: &ConnectionPool<FakeConnector>, sql: &str) -> Result<QueryResult, GovernorError> {
    let sql = sql.to_string();
    pool.with_connection(move |connector, conn| {
        Box::pin(async move { connector.execute(conn, "learner_u1", &sql, 100).await })
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn concurrent_users_never_exceed_the_ceiling() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(2));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { run(&pool, "sleep:50").await })
        })
        .collect();
    for handle in handles {
        handle.await.expect("join").expect("query");
    }

    let connector = pool.connector();
    assert_eq!(connector.opened(), 2);
    assert_eq!(connector.peak_active(), 2);
    let stats = pool.stats();
    assert_eq!((stats.live, stats.idle, stats.in_use), (2, 2, 0));
}

#[tokio::test(start_paused = true)]
async fn acquire_fails_with_pool_exhausted_after_the_timeout() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));
    let _held = pool.acquire().await.expect("first acquire");

    let started = Instant::now();
    let err = pool.acquire().await.expect_err("pool is full");

    assert!(matches!(err, GovernorError::PoolExhausted { max_connections: 1, .. }), "{err:?}");
    assert!(err.is_busy());
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn waiter_receives_the_released_connection() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));
    let held = pool.acquire().await.expect("first acquire");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.serial) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    let serial = waiter.await.expect("join").expect("second acquire");
    assert_eq!(serial, 1);
    assert_eq!(pool.connector().opened(), 1);
}

#[tokio::test]
async fn statement_errors_return_the_connection() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));

    let err = run(&pool, "fail").await.expect_err("statement fails");
    assert!(matches!(err, GovernorError::Query(_)), "{err:?}");
    assert_eq!(pool.stats().idle, 1);

    run(&pool, "select 1").await.expect("reuse");
    assert_eq!(pool.connector().opened(), 1);
}

#[tokio::test]
async fn broken_connections_are_discarded() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));

    let err = run(&pool, "break").await.expect_err("connection breaks");
    assert!(matches!(err, GovernorError::Connection(_)), "{err:?}");
    assert_eq!(pool.stats().live, 0);

    run(&pool, "select 1").await.expect("fresh connection");
    assert_eq!(pool.connector().opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn overrunning_queries_time_out_and_are_discarded() {
    let pool = ConnectionPool::new(
        FakeConnector::default(),
        PoolSettings {
            query_timeout_secs: 1,
            ..settings(1)
        },
    );

    let err = run(&pool, "sleep:5000").await.expect_err("times out");

    assert!(matches!(err, GovernorError::QueryTimeout { .. }), "{err:?}");
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_callers_do_not_leak_connections() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));

    let task = {
        let pool = pool.clone();
        tokio::spawn(async move { run(&pool, "sleep:60000").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.stats().in_use, 1);

    task.abort();
    assert!(task.await.expect_err("aborted").is_cancelled());

    // The interrupted handle is untrusted, so it was closed, not pooled.
    let stats = pool.stats();
    assert_eq!((stats.live, stats.idle), (0, 0));
    run(&pool, "select 1").await.expect("slot is free again");
}

#[tokio::test]
async fn failed_connects_release_their_slot() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));
    pool.connector().fail_connect.store(true, Ordering::SeqCst);

    let err = run(&pool, "select 1").await.expect_err("cannot connect");
    assert!(matches!(err, GovernorError::Connection(_)), "{err:?}");
    assert_eq!(pool.stats().live, 0);

    pool.connector().fail_connect.store(false, Ordering::SeqCst);
    run(&pool, "select 1").await.expect("connects now");
}

#[tokio::test]
async fn idle_connections_are_reaped_after_the_idle_timeout() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(2));
    run(&pool, "select 1").await.expect("query");

    assert_eq!(pool.reap_idle(Instant::now()), 0);
    let later = Instant::now() + pool.settings().idle_timeout() + Duration::from_secs(1);
    assert_eq!(pool.reap_idle(later), 1);
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn namespace_and_row_cap_reach_the_backend() {
    let pool = ConnectionPool::new(FakeConnector::default(), settings(1));

    let result = pool
        .with_connection(|connector, conn| {
            Box::pin(async move { connector.execute(conn, "learner_u7", "rows:250", 100).await })
        })
        .await
        .expect("query");

    assert_eq!(result.row_count, 100);
    assert!(result.truncated);
    let executed = pool.connector().executed.lock().expect("lock").clone();
    assert_eq!(executed, [("learner_u7".to_string(), "rows:250".to_string())]);
}

#[tokio::test]
async fn explicit_discard_frees_the_slot() {
    let pool = Arc::new(ConnectionPool::new(FakeConnector::default(), settings(1)));
    let conn = pool.acquire().await.expect("acquire");
    conn.discard();
    assert_eq!(pool.stats().live, 0);
}
