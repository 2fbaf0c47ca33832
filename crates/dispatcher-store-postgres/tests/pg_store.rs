//! Integration tests exercising behavior that only Postgres itself can
//! verify — `FOR UPDATE SKIP LOCKED` exclusivity and advisory lock
//! exclusion. Requires a running database; `sqlx::test` provisions and
//! migrates a scratch database per test from `DATABASE_URL`.

use std::time::Duration;

use dispatcher_core::job::{JobStatus, JobStore};
use dispatcher_core::lock::CoordinatorLock;
use dispatcher_store_postgres::{PgCoordinatorLock, PgJobStore};
use sqlx::PgPool;

#[sqlx::test(migrations = "../../migrations")]
async fn claim_is_exclusive_across_concurrent_callers(pool: PgPool) {
    let store = PgJobStore::new(pool.clone());
    for i in 0..6 {
        store
            .insert(&format!("card-{i}"), None, None)
            .await
            .unwrap();
    }

    let a = store.claim("worker:1", 3, Duration::from_secs(60));
    let b = store.claim("worker:2", 3, Duration::from_secs(60));
    let (claimed_a, claimed_b) = tokio::join!(a, b);
    let claimed_a = claimed_a.unwrap();
    let claimed_b = claimed_b.unwrap();

    assert_eq!(claimed_a.len() + claimed_b.len(), 6);
    let ids_a: std::collections::HashSet<_> = claimed_a.iter().map(|j| j.id).collect();
    let ids_b: std::collections::HashSet<_> = claimed_b.iter().map(|j| j.id).collect();
    assert!(ids_a.is_disjoint(&ids_b), "no job claimed by both callers");
}

#[sqlx::test(migrations = "../../migrations")]
async fn complete_rejects_mismatched_slot(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.insert("card-x", None, None).await.unwrap();
    store
        .claim("worker:1", 1, Duration::from_secs(60))
        .await
        .unwrap();

    let ok = store.complete(job.id, "worker:2").await.unwrap();
    assert!(!ok);

    let rows = store.fetch_by_status(JobStatus::Processing, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn purge_stale_reopens_only_expired_leases(pool: PgPool) {
    let store = PgJobStore::new(pool);
    store.insert("card-fresh", None, None).await.unwrap();
    store.insert("card-expiring", None, None).await.unwrap();

    store
        .claim("worker:1", 1, Duration::from_secs(300))
        .await
        .unwrap();
    store
        .claim("worker:1", 1, Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let purged = store.purge_stale().await.unwrap();
    assert_eq!(purged, 1);

    let pending = store.fetch_by_status(JobStatus::Pending, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let processing = store
        .fetch_by_status(JobStatus::Processing, 10)
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
}

#[sqlx::test(migrations = "../../migrations")]
async fn advisory_lock_excludes_second_holder(pool: PgPool) {
    let conn_a = PgCoordinatorLock::acquire_connection(&pool).await.unwrap();
    let conn_b = PgCoordinatorLock::acquire_connection(&pool).await.unwrap();
    let lock_a = PgCoordinatorLock::new(conn_a);
    let lock_b = PgCoordinatorLock::new(conn_b);

    assert!(lock_a.try_acquire("worker-carteirinhas").await.unwrap());
    assert!(!lock_b.try_acquire("worker-carteirinhas").await.unwrap());

    lock_a.release("worker-carteirinhas").await.unwrap();
    assert!(lock_b.try_acquire("worker-carteirinhas").await.unwrap());
}
