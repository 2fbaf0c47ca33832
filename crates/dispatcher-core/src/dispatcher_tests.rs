//! Scenario tests for the dispatcher loop, grounded in spec §8's concrete
//! scenarios. Uses the in-memory `JobStore` double so these run without a
//! database.

use std::sync::Arc;
use std::time::Duration;

use dispatcher_testing::InMemoryJobStore;

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::job::{JobStatus, JobStore};
use crate::producer::{create_job, CreateOutcome, SkipReason};

fn test_config(api_server_urls: Vec<String>) -> Config {
    Config {
        worker_id: "test-worker".to_string(),
        api_server_urls,
        poll_interval_seconds: 0,
        dispatch_stagger_seconds: 0,
        visibility_timeout_seconds: 1,
        healthcheck_cache_seconds: 3600,
        ..Config::default()
    }
}

#[tokio::test]
async fn scenario_no_healthy_backend_leaves_job_pending() {
    let store = Arc::new(InMemoryJobStore::new());
    store.insert("0064.8000.400948.00-5", None, None).await.unwrap();

    // One configured backend, never marked healthy (no real server to
    // probe), so the registry reports it unhealthy after the single probe
    // attempt and the cycle leaves the job untouched.
    let registry = Arc::new(
        BackendRegistry::new(
            vec!["http://127.0.0.1:9".to_string()],
            "/health".to_string(),
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
        .unwrap(),
    );

    let config = test_config(vec!["http://127.0.0.1:9".to_string()]);
    let dispatcher = Dispatcher::new(store.clone(), registry, config).unwrap();
    dispatcher.tick().await.unwrap();

    let rows = store.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, JobStatus::Pending);
    assert_eq!(rows[0].attempts, 0);
}

#[tokio::test]
async fn scenario_missing_card_is_terminal_error() {
    let store = Arc::new(InMemoryJobStore::new());
    let now = chrono::Utc::now();
    let job = crate::job::Job {
        id: uuid::Uuid::new_v4(),
        job_type: crate::job::JOB_TYPE_SGUCARD.to_string(),
        card_number: None,
        card_alt: None,
        patient_id: None,
        status: JobStatus::Pending,
        attempts: 0,
        last_error: None,
        locked_by: None,
        locked_at: None,
        locked_until: None,
        created_at: now,
        updated_at: now,
    };
    store.seed(job.clone());

    let registry = Arc::new(
        BackendRegistry::new_all_healthy(vec!["http://backend-0".to_string()]).unwrap(),
    );
    let config = test_config(vec!["http://backend-0".to_string()]);
    let dispatcher = Dispatcher::new(store.clone(), registry, config).unwrap();

    dispatcher.dispatch_one(job.clone(), 0, "http://backend-0".to_string()).await;

    let row = store.snapshot().into_iter().find(|j| j.id == job.id).unwrap();
    assert_eq!(row.status, JobStatus::Error);
    assert_eq!(row.last_error.as_deref(), Some("missing card"));
    assert_eq!(row.attempts, 0, "missing-card jobs are never claimed, so attempts stay at 0");
}

#[tokio::test]
async fn scenario_claimed_job_completes_under_consistent_lock_identity() {
    // Regression test for the claim -> dispatch -> worker path: `tick`
    // claims under `worker_id`, and the spawned worker's terminal
    // transition must be guarded by that same identity, not a per-backend
    // label, or it silently no-ops and the job never leaves `processing`.
    let store = Arc::new(InMemoryJobStore::new());
    store.insert("0064.8000.400948.00-5", None, None).await.unwrap();

    let config = test_config(vec!["http://127.0.0.1:9".to_string()]);
    let claimed = store
        .claim(&config.worker_id, 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let job = claimed[0].clone();
    assert_eq!(job.status, JobStatus::Processing);

    let registry = Arc::new(
        BackendRegistry::new_all_healthy(vec!["http://127.0.0.1:9".to_string()]).unwrap(),
    );
    let dispatcher = Dispatcher::new(store.clone(), registry, config).unwrap();

    dispatcher
        .dispatch_one(job.clone(), 0, "http://127.0.0.1:9".to_string())
        .await;

    // run_worker runs in a spawned task; poll until it reaches a terminal
    // state instead of racing it.
    let mut terminal = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let row = store.snapshot().into_iter().find(|j| j.id == job.id);
        if matches!(row.as_ref().map(|j| j.status), Some(JobStatus::Error)) {
            terminal = row;
            break;
        }
    }

    let row = terminal.expect("job should reach `error` once the worker task completes");
    assert_eq!(row.status, JobStatus::Error);
    assert!(row.last_error.as_deref().unwrap_or_default().contains("API call failed"));
}

#[tokio::test]
async fn scenario_lease_expiry_then_purge_reissues_with_incremented_attempts() {
    let store = InMemoryJobStore::new();
    let job = store.insert("0064.8000.400948.00-5", None, None).await.unwrap();

    let claimed = store
        .claim("worker:1", 1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(claimed[0].attempts, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let purged = store.purge_stale().await.unwrap();
    assert_eq!(purged, 1);

    let reclaimed = store
        .claim("worker:1", 1, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, job.id);
    assert_eq!(reclaimed[0].attempts, 2);
}

#[tokio::test]
async fn scenario_producer_dedup_skips_recent_success() {
    let store = InMemoryJobStore::new();
    let job = store.insert("card-recent", None, None).await.unwrap();
    store
        .claim("worker:1", 1, Duration::from_secs(60))
        .await
        .unwrap();
    store.complete(job.id, "worker:1").await.unwrap();

    let config = Config {
        skip_recent_success_hours: 6,
        ..Config::default()
    };

    let outcome = create_job(&store, &config, "card-recent", None, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CreateOutcome::Skipped(SkipReason::RecentSuccess)
    );
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test]
async fn scenario_producer_dedup_skips_active_processing() {
    let store = InMemoryJobStore::new();
    store.insert("card-active", None, None).await.unwrap();
    store
        .claim("worker:1", 1, Duration::from_secs(60))
        .await
        .unwrap();

    let config = Config::default();
    let outcome = create_job(&store, &config, "card-active", None, None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CreateOutcome::Skipped(SkipReason::ProcessingActive)
    );
}

#[tokio::test]
async fn scenario_producer_creates_when_no_dedup_matches() {
    let store = InMemoryJobStore::new();
    let config = Config::default();
    let outcome = create_job(&store, &config, "card-fresh", None, None)
        .await
        .unwrap();
    assert!(matches!(outcome, CreateOutcome::Created(_)));
    assert_eq!(store.snapshot().len(), 1);
}
