//! Sync controller behavior under failure: invalid-cursor recovery and the
//! per-mailbox circuit breaker, driven through the real queue and worker.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use oss_core::provider::FakeFailure;
use oss_core::worker::PoolConfig;
use oss_core::{
    BreakerConfig, CredentialCrypto, Database, FakeProvider, FsBlobStore, JobDispatcher, JobQueue,
    JobStatus, MailboxCredentials, MailboxRepository, OrgRepository, SyncController, SyncKind,
    WorkerHostConfig, run_migrations, run_worker_host,
};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

struct SyncEnv {
    db: Database,
    queue: JobQueue,
    provider: Arc<FakeProvider>,
    controller: SyncController,
    org_id: String,
    mailbox_id: String,
    _dir: TempDir,
}

async fn setup() -> SyncEnv {
    let dir = TempDir::new().expect("temp dir");
    let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
    let db_path = dir.path().join(db_name);
    let db = Database::new(db_path.as_path()).await.expect("create db");
    run_migrations(&db).await.expect("migrations");

    let org = OrgRepository::new(db.clone())
        .create("Acme", vec!["example.com".into()])
        .await
        .expect("org");

    let crypto = CredentialCrypto::from_base64_key(&STANDARD.encode([33u8; 32])).expect("key");
    let mailbox = MailboxRepository::new(db.clone())
        .create(
            &org.id,
            "journal",
            "fake",
            "journal@example.com",
            Some(&MailboxCredentials {
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            }),
            &crypto,
        )
        .await
        .expect("mailbox");

    let provider = Arc::new(FakeProvider::new());
    let queue = JobQueue::new(db.clone())
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20));
    let controller = SyncController::new(db.clone(), queue.clone());

    SyncEnv {
        db,
        queue,
        provider,
        controller,
        org_id: org.id,
        mailbox_id: mailbox.id,
        _dir: dir,
    }
}

fn dispatcher(env: &SyncEnv, breaker: BreakerConfig) -> JobDispatcher {
    JobDispatcher::new(
        env.db.clone(),
        env.queue.clone(),
        Arc::new(FsBlobStore::new(env._dir.path().join("blobs"))),
        env.provider.clone(),
    )
    .with_breaker(breaker)
}

fn sync_only_host() -> WorkerHostConfig {
    WorkerHostConfig {
        poll_interval: Duration::from_millis(10),
        reap_interval: Duration::from_millis(200),
        drain_timeout: Duration::from_secs(5),
        pools: vec![PoolConfig {
            name: "sync".into(),
            job_types: vec![
                "mailbox_backfill".to_string(),
                "mailbox_history_sync".to_string(),
            ],
            concurrency: 1,
            visibility: Duration::from_secs(30),
        }],
    }
}

async fn seed_cursor(env: &SyncEnv, cursor: &str) {
    MailboxRepository::new(env.db.clone())
        .record_sync_success(&env.org_id, &env.mailbox_id, SyncKind::Incremental, Some(cursor))
        .await
        .expect("seed cursor");
}

#[tokio::test]
async fn invalid_cursor_recovers_through_backfill() {
    let env = setup().await;
    seed_cursor(&env, "99").await;
    env.provider.fail_history(&[FakeFailure::InvalidCursor]);

    let shutdown = CancellationToken::new();
    let host = tokio::spawn(run_worker_host(
        env.queue.clone(),
        Arc::new(dispatcher(&env, BreakerConfig::default())),
        sync_only_host(),
        shutdown.clone(),
    ));

    let sync_job = env
        .controller
        .trigger_history_sync(&env.org_id, &env.mailbox_id)
        .await
        .expect("trigger");

    // Recovery backfill runs and re-pins the cursor.
    let mailboxes = MailboxRepository::new(env.db.clone());
    timeout(Duration::from_secs(5), async {
        loop {
            let mailbox = mailboxes
                .get(&env.org_id, &env.mailbox_id)
                .await
                .expect("mailbox");
            if mailbox.last_full_sync_at.is_some() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backfill recovery completes");

    shutdown.cancel();
    let _ = host.await;

    // The sync job itself completed (invalid cursor is not a job failure).
    let job = env.queue.fetch_job(&sync_job).await.expect("job");
    assert_eq!(job.status, JobStatus::Done);

    let mailbox = mailboxes
        .get(&env.org_id, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert!(
        !mailbox.is_paused(Utc::now()),
        "a single failure must not trip the breaker"
    );
    assert_eq!(
        mailbox.history_cursor.as_deref(),
        Some("0"),
        "cursor re-pinned from the provider profile"
    );

    let events = mailboxes
        .list_events(&env.org_id, &env.mailbox_id, 20)
        .await
        .expect("events");
    assert!(events.iter().any(|e| e.kind == "invalid_cursor_recovery"));
    assert!(events.iter().any(|e| e.kind == "backfill_completed"));

    // The recovery job carried the literal idempotency key.
    let conn = env.db.connection().await.expect("conn");
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM jobs WHERE type = 'mailbox_backfill' AND idempotency_key = 'recovery'",
            (),
        )
        .await
        .expect("query");
    let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn breaker_trips_after_five_failures_and_resume_restarts_cadence() {
    let env = setup().await;
    seed_cursor(&env, "0").await;

    // One sync job retried to exhaustion: every attempt fails, each counts
    // toward the breaker, the fifth trips it.
    env.provider.fail_history(&[FakeFailure::RateLimited; 5]);

    let shutdown = CancellationToken::new();
    let host = tokio::spawn(run_worker_host(
        env.queue.clone(),
        Arc::new(dispatcher(
            &env,
            BreakerConfig {
                threshold: 5,
                pause: Duration::from_secs(1800),
            },
        )),
        sync_only_host(),
        shutdown.clone(),
    ));

    let sync_job = env
        .controller
        .trigger_history_sync(&env.org_id, &env.mailbox_id)
        .await
        .expect("trigger");

    let mailboxes = MailboxRepository::new(env.db.clone());
    timeout(Duration::from_secs(10), async {
        loop {
            let mailbox = mailboxes
                .get(&env.org_id, &env.mailbox_id)
                .await
                .expect("mailbox");
            if mailbox.is_paused(Utc::now()) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("breaker should trip");

    // The retry budget is spent in lockstep with the breaker threshold.
    timeout(Duration::from_secs(5), async {
        loop {
            let job = env.queue.fetch_job(&sync_job).await.expect("job");
            if job.status == JobStatus::Dead {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sync job exhausts retries");

    let paused = mailboxes
        .get(&env.org_id, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert_eq!(paused.consecutive_sync_failures, 5);
    assert_eq!(
        paused.pause_reason.as_deref(),
        Some("auto: repeated sync failures")
    );

    let summary = env
        .controller
        .summary(&env.org_id, &env.mailbox_id)
        .await
        .expect("summary");
    assert_eq!(summary.sync_status, "paused");

    // A sync against the paused mailbox returns without a provider call.
    let calls_before = env.provider.history_calls();
    let paused_job = env
        .controller
        .trigger_history_sync(&env.org_id, &env.mailbox_id)
        .await
        .expect("trigger while paused");
    timeout(Duration::from_secs(5), async {
        loop {
            let job = env.queue.fetch_job(&paused_job).await.expect("job");
            if job.status == JobStatus::Done {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("paused sync completes as a no-op");
    assert_eq!(env.provider.history_calls(), calls_before);

    // Resume clears the pause and enqueues exactly one history sync, which
    // now succeeds against the healthy provider.
    let (_, resume_job) = env
        .controller
        .resume(&env.org_id, &env.mailbox_id)
        .await
        .expect("resume");
    timeout(Duration::from_secs(5), async {
        loop {
            let job = env.queue.fetch_job(&resume_job).await.expect("job");
            if job.status == JobStatus::Done {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("post-resume sync completes");

    shutdown.cancel();
    let _ = host.await;

    let recovered = mailboxes
        .get(&env.org_id, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert!(!recovered.is_paused(Utc::now()));
    assert_eq!(recovered.consecutive_sync_failures, 0);
    assert!(recovered.last_sync_error.is_none());
}

#[tokio::test]
async fn replayed_dead_sync_job_succeeds_once_cause_is_removed() {
    let env = setup().await;
    seed_cursor(&env, "0").await;
    // Exactly the retry budget, so the job dies with the cause spent.
    env.provider.fail_history(&[FakeFailure::RateLimited; 5]);

    let shutdown = CancellationToken::new();
    let host = tokio::spawn(run_worker_host(
        env.queue.clone(),
        Arc::new(dispatcher(&env, BreakerConfig::default())),
        sync_only_host(),
        shutdown.clone(),
    ));

    let sync_job = env
        .controller
        .trigger_history_sync(&env.org_id, &env.mailbox_id)
        .await
        .expect("trigger");

    timeout(Duration::from_secs(10), async {
        loop {
            let job = env.queue.fetch_job(&sync_job).await.expect("job");
            if job.status == JobStatus::Dead {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job dies");

    // The failure cause is spent; clear the breaker pause, then replay.
    MailboxRepository::new(env.db.clone())
        .resume(&env.org_id, &env.mailbox_id)
        .await
        .expect("clear pause");
    let replayed = env.queue.replay(&sync_job).await.expect("replay");
    assert_eq!(replayed.attempts, 0);

    timeout(Duration::from_secs(5), async {
        loop {
            let job = env.queue.fetch_job(&sync_job).await.expect("job");
            if job.status == JobStatus::Done {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("replayed job completes");

    shutdown.cancel();
    let _ = host.await;
}
