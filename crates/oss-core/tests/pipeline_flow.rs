//! End-to-end pipeline runs: fake provider -> sync -> fetch -> parse ->
//! stitch -> route, driven by the real worker host against a temp database.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oss_core::{
    CanonicalRepository, CredentialCrypto, Database, FakeProvider, FsBlobStore, JobDispatcher,
    JobQueue, MailboxCredentials, MailboxRepository, OccurrenceRepository, OccurrenceState,
    OrgRepository, RoutingRepository, SyncController, TicketRepository, TicketStatus,
    WorkerHostConfig, run_migrations, run_worker_host,
};
use oss_core::worker::PoolConfig;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

struct PipelineEnv {
    db: Database,
    queue: JobQueue,
    provider: Arc<FakeProvider>,
    controller: SyncController,
    org_id: String,
    _dir: TempDir,
}

async fn setup() -> PipelineEnv {
    let dir = TempDir::new().expect("temp dir");
    let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
    let db_path = dir.path().join(db_name);
    let db = Database::new(db_path.as_path()).await.expect("create db");
    run_migrations(&db).await.expect("migrations");

    let org = OrgRepository::new(db.clone())
        .create("Acme", vec!["example.com".into()])
        .await
        .expect("org");
    RoutingRepository::new(db.clone())
        .add_allowlist_entry(&org.id, "*@example.com", true)
        .await
        .expect("allowlist");

    let provider = Arc::new(FakeProvider::new());
    let queue = JobQueue::new(db.clone())
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50));
    let controller = SyncController::new(db.clone(), queue.clone());

    PipelineEnv {
        db,
        queue,
        provider,
        controller,
        org_id: org.id,
        _dir: dir,
    }
}

fn crypto() -> CredentialCrypto {
    CredentialCrypto::from_base64_key(&STANDARD.encode([21u8; 32])).expect("key")
}

async fn create_mailbox(env: &PipelineEnv, purpose: &str, email: &str) -> String {
    MailboxRepository::new(env.db.clone())
        .create(
            &env.org_id,
            purpose,
            "fake",
            email,
            Some(&MailboxCredentials {
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                client_id: "client".into(),
                client_secret: "secret".into(),
            }),
            &crypto(),
        )
        .await
        .expect("mailbox")
        .id
}

fn dispatcher(env: &PipelineEnv) -> JobDispatcher {
    JobDispatcher::new(
        env.db.clone(),
        env.queue.clone(),
        Arc::new(FsBlobStore::new(env._dir.path().join("blobs"))),
        env.provider.clone(),
    )
    .with_sync_cadence(Duration::from_secs(60))
}

fn fast_host_config() -> WorkerHostConfig {
    let pool = |name: &str, types: &[&str], concurrency: usize| PoolConfig {
        name: name.to_string(),
        job_types: types.iter().map(|t| t.to_string()).collect(),
        concurrency,
        visibility: Duration::from_secs(30),
    };
    WorkerHostConfig {
        poll_interval: Duration::from_millis(10),
        reap_interval: Duration::from_millis(200),
        drain_timeout: Duration::from_secs(5),
        pools: vec![
            pool("sync", &["mailbox_backfill", "mailbox_history_sync"], 2),
            pool("fetch", &["occurrence_fetch_raw"], 4),
            pool("parse", &["occurrence_parse"], 4),
            pool("stitch", &["occurrence_stitch"], 2),
            pool("route", &["ticket_apply_routing"], 2),
        ],
    }
}

async fn wait_for_routed(env: &PipelineEnv, mailbox_id: &str, provider_id: &str) -> String {
    let occurrences = OccurrenceRepository::new(env.db.clone());
    timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(occurrence) = occurrences
                .get_by_provider_id(&env.org_id, mailbox_id, provider_id)
                .await
            {
                if occurrence.state == OccurrenceState::Routed {
                    return occurrence.id;
                }
                if occurrence.state == OccurrenceState::Failed {
                    panic!(
                        "occurrence failed: fetch={:?} parse={:?} stitch={:?} route={:?}",
                        occurrence.fetch_error,
                        occurrence.parse_error,
                        occurrence.stitch_error,
                        occurrence.route_error
                    );
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("occurrence should reach routed state")
}

fn duplicate_email(message_id: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@customer.example>\r\n\
         To: Support <support@example.com>\r\n\
         Subject: Printer broken\r\n\
         Date: Mon, 2 Jun 2025 10:20:30 +0000\r\n\
         Message-ID: <{message_id}>\r\n\
         X-Gm-Original-To: support@example.com\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         The printer on floor 3 is broken.\r\n"
    )
    .into_bytes()
}

#[tokio::test]
async fn duplicate_delivery_across_mailboxes_yields_one_ticket() {
    let env = setup().await;
    let mailbox_a = create_mailbox(&env, "journal", "journal@example.com").await;
    let mailbox_b = create_mailbox(&env, "archive", "archive@example.com").await;

    // The same logical email lands in both mailboxes; Workspace rewrote the
    // Message-ID on one of the paths.
    env.provider
        .deliver("journal@example.com", "msg-a", &duplicate_email("orig@customer.example"));
    env.provider
        .deliver("archive@example.com", "msg-b", &duplicate_email("rewritten@gmail-journal"));

    let shutdown = CancellationToken::new();
    let host = tokio::spawn(run_worker_host(
        env.queue.clone(),
        Arc::new(dispatcher(&env)),
        fast_host_config(),
        shutdown.clone(),
    ));

    env.controller
        .trigger_backfill(&env.org_id, &mailbox_a)
        .await
        .expect("backfill a");
    env.controller
        .trigger_backfill(&env.org_id, &mailbox_b)
        .await
        .expect("backfill b");

    let occ_a = wait_for_routed(&env, &mailbox_a, "msg-a").await;
    let occ_b = wait_for_routed(&env, &mailbox_b, "msg-b").await;

    shutdown.cancel();
    let _ = host.await;

    let occurrences = OccurrenceRepository::new(env.db.clone());
    let a = occurrences.get(&env.org_id, &occ_a).await.expect("a");
    let b = occurrences.get(&env.org_id, &occ_b).await.expect("b");

    // Two occurrences, one canonical message.
    let canonical_id = a.canonical_message_id.clone().expect("canonical");
    assert_eq!(a.canonical_message_id, b.canonical_message_id);
    assert_eq!(
        occurrences
            .count_by_canonical(&env.org_id, &canonical_id)
            .await
            .expect("count"),
        2
    );

    // One ticket, in state new.
    let canonical = CanonicalRepository::new(env.db.clone())
        .get(&env.org_id, &canonical_id)
        .await
        .expect("canonical");
    let ticket = TicketRepository::new(env.db.clone())
        .get(&env.org_id, canonical.ticket_id.as_deref().expect("ticket link"))
        .await
        .expect("ticket");
    assert_eq!(ticket.status, TicketStatus::New);

    let conn = env.db.connection().await.expect("conn");
    let mut rows = conn
        .query("SELECT COUNT(*) FROM tickets", ())
        .await
        .expect("query");
    let tickets: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
    assert_eq!(tickets, 1);
    let mut rows = conn
        .query("SELECT COUNT(*) FROM canonical_messages", ())
        .await
        .expect("query");
    let canonicals: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
    assert_eq!(canonicals, 1);
}

#[tokio::test]
async fn unknown_recipient_is_routed_to_spam_end_to_end() {
    let env = setup().await;
    let mailbox = create_mailbox(&env, "journal", "journal@example.com").await;

    // No recipient evidence anywhere and a sender outside the org.
    let raw = concat!(
        "From: stranger@elsewhere.example\r\n",
        "Subject: hello?\r\n",
        "Date: Mon, 2 Jun 2025 10:00:00 +0000\r\n",
        "Message-ID: <mystery@elsewhere.example>\r\n",
        "\r\n",
        "no recipient headers at all\r\n",
    );
    env.provider.deliver("journal@example.com", "msg-1", raw.as_bytes());

    let shutdown = CancellationToken::new();
    let host = tokio::spawn(run_worker_host(
        env.queue.clone(),
        Arc::new(dispatcher(&env)),
        fast_host_config(),
        shutdown.clone(),
    ));

    env.controller
        .trigger_backfill(&env.org_id, &mailbox)
        .await
        .expect("backfill");
    let occ = wait_for_routed(&env, &mailbox, "msg-1").await;

    shutdown.cancel();
    let _ = host.await;

    let occurrences = OccurrenceRepository::new(env.db.clone());
    let occurrence = occurrences.get(&env.org_id, &occ).await.expect("occurrence");
    let canonical = CanonicalRepository::new(env.db.clone())
        .get(
            &env.org_id,
            occurrence.canonical_message_id.as_deref().unwrap(),
        )
        .await
        .expect("canonical");

    let tickets = TicketRepository::new(env.db.clone());
    let ticket = tickets
        .get(&env.org_id, canonical.ticket_id.as_deref().expect("ticket"))
        .await
        .expect("ticket");
    assert_eq!(ticket.status, TicketStatus::Spam);

    let events = tickets
        .list_events(&env.org_id, &ticket.id)
        .await
        .expect("events");
    assert!(events.iter().any(|e| e.kind == "auto_spam"));
}

#[tokio::test]
async fn incremental_sync_keeps_cadence_and_ingests_new_mail() {
    let env = setup().await;
    let mailbox = create_mailbox(&env, "journal", "journal@example.com").await;

    let shutdown = CancellationToken::new();
    let host = tokio::spawn(run_worker_host(
        env.queue.clone(),
        Arc::new(dispatcher(&env)),
        fast_host_config(),
        shutdown.clone(),
    ));

    // Backfill pins the cursor on an empty mailbox.
    env.controller
        .trigger_backfill(&env.org_id, &mailbox)
        .await
        .expect("backfill");
    timeout(Duration::from_secs(5), async {
        loop {
            let summary = env
                .controller
                .summary(&env.org_id, &mailbox)
                .await
                .expect("summary");
            if summary.last_full_sync_at.is_some() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backfill completes");

    // New mail arrives; a manual incremental sync picks it up.
    env.provider.deliver(
        "journal@example.com",
        "late-1",
        &duplicate_email("late@customer.example"),
    );
    env.controller
        .trigger_history_sync(&env.org_id, &mailbox)
        .await
        .expect("history sync");

    wait_for_routed(&env, &mailbox, "late-1").await;

    // The completed syncs scheduled their successors.
    let summary = env
        .controller
        .summary(&env.org_id, &mailbox)
        .await
        .expect("summary");
    assert!(summary.lag_seconds.is_some());
    assert!(
        summary
            .queued_jobs
            .iter()
            .any(|c| c.job_type == "mailbox_history_sync"),
        "cadence job stays queued"
    );

    shutdown.cancel();
    let _ = host.await;
}
