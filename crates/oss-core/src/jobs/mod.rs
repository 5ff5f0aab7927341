use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::blob::{BlobError, BlobStore};
use crate::db::Database;
use crate::mailboxes::BreakerConfig;
use crate::mime::Sanitizer;
use crate::provider::{Provider, ProviderError};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};
use crate::worker::{JobError, JobExecutor};
use crate::Job;

mod apply_routing;
mod mailbox_backfill;
mod mailbox_history_sync;
mod occurrence_fetch_raw;
mod occurrence_parse;
mod occurrence_stitch;

use apply_routing::handle_ticket_apply_routing;
use mailbox_backfill::handle_mailbox_backfill;
use mailbox_history_sync::handle_mailbox_history_sync;
use occurrence_fetch_raw::handle_occurrence_fetch_raw;
use occurrence_parse::handle_occurrence_parse;
use occurrence_stitch::handle_occurrence_stitch;

pub use apply_routing::RoutingJobPayload;

pub const JOB_TYPE_MAILBOX_BACKFILL: &str = "mailbox_backfill";
pub const JOB_TYPE_MAILBOX_HISTORY_SYNC: &str = "mailbox_history_sync";
pub const JOB_TYPE_OCCURRENCE_FETCH_RAW: &str = "occurrence_fetch_raw";
pub const JOB_TYPE_OCCURRENCE_PARSE: &str = "occurrence_parse";
pub const JOB_TYPE_OCCURRENCE_STITCH: &str = "occurrence_stitch";
pub const JOB_TYPE_TICKET_APPLY_ROUTING: &str = "ticket_apply_routing";

/// Recovery backfills are keyed so an invalid-cursor storm enqueues exactly
/// one backfill per mailbox sweep.
pub const RECOVERY_IDEMPOTENCY_KEY: &str = "recovery";

/// Everything a job handler needs, wired once at boot.
#[derive(Clone)]
pub struct JobDispatcher {
    pub db: Database,
    pub queue: JobQueue,
    pub blob: Arc<dyn BlobStore>,
    pub provider: Arc<dyn Provider>,
    pub sanitizer: Sanitizer,
    pub breaker: BreakerConfig,
    pub sync_cadence: Duration,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        queue: JobQueue,
        blob: Arc<dyn BlobStore>,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            db,
            queue,
            blob,
            provider,
            sanitizer: Sanitizer::new("allowlist-2025-06"),
            breaker: BreakerConfig::default(),
            sync_cadence: Duration::from_secs(60),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_sync_cadence(mut self, cadence: Duration) -> Self {
        self.sync_cadence = cadence;
        self
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: Job) -> Result<(), JobError> {
        match job.job_type.as_str() {
            JOB_TYPE_MAILBOX_BACKFILL => handle_mailbox_backfill(self, job).await,
            JOB_TYPE_MAILBOX_HISTORY_SYNC => handle_mailbox_history_sync(self, job).await,
            JOB_TYPE_OCCURRENCE_FETCH_RAW => handle_occurrence_fetch_raw(self, job).await,
            JOB_TYPE_OCCURRENCE_PARSE => handle_occurrence_parse(self, job).await,
            JOB_TYPE_OCCURRENCE_STITCH => handle_occurrence_stitch(self, job).await,
            JOB_TYPE_TICKET_APPLY_ROUTING => handle_ticket_apply_routing(self, job).await,
            other => Err(JobError::fatal(format!("unknown job type: {other}"))),
        }
    }
}

/// Stage N+1 is enqueued only after stage N commits; the idempotency key
/// absorbs re-deliveries of stage N itself.
pub(crate) async fn enqueue_stage(
    queue: &JobQueue,
    job_type: &'static str,
    organization_id: &str,
    occurrence_id: &str,
    max_attempts: Option<i64>,
) -> Result<(), JobError> {
    let payload = serde_json::json!({
        "organization_id": organization_id,
        "occurrence_id": occurrence_id,
    });
    let mut options = EnqueueOptions::keyed(format!("{job_type}:{occurrence_id}"));
    options.max_attempts = max_attempts;

    match queue
        .enqueue(job_type, organization_id, payload, options)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) => Err(JobError::retryable(format!(
            "enqueue {job_type} failed: {err}"
        ))),
    }
}

/// Schedule the next incremental sync after a successful one, keyed by the
/// cursor so the still-running job does not dedupe against itself.
pub(crate) async fn enqueue_history_cadence(
    dispatcher: &JobDispatcher,
    organization_id: &str,
    mailbox_id: &str,
    cursor: &str,
) -> Result<(), JobError> {
    let payload = serde_json::json!({
        "organization_id": organization_id,
        "mailbox_id": mailbox_id,
    });
    let run_at = Utc::now() + chrono::Duration::from_std(dispatcher.sync_cadence).unwrap_or_default();
    let options = EnqueueOptions::keyed(format!("cadence:{mailbox_id}:{cursor}")).with_run_at(run_at);

    match dispatcher
        .queue
        .enqueue(JOB_TYPE_MAILBOX_HISTORY_SYNC, organization_id, payload, options)
        .await
    {
        Ok(job_id) => {
            debug!(mailbox_id, job_id, "scheduled next incremental sync");
            Ok(())
        }
        Err(err) => Err(JobError::retryable(format!(
            "enqueue history cadence failed: {err}"
        ))),
    }
}

/// Enqueue the backfill that recovers from an invalid history cursor.
pub(crate) async fn enqueue_recovery_backfill(
    queue: &JobQueue,
    organization_id: &str,
    mailbox_id: &str,
) -> Result<String, QueueError> {
    let payload = serde_json::json!({
        "organization_id": organization_id,
        "mailbox_id": mailbox_id,
    });
    queue
        .enqueue(
            JOB_TYPE_MAILBOX_BACKFILL,
            organization_id,
            payload,
            EnqueueOptions::keyed(RECOVERY_IDEMPOTENCY_KEY),
        )
        .await
}

pub(crate) fn map_provider_error(context: &str, err: ProviderError) -> JobError {
    match err {
        ProviderError::InvalidCursor => {
            // Handled before this mapping in the sync jobs; anywhere else it
            // means a programming error worth surfacing loudly.
            JobError::fatal(format!("{context}: unexpected invalid cursor"))
        }
        ProviderError::Unauthorized => JobError::retryable(format!("{context}: unauthorized")),
        ProviderError::RateLimited => JobError::retryable(format!("{context}: rate limited")),
        ProviderError::NotFound(what) => JobError::fatal(format!("{context}: not found: {what}")),
        ProviderError::Http(err) => JobError::retryable(format!("{context}: network error {err}")),
        ProviderError::Api { status, message } if status >= 500 => {
            JobError::retryable(format!("{context}: server error {status}: {message}"))
        }
        ProviderError::Api { status, message } => {
            JobError::fatal(format!("{context}: api error {status}: {message}"))
        }
        ProviderError::Decode(err) => JobError::fatal(format!("{context}: decode error {err}")),
        ProviderError::MissingCredentials => {
            JobError::fatal(format!("{context}: mailbox has no credentials"))
        }
        ProviderError::Credentials(err) => {
            JobError::fatal(format!("{context}: credential error {err}"))
        }
    }
}

pub(crate) fn map_blob_error(context: &str, err: BlobError) -> JobError {
    match err {
        BlobError::NotFound(hash) => JobError::fatal(format!("{context}: blob missing: {hash}")),
        BlobError::InvalidHash(hash) => JobError::fatal(format!("{context}: bad hash: {hash}")),
        BlobError::Misconfigured(msg) => JobError::fatal(format!("{context}: {msg}")),
        BlobError::Io(err) => JobError::retryable(format!("{context}: io error {err}")),
        BlobError::Backend(err) => JobError::retryable(format!("{context}: backend error {err}")),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use testsupport::harness;

    #[tokio::test]
    async fn unknown_job_type_is_fatal() {
        let h = harness().await;
        let job_id = h
            .dispatcher
            .queue
            .enqueue("no_such_job", &h.org_id, json!({}), Default::default())
            .await
            .expect("enqueue");
        let job = h.dispatcher.queue.fetch_job(&job_id).await.expect("fetch");

        let result = h.dispatcher.execute(job).await;
        match result {
            Err(JobError::Fatal(msg)) => assert!(msg.contains("unknown job type")),
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stage_enqueue_is_idempotent() {
        let h = harness().await;
        enqueue_stage(
            &h.dispatcher.queue,
            JOB_TYPE_OCCURRENCE_PARSE,
            &h.org_id,
            "occ-1",
            Some(1),
        )
        .await
        .expect("first");
        enqueue_stage(
            &h.dispatcher.queue,
            JOB_TYPE_OCCURRENCE_PARSE,
            &h.org_id,
            "occ-1",
            Some(1),
        )
        .await
        .expect("second");

        let counts = h
            .dispatcher
            .queue
            .counts_by_type(&h.org_id)
            .await
            .expect("counts");
        let parse_jobs: i64 = counts
            .iter()
            .filter(|c| c.job_type == JOB_TYPE_OCCURRENCE_PARSE)
            .map(|c| c.count)
            .sum();
        assert_eq!(parse_jobs, 1);
    }
}
