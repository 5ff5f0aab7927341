use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::Database;
use crate::jobs::{JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC};
use crate::mailboxes::{Mailbox, MailboxError, MailboxRepository};
use crate::queue::{EnqueueOptions, JobCount, JobQueue, QueueError};

/// Mailbox sync state as the ops dashboard sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub mailbox_id: String,
    pub email: String,
    pub sync_status: String,
    pub lag_seconds: Option<i64>,
    pub history_cursor: Option<String>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub consecutive_sync_failures: i64,
    pub paused_until: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub queued_jobs: Vec<JobCountSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobCountSummary {
    pub job_type: String,
    pub status: String,
    pub count: i64,
}

impl From<JobCount> for JobCountSummary {
    fn from(count: JobCount) -> Self {
        Self {
            job_type: count.job_type,
            status: count.status,
            count: count.count,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncControlError {
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Admin operations on the sync controller: manual backfill/history kicks,
/// pause/resume, and the status read model. The self-sustaining cadence is
/// driven by the sync jobs themselves; this surface only nudges it.
#[derive(Clone)]
pub struct SyncController {
    db: Database,
    queue: JobQueue,
}

impl SyncController {
    pub fn new(db: Database, queue: JobQueue) -> Self {
        Self { db, queue }
    }

    pub async fn trigger_backfill(
        &self,
        organization_id: &str,
        mailbox_id: &str,
    ) -> Result<String, SyncControlError> {
        // Verify ownership before touching the queue.
        let mailbox = self.mailbox(organization_id, mailbox_id).await?;
        let payload = serde_json::json!({
            "organization_id": organization_id,
            "mailbox_id": mailbox.id,
        });
        let job_id = self
            .queue
            .enqueue(
                JOB_TYPE_MAILBOX_BACKFILL,
                organization_id,
                payload,
                EnqueueOptions::keyed(format!("manual-backfill:{mailbox_id}")),
            )
            .await?;
        Ok(job_id)
    }

    pub async fn trigger_history_sync(
        &self,
        organization_id: &str,
        mailbox_id: &str,
    ) -> Result<String, SyncControlError> {
        let mailbox = self.mailbox(organization_id, mailbox_id).await?;
        let payload = serde_json::json!({
            "organization_id": organization_id,
            "mailbox_id": mailbox.id,
        });
        let job_id = self
            .queue
            .enqueue(
                JOB_TYPE_MAILBOX_HISTORY_SYNC,
                organization_id,
                payload,
                EnqueueOptions::keyed(format!("manual-history:{mailbox_id}")),
            )
            .await?;
        Ok(job_id)
    }

    pub async fn pause(
        &self,
        organization_id: &str,
        mailbox_id: &str,
        minutes: i64,
        reason: Option<&str>,
    ) -> Result<Mailbox, SyncControlError> {
        let until = Utc::now() + chrono::Duration::minutes(minutes.max(1));
        let mailbox = MailboxRepository::new(self.db.clone())
            .pause(
                organization_id,
                mailbox_id,
                until,
                reason.unwrap_or("manual pause"),
            )
            .await?;
        Ok(mailbox)
    }

    /// Clear the pause window and enqueue exactly one incremental sync to
    /// restart the cadence.
    pub async fn resume(
        &self,
        organization_id: &str,
        mailbox_id: &str,
    ) -> Result<(Mailbox, String), SyncControlError> {
        let mailbox = MailboxRepository::new(self.db.clone())
            .resume(organization_id, mailbox_id)
            .await?;

        let payload = serde_json::json!({
            "organization_id": organization_id,
            "mailbox_id": mailbox.id,
        });
        let job_id = self
            .queue
            .enqueue(
                JOB_TYPE_MAILBOX_HISTORY_SYNC,
                organization_id,
                payload,
                EnqueueOptions::keyed(format!("resume:{mailbox_id}")),
            )
            .await?;
        Ok((mailbox, job_id))
    }

    pub async fn summary(
        &self,
        organization_id: &str,
        mailbox_id: &str,
    ) -> Result<SyncSummary, SyncControlError> {
        let mailbox = self.mailbox(organization_id, mailbox_id).await?;
        let now = Utc::now();
        let counts = self.queue.counts_by_type(organization_id).await?;

        Ok(SyncSummary {
            mailbox_id: mailbox.id.clone(),
            email: mailbox.email.clone(),
            sync_status: if mailbox.is_paused(now) {
                "paused".to_string()
            } else {
                mailbox.sync_status.as_str().to_string()
            },
            lag_seconds: mailbox.sync_lag(now).map(|lag| lag.num_seconds()),
            history_cursor: mailbox.history_cursor.clone(),
            last_full_sync_at: mailbox.last_full_sync_at,
            last_incremental_sync_at: mailbox.last_incremental_sync_at,
            last_sync_error: mailbox.last_sync_error.clone(),
            consecutive_sync_failures: mailbox.consecutive_sync_failures,
            paused_until: mailbox.paused_until,
            pause_reason: mailbox.pause_reason,
            queued_jobs: counts.into_iter().map(JobCountSummary::from).collect(),
        })
    }

    async fn mailbox(
        &self,
        organization_id: &str,
        mailbox_id: &str,
    ) -> Result<Mailbox, SyncControlError> {
        Ok(MailboxRepository::new(self.db.clone())
            .get(organization_id, mailbox_id)
            .await?)
    }
}
