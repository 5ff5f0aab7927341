use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    Database, DbError, is_unique_violation, now_rfc3339, parse_timestamp, require_timestamp,
    to_rfc3339,
};

const JOB_COLUMNS: &str = "id, organization_id, type, payload_json, status, attempts, max_attempts, run_at, idempotency_key, lock_owner, lock_expires_at, last_error, created_at, updated_at, finished_at";

pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    /// Present in stored data for forward compatibility; the queue itself
    /// only ever transitions to `queued` or `dead` on failure.
    Failed,
    Dead,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Done => "done",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "failed" => Some(JobStatus::Failed),
            "dead" => Some(JobStatus::Dead),
            "done" => Some(JobStatus::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub organization_id: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub run_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i64>,
    pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..Self::default()
        }
    }

    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCount {
    pub job_type: String,
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("payload json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job is not running: {0}")]
    NotRunning(String),
    #[error("job {0} is not dead and cannot be replayed")]
    NotDead(String),
    #[error("invalid job status value {0}")]
    InvalidStatus(String),
    #[error("idempotent enqueue did not converge for key {0}")]
    EnqueueRace(String),
}

/// Durable, poll-based, at-least-once work queue on the relational store.
/// Leases carry a visibility timeout; the reaper requeues anything whose
/// lease lapsed so crashed workers cannot leak jobs.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Insert a job, or return the id of an existing non-terminal job with
    /// the same `(organization, type, idempotency_key)`.
    pub async fn enqueue(
        &self,
        job_type: &str,
        organization_id: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let payload_json = serde_json::to_string(&payload)?;
        let run_at = to_rfc3339(options.run_at.unwrap_or_else(Utc::now));
        let max_attempts = options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let conn = self.db.connection().await?;

        // Two rounds: insert, or read the holder of the partial unique index.
        // A second insert attempt covers the holder finishing in between.
        for _ in 0..2 {
            let id = Uuid::new_v4().to_string();
            let now = now_rfc3339();
            let result = conn
                .execute(
                    "INSERT INTO jobs (id, organization_id, type, payload_json, status, attempts, max_attempts, run_at, idempotency_key, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        id.clone(),
                        organization_id,
                        job_type,
                        payload_json.clone(),
                        max_attempts,
                        run_at.clone(),
                        options.idempotency_key.clone(),
                        now
                    ],
                )
                .await;

            match result {
                Ok(_) => return Ok(id),
                Err(err)
                    if is_unique_violation(&err) && options.idempotency_key.is_some() =>
                {
                    let key = options.idempotency_key.as_deref().unwrap_or_default();
                    let mut rows = conn
                        .query(
                            "SELECT id FROM jobs
                             WHERE organization_id = ?1 AND type = ?2 AND idempotency_key = ?3
                               AND status IN ('queued', 'running')
                             LIMIT 1",
                            params![organization_id, job_type, key],
                        )
                        .await?;
                    match rows.next().await? {
                        Some(row) => {
                            let existing: String = row.get(0)?;
                            return Ok(existing);
                        }
                        None => continue,
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(QueueError::EnqueueRace(
            options.idempotency_key.unwrap_or_default(),
        ))
    }

    /// Claim the oldest eligible queued job of the given types. The claim is
    /// one atomic UPDATE, so concurrent workers can never double-lease.
    pub async fn lease(
        &self,
        types: &[&str],
        worker_id: &str,
        visibility: Duration,
    ) -> Result<Option<Job>, QueueError> {
        if types.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(visibility).unwrap_or_default();
        let n = types.len();

        let type_placeholders = (1..=n)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE jobs
             SET status = 'running', lock_owner = ?{w}, lock_expires_at = ?{e}, updated_at = ?{u}
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'queued' AND run_at <= ?{r} AND type IN ({type_placeholders})
                 ORDER BY run_at, created_at
                 LIMIT 1
             )
             RETURNING {JOB_COLUMNS}",
            w = n + 1,
            e = n + 2,
            u = n + 3,
            r = n + 4,
        );

        let mut values: Vec<libsql::Value> = types.iter().map(|t| (*t).into()).collect();
        values.push(worker_id.into());
        values.push(to_rfc3339(expires).into());
        values.push(now_rfc3339().into());
        values.push(to_rfc3339(now).into());

        let conn = self.db.connection().await?;
        let mut rows = conn.query(&sql, values).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET status = 'done', lock_owner = NULL, lock_expires_at = NULL,
                     finished_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'running'
                 RETURNING id",
                params![job_id, now],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    /// Record a failure: requeue with full-jitter exponential backoff while
    /// attempts remain, otherwise move to the dead-letter state.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let job = self.fetch_job(job_id).await?;
        let attempts = job.attempts + 1;
        let now = now_rfc3339();

        let (status, run_at, finished_at) = if attempts < job.max_attempts {
            let delay = self.backoff_with_jitter(attempts);
            let scheduled = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            (JobStatus::Queued, Some(to_rfc3339(scheduled)), None)
        } else {
            (JobStatus::Dead, None, Some(now.clone()))
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET status = ?2, attempts = ?3,
                     run_at = COALESCE(?4, run_at),
                     lock_owner = NULL, lock_expires_at = NULL,
                     last_error = ?5, finished_at = ?6, updated_at = ?7
                 WHERE id = ?1 AND status = 'running'
                 RETURNING id",
                params![
                    job_id,
                    status.as_str(),
                    attempts,
                    run_at,
                    error,
                    finished_at,
                    now
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    /// Send a running job straight to the dead-letter state: deterministic
    /// failures (undecodable payload, unknown type) gain nothing from the
    /// retry budget. Attempts are topped up so `dead` always implies
    /// `attempts >= max_attempts`.
    pub async fn mark_dead(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET status = 'dead', attempts = MAX(attempts + 1, max_attempts),
                     lock_owner = NULL, lock_expires_at = NULL,
                     last_error = ?2, finished_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'
                 RETURNING id",
                params![job_id, error, now],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    /// Requeue every running job whose lease has lapsed, as if it had
    /// failed with "lease expired". Returns the ids that were reaped.
    pub async fn reap_expired(&self) -> Result<Vec<String>, QueueError> {
        let now = to_rfc3339(Utc::now());
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM jobs
                 WHERE status = 'running' AND lock_expires_at IS NOT NULL AND lock_expires_at < ?1",
                params![now],
            )
            .await?;

        let mut expired = Vec::new();
        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            expired.push(id);
        }

        for id in &expired {
            match self.fail(id, "lease expired").await {
                Ok(()) | Err(QueueError::NotRunning(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(expired)
    }

    /// Admin-only: put a dead job back on the queue with a fresh attempt
    /// budget. Payload is preserved; the old error stays visible.
    pub async fn replay(&self, job_id: &str) -> Result<Job, QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE jobs
                     SET status = 'queued', attempts = 0, run_at = ?2,
                         lock_owner = NULL, lock_expires_at = NULL,
                         finished_at = NULL, updated_at = ?2
                     WHERE id = ?1 AND status = 'dead'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![job_id, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => {
                // Distinguish "missing" from "not dead".
                self.fetch_job(job_id).await?;
                Err(QueueError::NotDead(job_id.to_string()))
            }
        }
    }

    pub async fn list_dead(
        &self,
        organization_id: &str,
        limit: i64,
    ) -> Result<Vec<Job>, QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE organization_id = ?1 AND status = 'dead'
                     ORDER BY finished_at DESC
                     LIMIT ?2"
                ),
                params![organization_id, limit],
            )
            .await?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(row)?);
        }
        Ok(jobs)
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Job, QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }

    /// Per-type/status counts for the ops sync summary.
    pub async fn counts_by_type(
        &self,
        organization_id: &str,
    ) -> Result<Vec<JobCount>, QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT type, status, COUNT(*) FROM jobs
                 WHERE organization_id = ?1 AND status IN ('queued', 'running')
                 GROUP BY type, status
                 ORDER BY type, status",
                params![organization_id],
            )
            .await?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await? {
            counts.push(JobCount {
                job_type: row.get(0)?,
                status: row.get(1)?,
                count: row.get(2)?,
            });
        }
        Ok(counts)
    }

    async fn resolve_missing_state(&self, job_id: &str) -> Result<(), QueueError> {
        match self.fetch_job(job_id).await {
            Ok(_) => Err(QueueError::NotRunning(job_id.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Full jitter: uniform over (0, min(cap, base * 2^(attempt-1))].
    fn backoff_with_jitter(&self, attempt: i64) -> Duration {
        let exp = attempt.clamp(1, 20) as u32 - 1;
        let ceiling = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.backoff_cap);
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(0.0..=1.0) * ceiling.as_secs_f64())
    }
}

fn row_to_job(row: Row) -> Result<Job, QueueError> {
    let payload_json: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let run_at: String = row.get(7)?;
    let lock_expires_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let finished_at: Option<String> = row.get(14)?;

    let status =
        JobStatus::from_str(&status_str).ok_or(QueueError::InvalidStatus(status_str))?;

    Ok(Job {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        job_type: row.get(2)?,
        payload: serde_json::from_str(&payload_json)?,
        status,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        run_at: require_timestamp(run_at)?,
        idempotency_key: row.get(8)?,
        lock_owner: row.get(9)?,
        lock_expires_at: parse_timestamp(lock_expires_at)?,
        last_error: row.get(11)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
        finished_at: parse_timestamp(finished_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::task;

    const VISIBILITY: Duration = Duration::from_secs(60);

    async fn setup_queue() -> (JobQueue, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", uuid::Uuid::new_v4());
        let db_path = dir.path().join(db_name);
        let db = Database::new(db_path.as_path()).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (JobQueue::new(db), dir)
    }

    #[tokio::test]
    async fn enqueue_and_lease_returns_running_job() {
        let (queue, _dir) = setup_queue().await;
        let id = queue
            .enqueue(
                "occurrence_parse",
                "org1",
                json!({"occurrence_id": "o1"}),
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");

        let leased = queue
            .lease(&["occurrence_parse"], "worker-1", VISIBILITY)
            .await
            .expect("lease")
            .expect("job");
        assert_eq!(leased.id, id);
        assert_eq!(leased.status, JobStatus::Running);
        assert_eq!(leased.lock_owner.as_deref(), Some("worker-1"));
        assert!(leased.lock_expires_at.expect("lock expiry") > Utc::now());
        assert_eq!(leased.payload["occurrence_id"], "o1");
    }

    #[tokio::test]
    async fn lease_filters_by_type_and_run_at() {
        let (queue, _dir) = setup_queue().await;
        queue
            .enqueue(
                "mailbox_history_sync",
                "org1",
                json!({}),
                EnqueueOptions::at(Utc::now() + chrono::Duration::minutes(5)),
            )
            .await
            .expect("future job");
        queue
            .enqueue("occurrence_parse", "org1", json!({}), EnqueueOptions::default())
            .await
            .expect("other-type job");

        assert!(
            queue
                .lease(&["mailbox_history_sync"], "w", VISIBILITY)
                .await
                .expect("lease")
                .is_none(),
            "future run_at must not lease"
        );
        assert!(
            queue
                .lease(&["mailbox_backfill"], "w", VISIBILITY)
                .await
                .expect("lease")
                .is_none(),
            "unrequested types must not lease"
        );
        assert!(
            queue
                .lease(&["occurrence_parse", "occurrence_stitch"], "w", VISIBILITY)
                .await
                .expect("lease")
                .is_some()
        );
    }

    #[tokio::test]
    async fn idempotent_enqueue_returns_existing_id() {
        let (queue, _dir) = setup_queue().await;
        let first = queue
            .enqueue(
                "occurrence_fetch_raw",
                "org1",
                json!({"occurrence_id": "o1"}),
                EnqueueOptions::keyed("occurrence_fetch_raw:o1"),
            )
            .await
            .expect("first");
        let second = queue
            .enqueue(
                "occurrence_fetch_raw",
                "org1",
                json!({"occurrence_id": "o1"}),
                EnqueueOptions::keyed("occurrence_fetch_raw:o1"),
            )
            .await
            .expect("second");
        assert_eq!(first, second, "duplicate enqueue returns the existing id");

        // Same key in another org is a separate job.
        let other_org = queue
            .enqueue(
                "occurrence_fetch_raw",
                "org2",
                json!({}),
                EnqueueOptions::keyed("occurrence_fetch_raw:o1"),
            )
            .await
            .expect("other org");
        assert_ne!(first, other_org);
    }

    #[tokio::test]
    async fn idempotency_window_closes_when_job_finishes() {
        let (queue, _dir) = setup_queue().await;
        let first = queue
            .enqueue(
                "mailbox_backfill",
                "org1",
                json!({}),
                EnqueueOptions::keyed("recovery"),
            )
            .await
            .expect("first");

        let job = queue
            .lease(&["mailbox_backfill"], "w", VISIBILITY)
            .await
            .expect("lease")
            .expect("job");
        queue.complete(&job.id).await.expect("complete");

        let second = queue
            .enqueue(
                "mailbox_backfill",
                "org1",
                json!({}),
                EnqueueOptions::keyed("recovery"),
            )
            .await
            .expect("second");
        assert_ne!(first, second, "terminal jobs free the idempotency key");
    }

    #[tokio::test]
    async fn fail_requeues_with_backoff_until_dead() {
        let (queue, _dir) = setup_queue().await;
        let id = queue
            .enqueue(
                "occurrence_stitch",
                "org1",
                json!({}),
                EnqueueOptions::default().with_max_attempts(2),
            )
            .await
            .expect("enqueue");

        let job = queue
            .lease(&["occurrence_stitch"], "w", VISIBILITY)
            .await
            .expect("lease")
            .expect("job");
        queue.fail(&job.id, "provider 500").await.expect("fail");

        let requeued = queue.fetch_job(&id).await.expect("fetch");
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.lock_owner.is_none());
        assert_eq!(requeued.last_error.as_deref(), Some("provider 500"));
        let delay = requeued.run_at - Utc::now();
        assert!(
            delay <= chrono::Duration::minutes(15),
            "backoff stays under the cap, got {delay}"
        );

        // Exhaust the budget: next failure goes to the DLQ.
        let conn = queue.db.connection().await.expect("conn");
        conn.execute(
            "UPDATE jobs SET run_at = ?2 WHERE id = ?1",
            params![id.as_str(), to_rfc3339(Utc::now())],
        )
        .await
        .expect("make eligible");

        let job = queue
            .lease(&["occurrence_stitch"], "w", VISIBILITY)
            .await
            .expect("lease")
            .expect("job");
        queue.fail(&job.id, "provider 500 again").await.expect("fail");

        let dead = queue.fetch_job(&id).await.expect("fetch");
        assert_eq!(dead.status, JobStatus::Dead);
        assert!(dead.attempts >= dead.max_attempts, "dead implies attempts >= max");
        assert!(dead.finished_at.is_some());
    }

    #[tokio::test]
    async fn reaper_requeues_expired_leases() {
        let (queue, _dir) = setup_queue().await;
        let id = queue
            .enqueue("occurrence_parse", "org1", json!({}), EnqueueOptions::default())
            .await
            .expect("enqueue");
        queue
            .lease(&["occurrence_parse"], "w", Duration::from_secs(60))
            .await
            .expect("lease")
            .expect("job");

        // Nothing expired yet.
        assert!(queue.reap_expired().await.expect("reap").is_empty());

        let conn = queue.db.connection().await.expect("conn");
        conn.execute(
            "UPDATE jobs SET lock_expires_at = ?2 WHERE id = ?1",
            params![
                id.as_str(),
                to_rfc3339(Utc::now() - chrono::Duration::seconds(5))
            ],
        )
        .await
        .expect("expire lease");

        let reaped = queue.reap_expired().await.expect("reap");
        assert_eq!(reaped, vec![id.clone()]);

        let job = queue.fetch_job(&id).await.expect("fetch");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn replay_requires_dead_status_and_resets_attempts() {
        let (queue, _dir) = setup_queue().await;
        let id = queue
            .enqueue(
                "occurrence_parse",
                "org1",
                json!({"keep": "payload"}),
                EnqueueOptions::default().with_max_attempts(1),
            )
            .await
            .expect("enqueue");

        let err = queue.replay(&id).await.expect_err("queued job");
        assert!(matches!(err, QueueError::NotDead(_)));

        let job = queue
            .lease(&["occurrence_parse"], "w", VISIBILITY)
            .await
            .expect("lease")
            .expect("job");
        queue.fail(&job.id, "boom").await.expect("fail to dead");
        assert_eq!(
            queue.fetch_job(&id).await.expect("fetch").status,
            JobStatus::Dead
        );

        let replayed = queue.replay(&id).await.expect("replay");
        assert_eq!(replayed.status, JobStatus::Queued);
        assert_eq!(replayed.attempts, 0);
        assert_eq!(replayed.payload["keep"], "payload");
        assert!(replayed.run_at <= Utc::now() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn list_dead_is_org_scoped() {
        let (queue, _dir) = setup_queue().await;
        for org in ["org1", "org2"] {
            let id = queue
                .enqueue(
                    "occurrence_parse",
                    org,
                    json!({}),
                    EnqueueOptions::default().with_max_attempts(1),
                )
                .await
                .expect("enqueue");
            let job = queue
                .lease(&["occurrence_parse"], "w", VISIBILITY)
                .await
                .expect("lease")
                .expect("job");
            assert_eq!(job.id, id);
            queue.fail(&job.id, "boom").await.expect("fail");
        }

        let dead = queue.list_dead("org1", 10).await.expect("list");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].organization_id, "org1");
        assert!(queue.list_dead("org3", 10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn concurrent_lease_allows_single_winner() {
        let (queue, _dir) = setup_queue().await;
        queue
            .enqueue("occurrence_parse", "org1", json!({}), EnqueueOptions::default())
            .await
            .expect("enqueue");

        let queue_a = queue.clone();
        let queue_b = queue.clone();
        let t1 = task::spawn(async move {
            queue_a
                .lease(&["occurrence_parse"], "a", VISIBILITY)
                .await
                .unwrap()
        });
        let t2 = task::spawn(async move {
            queue_b
                .lease(&["occurrence_parse"], "b", VISIBILITY)
                .await
                .unwrap()
        });

        let r1 = t1.await.expect("task 1");
        let r2 = t2.await.expect("task 2");
        let taken = r1.is_some() as i32 + r2.is_some() as i32;
        assert_eq!(taken, 1, "only one lease should succeed");
    }

    #[tokio::test]
    async fn counts_by_type_reports_active_jobs() {
        let (queue, _dir) = setup_queue().await;
        for _ in 0..3 {
            queue
                .enqueue("occurrence_parse", "org1", json!({}), EnqueueOptions::default())
                .await
                .expect("enqueue");
        }
        queue
            .lease(&["occurrence_parse"], "w", VISIBILITY)
            .await
            .expect("lease")
            .expect("job");

        let counts = queue.counts_by_type("org1").await.expect("counts");
        let queued = counts
            .iter()
            .find(|c| c.job_type == "occurrence_parse" && c.status == "queued")
            .expect("queued bucket");
        assert_eq!(queued.count, 2);
        let running = counts
            .iter()
            .find(|c| c.job_type == "occurrence_parse" && c.status == "running")
            .expect("running bucket");
        assert_eq!(running.count, 1);
    }
}
