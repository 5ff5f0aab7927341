use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::config::WorkerSettings;
use crate::jobs::{
    JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC, JOB_TYPE_OCCURRENCE_FETCH_RAW,
    JOB_TYPE_OCCURRENCE_PARSE, JOB_TYPE_OCCURRENCE_STITCH, JOB_TYPE_TICKET_APPLY_ROUTING,
};
use crate::queue::{Job, JobQueue, QueueError};

/// One leased slot group: which job types it drains, how many workers it
/// runs, and the visibility timeout its leases carry.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub job_types: Vec<String>,
    pub concurrency: usize,
    pub visibility: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerHostConfig {
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    /// Maximum time to wait for in-flight jobs during graceful shutdown;
    /// afterwards leases are left to expire and be reaped.
    pub drain_timeout: Duration,
    pub pools: Vec<PoolConfig>,
}

impl WorkerHostConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        let pool = |name: &str, types: &[&str], concurrency: usize, visibility_secs: u64| {
            PoolConfig {
                name: name.to_string(),
                job_types: types.iter().map(|t| t.to_string()).collect(),
                concurrency,
                visibility: Duration::from_secs(visibility_secs),
            }
        };

        Self {
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(settings.drain_secs),
            pools: vec![
                pool(
                    "sync",
                    &[JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC],
                    settings.sync_concurrency,
                    settings.sync_visibility_secs,
                ),
                pool(
                    "fetch",
                    &[JOB_TYPE_OCCURRENCE_FETCH_RAW],
                    settings.fetch_concurrency,
                    settings.fetch_visibility_secs,
                ),
                pool(
                    "parse",
                    &[JOB_TYPE_OCCURRENCE_PARSE],
                    settings.parse_concurrency,
                    settings.parse_visibility_secs,
                ),
                pool(
                    "stitch",
                    &[JOB_TYPE_OCCURRENCE_STITCH],
                    settings.stitch_concurrency,
                    settings.stitch_visibility_secs,
                ),
                pool(
                    "route",
                    &[JOB_TYPE_TICKET_APPLY_ROUTING],
                    settings.route_concurrency,
                    settings.route_visibility_secs,
                ),
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        JobError::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    fn message(&self) -> &str {
        match self {
            JobError::Retryable(message) | JobError::Fatal(message) => message,
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job) -> Result<(), JobError>;
}

/// Run one worker loop per configured slot plus the lease reaper, until the
/// shutdown token fires. In-flight jobs get `drain_timeout` to finish; any
/// stragglers are abandoned and their leases expire.
pub async fn run_worker_host<E: JobExecutor + 'static>(
    queue: JobQueue,
    executor: Arc<E>,
    config: WorkerHostConfig,
    shutdown: CancellationToken,
) {
    let mut handles = Vec::new();
    for pool in &config.pools {
        for slot in 0..pool.concurrency {
            let worker_id = format!("{}-{}-{}", pool.name, std::process::id(), slot);
            handles.push(tokio::spawn(run_pool_worker(
                queue.clone(),
                executor.clone(),
                pool.clone(),
                worker_id,
                config.poll_interval,
                shutdown.clone(),
            )));
        }
    }

    let reaper = tokio::spawn(run_reaper(
        queue.clone(),
        config.reap_interval,
        shutdown.clone(),
    ));

    shutdown.cancelled().await;
    info!("graceful shutdown initiated, draining in-flight jobs");

    let drain = futures::future::join_all(handles.iter_mut());
    if tokio::time::timeout(config.drain_timeout, drain).await.is_err() {
        warn!("drain timeout exceeded; abandoning remaining workers");
        for handle in &handles {
            handle.abort();
        }
    }

    reaper.abort();
    let _ = reaper.await;
    info!("worker host shutdown complete");
}

async fn run_pool_worker<E: JobExecutor>(
    queue: JobQueue,
    executor: Arc<E>,
    pool: PoolConfig,
    worker_id: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    let types: Vec<&str> = pool.job_types.iter().map(String::as_str).collect();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match queue.lease(&types, &worker_id, pool.visibility).await {
            Ok(Some(job)) => handle_job(&queue, executor.as_ref(), job).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
            Err(err) => {
                error!(worker_id = %worker_id, error = %err, "failed to lease next job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(poll_interval) => {}
                }
            }
        }
    }
}

async fn handle_job<E: JobExecutor>(queue: &JobQueue, executor: &E, job: Job) {
    // Correlation id binds every log record of this execution to
    // (organization, job, attempt).
    let correlation_id = format!("{}:{}:{}", job.organization_id, job.id, job.attempts + 1);
    let span = tracing::info_span!(
        "job",
        correlation_id = %correlation_id,
        job_type = %job.job_type,
    );

    let job_id = job.id.clone();
    let result = AssertUnwindSafe(executor.execute(job))
        .catch_unwind()
        .instrument(span.clone())
        .await;

    let _entered = span.enter();
    let outcome = match result {
        Ok(Ok(())) => queue.complete(&job_id).await.map(|()| info!("job completed")),
        Ok(Err(JobError::Retryable(message))) => {
            warn!(error = %message, "job failed and will retry");
            queue.fail(&job_id, &message).await
        }
        Ok(Err(JobError::Fatal(message))) => {
            warn!(error = %message, "job failed permanently");
            queue.mark_dead(&job_id, &message).await
        }
        Err(panic) => {
            let message = if let Some(msg) = panic.downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "worker panic".to_string()
            };
            warn!("job panicked: {message}");
            queue.fail(&job_id, &message).await
        }
    };

    match outcome {
        Ok(()) => {}
        // Reaper or an operator got there first; nothing to persist.
        Err(QueueError::NotRunning(_)) => {
            info!("job already moved out of running state");
        }
        Err(err) => {
            error!(error = %err, "failed to persist job outcome");
        }
    }
}

async fn run_reaper(queue: JobQueue, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }

        match queue.reap_expired().await {
            Ok(reaped) if !reaped.is_empty() => {
                warn!(count = reaped.len(), "reaped expired job leases");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "lease reaper sweep failed"),
        }
    }
}
