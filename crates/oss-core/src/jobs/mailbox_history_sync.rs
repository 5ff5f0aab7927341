use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::Job;
use crate::jobs::{
    JOB_TYPE_OCCURRENCE_FETCH_RAW, JobDispatcher, enqueue_history_cadence,
    enqueue_recovery_backfill, enqueue_stage, map_provider_error,
};
use crate::mailboxes::{MailboxRepository, MailboxSyncStatus, SyncEventKind, SyncKind};
use crate::occurrences::OccurrenceRepository;
use crate::provider::{HistoryEventKind, ProviderError};
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct HistorySyncPayload {
    organization_id: String,
    mailbox_id: String,
}

/// Incremental sync: walk the provider's history delta from the stored
/// cursor, discover new occurrences, and reschedule itself at the cadence.
pub async fn handle_mailbox_history_sync(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: HistorySyncPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::fatal(format!("invalid mailbox_history_sync payload: {err}")))?;

    let mailboxes = MailboxRepository::new(dispatcher.db.clone());
    let mailbox = mailboxes
        .get(&payload.organization_id, &payload.mailbox_id)
        .await
        .map_err(|err| JobError::fatal(format!("load mailbox: {err}")))?;

    // Paused and degraded mailboxes return a quiet no-op, not an error, and
    // do not reschedule; resume / credential refresh restarts the cadence.
    if mailbox.is_paused(Utc::now()) {
        info!(mailbox_id = %mailbox.id, "mailbox is paused; skipping history sync");
        return Ok(());
    }
    if mailbox.sync_status == MailboxSyncStatus::Degraded {
        info!(mailbox_id = %mailbox.id, "mailbox is degraded; skipping history sync");
        return Ok(());
    }

    let Some(cursor) = mailbox.history_cursor.clone() else {
        // Never backfilled (or cursor cleared): recover through a backfill.
        warn!(mailbox_id = %mailbox.id, "no history cursor; enqueueing backfill");
        enqueue_recovery_backfill(&dispatcher.queue, &payload.organization_id, &mailbox.id)
            .await
            .map_err(|err| JobError::retryable(format!("enqueue recovery backfill: {err}")))?;
        return Ok(());
    };

    let delta = match dispatcher.provider.history_delta(&mailbox, &cursor).await {
        Ok(delta) => delta,
        Err(ProviderError::InvalidCursor) => {
            // Not retried in place: record the failure, hand off to backfill.
            mailboxes
                .record_sync_failure(
                    &payload.organization_id,
                    &mailbox.id,
                    "invalid history cursor",
                    &dispatcher.breaker,
                )
                .await
                .map_err(|err| JobError::retryable(format!("record sync failure: {err}")))?;
            enqueue_recovery_backfill(&dispatcher.queue, &payload.organization_id, &mailbox.id)
                .await
                .map_err(|err| JobError::retryable(format!("enqueue recovery backfill: {err}")))?;
            mailboxes
                .record_event(
                    &payload.organization_id,
                    &mailbox.id,
                    SyncEventKind::InvalidCursorRecovery,
                    Some(&format!("cursor {cursor}")),
                )
                .await
                .map_err(|err| JobError::retryable(format!("record sync event: {err}")))?;
            info!(mailbox_id = %mailbox.id, "invalid cursor; backfill recovery enqueued");
            return Ok(());
        }
        Err(ProviderError::Unauthorized) => {
            mailboxes
                .set_degraded(&payload.organization_id, &mailbox.id, "provider rejected credentials")
                .await
                .map_err(|err| JobError::retryable(format!("degrade mailbox: {err}")))?;
            warn!(mailbox_id = %mailbox.id, "credentials rejected; mailbox degraded");
            return Ok(());
        }
        Err(err) => {
            let outcome = mailboxes
                .record_sync_failure(
                    &payload.organization_id,
                    &mailbox.id,
                    &err.to_string(),
                    &dispatcher.breaker,
                )
                .await
                .map_err(|err| JobError::retryable(format!("record sync failure: {err}")))?;
            if outcome.tripped {
                warn!(
                    mailbox_id = %mailbox.id,
                    failures = outcome.consecutive_failures,
                    "circuit breaker tripped; mailbox paused"
                );
            }
            return Err(map_provider_error("history_delta", err));
        }
    };

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let mut discovered = 0usize;
    for event in &delta.events {
        match event.kind {
            HistoryEventKind::MessageAdded => {
                let (occurrence, created) = occurrences
                    .upsert_discovered(
                        &payload.organization_id,
                        &mailbox.id,
                        &event.provider_message_id,
                    )
                    .await
                    .map_err(|err| JobError::retryable(format!("upsert occurrence: {err}")))?;
                if created {
                    discovered += 1;
                }
                enqueue_stage(
                    &dispatcher.queue,
                    JOB_TYPE_OCCURRENCE_FETCH_RAW,
                    &payload.organization_id,
                    &occurrence.id,
                    None,
                )
                .await?;
            }
            HistoryEventKind::MessageDeleted => {
                // Deletion is recorded for ops; stored data is retained.
                mailboxes
                    .record_event(
                        &payload.organization_id,
                        &mailbox.id,
                        SyncEventKind::MessageDeleted,
                        Some(&event.provider_message_id),
                    )
                    .await
                    .map_err(|err| JobError::retryable(format!("record sync event: {err}")))?;
            }
        }
    }

    mailboxes
        .record_sync_success(
            &payload.organization_id,
            &mailbox.id,
            SyncKind::Incremental,
            Some(&delta.new_cursor),
        )
        .await
        .map_err(|err| JobError::retryable(format!("record sync success: {err}")))?;

    enqueue_history_cadence(
        dispatcher,
        &payload.organization_id,
        &mailbox.id,
        &delta.new_cursor,
    )
    .await?;

    info!(
        mailbox_id = %mailbox.id,
        cursor = %delta.new_cursor,
        discovered,
        "history sync complete"
    );
    Ok(())
}
