use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::Job;
use crate::jobs::{
    JOB_TYPE_OCCURRENCE_FETCH_RAW, JobDispatcher, enqueue_history_cadence, enqueue_stage,
    map_provider_error,
};
use crate::mailboxes::{MailboxRepository, MailboxSyncStatus, SyncEventKind, SyncKind};
use crate::occurrences::OccurrenceRepository;
use crate::provider::ProviderError;
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct BackfillPayload {
    organization_id: String,
    mailbox_id: String,
}

/// Full backfill: page through the provider's message list, discover every
/// occurrence, then pin the cursor from the provider profile so incremental
/// sync can take over.
pub async fn handle_mailbox_backfill(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: BackfillPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::fatal(format!("invalid mailbox_backfill payload: {err}")))?;

    let mailboxes = MailboxRepository::new(dispatcher.db.clone());
    let mailbox = mailboxes
        .get(&payload.organization_id, &payload.mailbox_id)
        .await
        .map_err(|err| JobError::fatal(format!("load mailbox: {err}")))?;

    if mailbox.is_paused(Utc::now()) {
        info!(mailbox_id = %mailbox.id, "mailbox is paused; skipping backfill");
        return Ok(());
    }
    if mailbox.sync_status == MailboxSyncStatus::Degraded {
        info!(mailbox_id = %mailbox.id, "mailbox is degraded; skipping backfill");
        return Ok(());
    }

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let mut page_token: Option<String> = None;
    let mut discovered = 0usize;
    let mut seen = 0usize;

    loop {
        let page = match dispatcher
            .provider
            .list_messages(&mailbox, page_token.as_deref())
            .await
        {
            Ok(page) => page,
            Err(ProviderError::Unauthorized) => {
                mailboxes
                    .set_degraded(
                        &payload.organization_id,
                        &mailbox.id,
                        "provider rejected credentials",
                    )
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
                return Err(map_provider_error("list_messages", err));
            }
        };

        for provider_message_id in &page.ids {
            seen += 1;
            let (occurrence, created) = occurrences
                .upsert_discovered(&payload.organization_id, &mailbox.id, provider_message_id)
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

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    // The profile's cursor marks "now" at the provider; incremental sync
    // starts from here and overlap is absorbed by the occurrence upsert.
    let profile = dispatcher
        .provider
        .profile(&mailbox)
        .await
        .map_err(|err| map_provider_error("profile", err))?;

    mailboxes
        .record_sync_success(
            &payload.organization_id,
            &mailbox.id,
            SyncKind::Full,
            profile.history_cursor.as_deref(),
        )
        .await
        .map_err(|err| JobError::retryable(format!("record sync success: {err}")))?;
    mailboxes
        .record_event(
            &payload.organization_id,
            &mailbox.id,
            SyncEventKind::BackfillCompleted,
            Some(&format!("{seen} listed, {discovered} newly discovered")),
        )
        .await
        .map_err(|err| JobError::retryable(format!("record sync event: {err}")))?;

    if let Some(cursor) = profile.history_cursor.as_deref() {
        enqueue_history_cadence(dispatcher, &payload.organization_id, &mailbox.id, cursor).await?;
    }

    info!(
        mailbox_id = %mailbox.id,
        seen,
        discovered,
        cursor = profile.history_cursor.as_deref().unwrap_or(""),
        "backfill complete"
    );
    Ok(())
}
