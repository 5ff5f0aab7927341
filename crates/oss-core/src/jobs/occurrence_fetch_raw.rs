use serde::Deserialize;
use tracing::info;

use crate::Job;
use crate::jobs::{
    JOB_TYPE_OCCURRENCE_PARSE, JobDispatcher, enqueue_stage, map_blob_error, map_provider_error,
};
use crate::mailboxes::MailboxRepository;
use crate::occurrences::{OccurrenceRepository, Stage};
use crate::provider::ProviderError;
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct FetchPayload {
    organization_id: String,
    occurrence_id: String,
}

/// Retrieve raw RFC 822 bytes from the provider and pin them in the blob
/// store. Malformed MIME is not this stage's problem; parse jobs carry a
/// single attempt so MIME bombs cannot cause retry storms.
pub async fn handle_occurrence_fetch_raw(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: FetchPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::fatal(format!("invalid occurrence_fetch_raw payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let occurrence = occurrences
        .get(&payload.organization_id, &payload.occurrence_id)
        .await
        .map_err(|err| JobError::fatal(format!("load occurrence: {err}")))?;

    // Already fetched on an earlier delivery of this job: skip the provider
    // call, just make sure the parse stage is queued.
    if occurrence.raw_blob_hash.is_some() {
        enqueue_stage(
            &dispatcher.queue,
            JOB_TYPE_OCCURRENCE_PARSE,
            &payload.organization_id,
            &occurrence.id,
            Some(1),
        )
        .await?;
        return Ok(());
    }

    let mailbox = MailboxRepository::new(dispatcher.db.clone())
        .get(&payload.organization_id, &occurrence.mailbox_id)
        .await
        .map_err(|err| JobError::fatal(format!("load mailbox: {err}")))?;

    let raw = match dispatcher
        .provider
        .fetch_raw(&mailbox, &occurrence.provider_message_id)
        .await
    {
        Ok(raw) => raw,
        Err(err @ ProviderError::NotFound(_)) => {
            // Message deleted at the provider between discovery and fetch.
            let mapped = map_provider_error("fetch_raw", err);
            occurrences
                .set_failed(
                    &payload.organization_id,
                    &occurrence.id,
                    Stage::Fetch,
                    "message no longer exists at provider",
                )
                .await
                .map_err(|err| JobError::retryable(format!("record fetch failure: {err}")))?;
            return Err(mapped);
        }
        Err(err) => {
            let mapped = map_provider_error("fetch_raw", err);
            occurrences
                .record_stage_error(
                    &payload.organization_id,
                    &occurrence.id,
                    Stage::Fetch,
                    &mapped.to_string(),
                )
                .await
                .map_err(|err| JobError::retryable(format!("record fetch error: {err}")))?;
            return Err(mapped);
        }
    };

    let content_hash = dispatcher
        .blob
        .put(&payload.organization_id, &raw)
        .await
        .map_err(|err| map_blob_error("store raw message", err))?;

    occurrences
        .set_fetched(&payload.organization_id, &occurrence.id, &content_hash)
        .await
        .map_err(|err| JobError::retryable(format!("record fetched state: {err}")))?;

    enqueue_stage(
        &dispatcher.queue,
        JOB_TYPE_OCCURRENCE_PARSE,
        &payload.organization_id,
        &occurrence.id,
        Some(1),
    )
    .await?;

    info!(
        occurrence_id = %occurrence.id,
        content_hash = %content_hash,
        bytes = raw.len(),
        "fetched raw message"
    );
    Ok(())
}
