use serde::Deserialize;
use tracing::info;

use crate::Job;
use crate::canonical::{CanonicalRepository, Direction, NewAttachment, NewCanonicalMessage};
use crate::fingerprint::{PARSER_VERSION, body_text_hash, fingerprint_v1};
use crate::jobs::{
    JOB_TYPE_OCCURRENCE_STITCH, JobDispatcher, enqueue_stage, map_blob_error,
};
use crate::mime::{self, MailParseError, ParsedEmail};
use crate::occurrences::{OccurrenceRepository, Stage};
use crate::orgs::OrgRepository;
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct ParsePayload {
    organization_id: String,
    occurrence_id: String,
}

/// Decode the stored raw bytes, compute the canonical message, and resolve
/// recipient evidence. Same bytes and parser version always land on the same
/// canonical row, which is the system's exactly-once identity.
pub async fn handle_occurrence_parse(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: ParsePayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::fatal(format!("invalid occurrence_parse payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let occurrence = occurrences
        .get(&payload.organization_id, &payload.occurrence_id)
        .await
        .map_err(|err| JobError::fatal(format!("load occurrence: {err}")))?;

    // Re-delivery after a committed parse: just push the next stage.
    if occurrence.canonical_message_id.is_some() {
        enqueue_stage(
            &dispatcher.queue,
            JOB_TYPE_OCCURRENCE_STITCH,
            &payload.organization_id,
            &occurrence.id,
            None,
        )
        .await?;
        return Ok(());
    }

    let Some(blob_hash) = occurrence.raw_blob_hash.as_deref() else {
        return Err(JobError::fatal(format!(
            "occurrence {} has no raw blob; fetch must run first",
            occurrence.id
        )));
    };

    let raw = dispatcher
        .blob
        .get(&payload.organization_id, blob_hash)
        .await
        .map_err(|err| map_blob_error("load raw message", err))?;

    let parsed = match mime::parse_rfc822(&raw, &dispatcher.sanitizer) {
        Ok(parsed) => parsed,
        Err(MailParseError::Malformed) => {
            occurrences
                .set_failed(
                    &payload.organization_id,
                    &occurrence.id,
                    Stage::Parse,
                    "malformed MIME message",
                )
                .await
                .map_err(|err| JobError::retryable(format!("record parse failure: {err}")))?;
            // Terminal by design: the bytes will not get better on retry.
            return Err(JobError::fatal("malformed MIME message"));
        }
    };

    let organization = OrgRepository::new(dispatcher.db.clone())
        .get(&payload.organization_id)
        .await
        .map_err(|err| JobError::retryable(format!("load organization: {err}")))?;

    let body_text = parsed.effective_body_text();
    let body_hash = body_text_hash(&body_text);
    let to_and_cc: Vec<String> = parsed
        .to
        .iter()
        .chain(parsed.cc.iter())
        .map(|addr| addr.email.clone())
        .collect();
    let fingerprint = fingerprint_v1(
        parsed.subject.as_deref(),
        parsed.from_email.as_deref(),
        parsed.date,
        &to_and_cc,
        &body_hash,
    );

    let direction = resolve_direction(&parsed, &organization.domains);
    let evidence = mime::resolve_recipient_evidence(&parsed, &organization.domains);

    let canonical_repo = CanonicalRepository::new(dispatcher.db.clone());
    let (canonical, outcome) = canonical_repo
        .upsert(NewCanonicalMessage {
            organization_id: payload.organization_id.clone(),
            fingerprint_v1: fingerprint,
            body_text_hash: body_hash,
            subject: parsed.subject.clone(),
            from_email: parsed.from_email.clone(),
            from_name: parsed.from_name.clone(),
            to: parsed.to.clone(),
            cc: parsed.cc.clone(),
            date_header: parsed.date,
            snippet: parsed.snippet.clone(),
            body_text: parsed.body_text.clone(),
            body_html: parsed.body_html.clone(),
            message_id_header: parsed.message_id.clone(),
            in_reply_to: parsed.in_reply_to.clone(),
            references: parsed.references.clone(),
            reply_to: parsed.reply_to.clone(),
            x_oss_ticket_id: parsed.x_oss_ticket_id.clone(),
            x_oss_message_id: parsed.x_oss_message_id.clone(),
            direction,
            parser_version: PARSER_VERSION.to_string(),
            sanitizer_revision: dispatcher.sanitizer.revision().to_string(),
        })
        .await
        .map_err(|err| JobError::retryable(format!("canonical upsert: {err}")))?;

    for attachment in &parsed.attachments {
        let content_hash = dispatcher
            .blob
            .put(&payload.organization_id, &attachment.data)
            .await
            .map_err(|err| map_blob_error("store attachment", err))?;
        canonical_repo
            .add_attachment(
                &payload.organization_id,
                &canonical.id,
                &NewAttachment {
                    content_hash,
                    filename: attachment.filename.clone(),
                    content_type: attachment.content_type.clone(),
                    size_bytes: attachment.data.len() as i64,
                    is_inline: attachment.is_inline,
                    content_id: attachment.content_id.clone(),
                },
            )
            .await
            .map_err(|err| JobError::retryable(format!("record attachment: {err}")))?;
    }

    occurrences
        .set_parsed(
            &payload.organization_id,
            &occurrence.id,
            &canonical.id,
            &evidence,
        )
        .await
        .map_err(|err| JobError::retryable(format!("record parsed state: {err}")))?;

    enqueue_stage(
        &dispatcher.queue,
        JOB_TYPE_OCCURRENCE_STITCH,
        &payload.organization_id,
        &occurrence.id,
        None,
    )
    .await?;

    info!(
        occurrence_id = %occurrence.id,
        canonical_message_id = %canonical.id,
        outcome = ?outcome,
        direction = direction.as_str(),
        recipient_source = evidence.source.as_str(),
        "parsed occurrence"
    );
    Ok(())
}

/// An occurrence mirrored back from our own send path carries the
/// `X-OSS-Message-ID` marker; failing that, a sender inside the org's own
/// domains means outbound mail journaled on the way out.
fn resolve_direction(parsed: &ParsedEmail, org_domains: &[String]) -> Direction {
    if parsed.x_oss_message_id.is_some() {
        return Direction::Outbound;
    }

    let from_domain = parsed
        .from_email
        .as_deref()
        .and_then(mime::email_domain);
    match from_domain {
        Some(domain)
            if org_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain)) =>
        {
            Direction::Outbound
        }
        _ => Direction::Inbound,
    }
}
