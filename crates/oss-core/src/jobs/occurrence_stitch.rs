use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::Job;
use crate::canonical::{CanonicalMessage, CanonicalRepository, Direction};
use crate::fingerprint::normalize_subject;
use crate::jobs::{JOB_TYPE_TICKET_APPLY_ROUTING, JobDispatcher};
use crate::occurrences::{Occurrence, OccurrenceRepository, Stage};
use crate::queue::EnqueueOptions;
use crate::tickets::{
    NewTicket, StitchConfidence, StitchReason, TicketEventKind, TicketRepository,
};
use crate::worker::JobError;

/// Fallback window for subject-based stitching.
const SUBJECT_MATCH_WINDOW_DAYS: i64 = 14;

#[derive(Debug, Deserialize)]
struct StitchPayload {
    organization_id: String,
    occurrence_id: String,
}

/// Attach the occurrence's canonical message to a ticket: marker, then
/// reply-to token, then the references graph, then the subject heuristic,
/// else a fresh ticket.
pub async fn handle_occurrence_stitch(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: StitchPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::fatal(format!("invalid occurrence_stitch payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let occurrence = occurrences
        .get(&payload.organization_id, &payload.occurrence_id)
        .await
        .map_err(|err| JobError::fatal(format!("load occurrence: {err}")))?;

    match stitch(dispatcher, &occurrence).await {
        Ok(()) => Ok(()),
        Err(err) => {
            occurrences
                .record_stage_error(
                    &payload.organization_id,
                    &occurrence.id,
                    Stage::Stitch,
                    &err.to_string(),
                )
                .await
                .map_err(|record_err| {
                    JobError::retryable(format!("record stitch error: {record_err}"))
                })?;
            Err(err)
        }
    }
}

async fn stitch(dispatcher: &JobDispatcher, occurrence: &Occurrence) -> Result<(), JobError> {
    let organization_id = occurrence.organization_id.as_str();
    let canonical_id = occurrence.canonical_message_id.as_deref().ok_or_else(|| {
        JobError::fatal(format!(
            "occurrence {} reached stitch without a canonical link",
            occurrence.id
        ))
    })?;

    let canonical_repo = CanonicalRepository::new(dispatcher.db.clone());
    let canonical = canonical_repo
        .get(organization_id, canonical_id)
        .await
        .map_err(|err| JobError::retryable(format!("load canonical message: {err}")))?;

    let tickets = TicketRepository::new(dispatcher.db.clone());

    // A sibling occurrence already stitched this canonical message.
    if let Some(ticket_id) = canonical.ticket_id.clone() {
        finish(dispatcher, occurrence, &ticket_id, false).await?;
        info!(
            occurrence_id = %occurrence.id,
            ticket_id = %ticket_id,
            "canonical message already stitched; linked occurrence"
        );
        return Ok(());
    }

    let resolution = resolve_ticket(dispatcher, &tickets, &canonical, occurrence).await?;

    let (ticket_id, created) = match resolution {
        Resolution::Existing {
            ticket_id,
            reason,
            confidence,
        } => {
            tickets
                .record_stitch(organization_id, &ticket_id, reason, Some(confidence))
                .await
                .map_err(|err| JobError::retryable(format!("record stitch: {err}")))?;
            (ticket_id, false)
        }
        Resolution::CreateNew => {
            let ticket = tickets
                .create(NewTicket {
                    organization_id: organization_id.to_string(),
                    subject: canonical.subject.clone(),
                    normalized_subject: canonical
                        .subject
                        .as_deref()
                        .map(normalize_subject)
                        .filter(|s| !s.is_empty()),
                    requester_email: canonical.from_email.clone(),
                    requester_name: canonical.from_name.clone(),
                })
                .await
                .map_err(|err| JobError::retryable(format!("create ticket: {err}")))?;
            (ticket.id, true)
        }
    };

    canonical_repo
        .set_ticket(organization_id, &canonical.id, &ticket_id)
        .await
        .map_err(|err| JobError::retryable(format!("link canonical to ticket: {err}")))?;
    tickets
        .record_event(
            organization_id,
            &ticket_id,
            TicketEventKind::MessageAttached,
            serde_json::json!({ "canonical_message_id": canonical.id }),
        )
        .await
        .map_err(|err| JobError::retryable(format!("record ticket event: {err}")))?;

    // Mirrored copies of our own outbound sends do not refresh activity;
    // the send path already did.
    if canonical.direction == Direction::Inbound {
        tickets
            .touch_activity(organization_id, &ticket_id, Utc::now())
            .await
            .map_err(|err| JobError::retryable(format!("touch ticket activity: {err}")))?;
    }

    finish(dispatcher, occurrence, &ticket_id, created).await?;
    info!(
        occurrence_id = %occurrence.id,
        ticket_id = %ticket_id,
        created,
        "stitched occurrence"
    );
    Ok(())
}

enum Resolution {
    Existing {
        ticket_id: String,
        reason: StitchReason,
        confidence: StitchConfidence,
    },
    CreateNew,
}

async fn resolve_ticket(
    dispatcher: &JobDispatcher,
    tickets: &TicketRepository,
    canonical: &CanonicalMessage,
    occurrence: &Occurrence,
) -> Result<Resolution, JobError> {
    let organization_id = canonical.organization_id.as_str();

    // 1. Authoritative outbound marker.
    if let Some(marker) = canonical.x_oss_ticket_id.as_deref() {
        let known = tickets
            .exists(organization_id, marker)
            .await
            .map_err(|err| JobError::retryable(format!("marker lookup: {err}")))?;
        if known {
            return Ok(Resolution::Existing {
                ticket_id: marker.to_string(),
                reason: StitchReason::XOssMarker,
                confidence: StitchConfidence::High,
            });
        }
    }

    // 2. Reply token in the ticket alias.
    for candidate in token_candidates(canonical, occurrence) {
        if let Some(token) = extract_reply_token(&candidate) {
            let found = tickets
                .find_by_reply_token(organization_id, &token)
                .await
                .map_err(|err| JobError::retryable(format!("reply token lookup: {err}")))?;
            if let Some(ticket) = found {
                return Ok(Resolution::Existing {
                    ticket_id: ticket.id,
                    reason: StitchReason::ReplyToToken,
                    confidence: StitchConfidence::High,
                });
            }
        }
    }

    // 3. Threading headers through the canonical-message index.
    let mut reference_ids = canonical.in_reply_to.clone();
    reference_ids.extend(canonical.references.iter().cloned());
    let canonical_repo = CanonicalRepository::new(dispatcher.db.clone());
    if let Some(ticket_id) = canonical_repo
        .find_ticket_by_message_ids(organization_id, &reference_ids)
        .await
        .map_err(|err| JobError::retryable(format!("references lookup: {err}")))?
    {
        return Ok(Resolution::Existing {
            ticket_id,
            reason: StitchReason::ReferencesGraph,
            confidence: StitchConfidence::Medium,
        });
    }

    // 4. Subject heuristic for naive clients; disabled whenever any
    // threading header is present.
    if reference_ids.is_empty() {
        if let (Some(subject), Some(requester)) =
            (canonical.subject.as_deref(), canonical.from_email.as_deref())
        {
            let normalized = normalize_subject(subject);
            if !normalized.is_empty() {
                let window_start = Utc::now() - chrono::Duration::days(SUBJECT_MATCH_WINDOW_DAYS);
                let found = tickets
                    .find_open_by_subject(organization_id, &normalized, requester, window_start)
                    .await
                    .map_err(|err| JobError::retryable(format!("subject lookup: {err}")))?;
                if let Some(ticket) = found {
                    return Ok(Resolution::Existing {
                        ticket_id: ticket.id,
                        reason: StitchReason::SubjectMatch,
                        confidence: StitchConfidence::Low,
                    });
                }
            }
        }
    }

    Ok(Resolution::CreateNew)
}

/// Addresses that may carry the `ticket+<token>@…` alias on an inbound
/// reply: the resolved original recipient first, then the To/Cc lists.
fn token_candidates(canonical: &CanonicalMessage, occurrence: &Occurrence) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(recipient) = &occurrence.original_recipient {
        candidates.push(recipient.clone());
    }
    candidates.extend(canonical.to.iter().map(|addr| addr.email.clone()));
    candidates.extend(canonical.cc.iter().map(|addr| addr.email.clone()));
    candidates
}

fn extract_reply_token(address: &str) -> Option<String> {
    let (local, _domain) = address.trim().rsplit_once('@')?;
    let token = local.strip_prefix("ticket+")?;
    (!token.is_empty()).then(|| token.to_lowercase())
}

async fn finish(
    dispatcher: &JobDispatcher,
    occurrence: &Occurrence,
    ticket_id: &str,
    ticket_created: bool,
) -> Result<(), JobError> {
    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    occurrences
        .set_stitched(&occurrence.organization_id, &occurrence.id)
        .await
        .map_err(|err| JobError::retryable(format!("record stitched state: {err}")))?;

    let payload = serde_json::json!({
        "organization_id": occurrence.organization_id,
        "occurrence_id": occurrence.id,
        "ticket_id": ticket_id,
        "ticket_created": ticket_created,
    });
    dispatcher
        .queue
        .enqueue(
            JOB_TYPE_TICKET_APPLY_ROUTING,
            &occurrence.organization_id,
            payload,
            EnqueueOptions::keyed(format!("{JOB_TYPE_TICKET_APPLY_ROUTING}:{}", occurrence.id)),
        )
        .await
        .map_err(|err| JobError::retryable(format!("enqueue routing: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::occurrence_parse::handle_occurrence_parse;
    use crate::jobs::testsupport::{harness, sample_rfc822};
    use crate::occurrences::OccurrenceState;
    use crate::queue::JobStatus;
    use crate::tickets::TicketStatus;

    async fn ingest(
        h: &crate::jobs::testsupport::TestHarness,
        provider_id: &str,
        raw: &[u8],
    ) -> String {
        let occurrences = OccurrenceRepository::new(h.dispatcher.db.clone());
        let (occurrence, _) = occurrences
            .upsert_discovered(&h.org_id, &h.mailbox.id, provider_id)
            .await
            .expect("discover");
        let hash = h.dispatcher.blob.put(&h.org_id, raw).await.expect("blob");
        occurrences
            .set_fetched(&h.org_id, &occurrence.id, &hash)
            .await
            .expect("fetched");
        handle_occurrence_parse(&h.dispatcher, stage_job(h, "occurrence_parse", &occurrence.id))
            .await
            .expect("parse");
        occurrence.id
    }

    fn stage_job(
        h: &crate::jobs::testsupport::TestHarness,
        job_type: &str,
        occurrence_id: &str,
    ) -> Job {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: h.org_id.clone(),
            job_type: job_type.to_string(),
            payload: serde_json::json!({
                "organization_id": h.org_id,
                "occurrence_id": occurrence_id,
            }),
            status: JobStatus::Running,
            attempts: 0,
            max_attempts: 5,
            run_at: Utc::now(),
            idempotency_key: None,
            lock_owner: None,
            lock_expires_at: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            finished_at: None,
        }
    }

    async fn stitch_occurrence(h: &crate::jobs::testsupport::TestHarness, occurrence_id: &str) {
        handle_occurrence_stitch(&h.dispatcher, stage_job(h, "occurrence_stitch", occurrence_id))
            .await
            .expect("stitch");
    }

    async fn ticket_of(
        h: &crate::jobs::testsupport::TestHarness,
        occurrence_id: &str,
    ) -> crate::tickets::Ticket {
        let occurrences = OccurrenceRepository::new(h.dispatcher.db.clone());
        let canonical_id = occurrences
            .get(&h.org_id, occurrence_id)
            .await
            .expect("occurrence")
            .canonical_message_id
            .expect("canonical");
        let ticket_id = CanonicalRepository::new(h.dispatcher.db.clone())
            .get(&h.org_id, &canonical_id)
            .await
            .expect("canonical")
            .ticket_id
            .expect("ticket link");
        TicketRepository::new(h.dispatcher.db.clone())
            .get(&h.org_id, &ticket_id)
            .await
            .expect("ticket")
    }

    #[tokio::test]
    async fn first_occurrence_creates_new_ticket() {
        let h = harness().await;
        let occurrence_id = ingest(
            &h,
            "m1",
            &sample_rfc822("Printer broken", "mid-1@x", "It is broken."),
        )
        .await;
        stitch_occurrence(&h, &occurrence_id).await;

        let ticket = ticket_of(&h, &occurrence_id).await;
        assert_eq!(ticket.status, TicketStatus::New);
        assert_eq!(ticket.stitch_reason, StitchReason::NewTicket);
        assert_eq!(ticket.requester_email.as_deref(), Some("alice@customer.example"));
        assert_eq!(ticket.priority, "normal");

        let occurrences = OccurrenceRepository::new(h.dispatcher.db.clone());
        let stitched = occurrences.get(&h.org_id, &occurrence_id).await.expect("get");
        assert_eq!(stitched.state, OccurrenceState::Stitched);
    }

    #[tokio::test]
    async fn duplicate_occurrences_stitch_to_one_ticket() {
        let h = harness().await;
        let occ_a = ingest(
            &h,
            "m1",
            &sample_rfc822("Printer broken", "rewrite-a@mx", "Same body."),
        )
        .await;
        let occ_b = ingest(
            &h,
            "m2",
            &sample_rfc822("Printer broken", "rewrite-b@mx", "Same body."),
        )
        .await;

        stitch_occurrence(&h, &occ_a).await;
        stitch_occurrence(&h, &occ_b).await;

        let ticket_a = ticket_of(&h, &occ_a).await;
        let ticket_b = ticket_of(&h, &occ_b).await;
        assert_eq!(ticket_a.id, ticket_b.id, "one logical email, one ticket");

        let conn = h.dispatcher.db.connection().await.expect("conn");
        let mut rows = conn
            .query("SELECT COUNT(*) FROM tickets", ())
            .await
            .expect("query");
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn marker_stitch_beats_threading_headers() {
        let h = harness().await;
        let tickets = TicketRepository::new(h.dispatcher.db.clone());

        // T1 owns the Message-ID the reply threads against.
        let occ_t1 = ingest(&h, "m1", &sample_rfc822("Original", "thread-root@x", "root"))
            .await;
        stitch_occurrence(&h, &occ_t1).await;
        let t1 = ticket_of(&h, &occ_t1).await;

        // T2 is the marker target.
        let t2 = tickets
            .create(NewTicket {
                organization_id: h.org_id.clone(),
                subject: Some("Other thread".into()),
                normalized_subject: Some("other thread".into()),
                requester_email: Some("bob@customer.example".into()),
                requester_name: None,
            })
            .await
            .expect("t2");

        let raw = format!(
            "From: alice@customer.example\r\n\
             To: support@example.com\r\n\
             Subject: Re: Original\r\n\
             Date: Mon, 2 Jun 2025 12:00:00 +0000\r\n\
             Message-ID: <reply-1@x>\r\n\
             In-Reply-To: <thread-root@x>\r\n\
             X-OSS-Ticket-ID: {}\r\n\
             \r\n\
             Marker wins.\r\n",
            t2.id
        );
        let occ_reply = ingest(&h, "m2", raw.as_bytes()).await;
        stitch_occurrence(&h, &occ_reply).await;

        let ticket = ticket_of(&h, &occ_reply).await;
        assert_eq!(ticket.id, t2.id, "marker beats the references graph");
        assert_ne!(ticket.id, t1.id);
        assert_eq!(ticket.stitch_reason, StitchReason::XOssMarker);
        assert_eq!(ticket.stitch_confidence, Some(StitchConfidence::High));
    }

    #[tokio::test]
    async fn reply_token_stitches_to_ticket() {
        let h = harness().await;
        let tickets = TicketRepository::new(h.dispatcher.db.clone());
        let ticket = tickets
            .create(NewTicket {
                organization_id: h.org_id.clone(),
                subject: Some("Token thread".into()),
                normalized_subject: Some("token thread".into()),
                requester_email: Some("alice@customer.example".into()),
                requester_name: None,
            })
            .await
            .expect("ticket");

        let raw = format!(
            "From: alice@customer.example\r\n\
             To: ticket+{}@example.com\r\n\
             Subject: whatever the client mangled\r\n\
             Date: Mon, 2 Jun 2025 12:00:00 +0000\r\n\
             Message-ID: <tok-reply@x>\r\n\
             X-Gm-Original-To: ticket+{}@example.com\r\n\
             \r\n\
             token reply\r\n",
            ticket.reply_token, ticket.reply_token
        );
        let occurrence_id = ingest(&h, "m1", raw.as_bytes()).await;
        stitch_occurrence(&h, &occurrence_id).await;

        let stitched = ticket_of(&h, &occurrence_id).await;
        assert_eq!(stitched.id, ticket.id);
        assert_eq!(stitched.stitch_reason, StitchReason::ReplyToToken);
    }

    #[tokio::test]
    async fn references_graph_stitches_replies() {
        let h = harness().await;
        let occ_root = ingest(&h, "m1", &sample_rfc822("Root", "root-mid@x", "root body"))
            .await;
        stitch_occurrence(&h, &occ_root).await;
        let root_ticket = ticket_of(&h, &occ_root).await;

        let raw = concat!(
            "From: colleague@customer.example\r\n",
            "To: support@example.com\r\n",
            "Subject: totally different subject\r\n",
            "Date: Tue, 3 Jun 2025 09:00:00 +0000\r\n",
            "Message-ID: <reply-mid@x>\r\n",
            "References: <unrelated@x> <root-mid@x>\r\n",
            "\r\n",
            "reply via references\r\n",
        );
        let occ_reply = ingest(&h, "m2", raw.as_bytes()).await;
        stitch_occurrence(&h, &occ_reply).await;

        let ticket = ticket_of(&h, &occ_reply).await;
        assert_eq!(ticket.id, root_ticket.id);
        assert_eq!(ticket.stitch_reason, StitchReason::ReferencesGraph);
        assert_eq!(ticket.stitch_confidence, Some(StitchConfidence::Medium));
    }

    #[tokio::test]
    async fn subject_match_requires_no_threading_headers() {
        let h = harness().await;
        let occ_first = ingest(
            &h,
            "m1",
            &sample_rfc822("Printer broken", "first@x", "first report"),
        )
        .await;
        stitch_occurrence(&h, &occ_first).await;
        let first_ticket = ticket_of(&h, &occ_first).await;

        // Naive client: same requester, "Re:" subject, no threading headers.
        let occ_naive = ingest(
            &h,
            "m2",
            &sample_rfc822("Re: Printer broken", "naive@x", "still broken"),
        )
        .await;
        stitch_occurrence(&h, &occ_naive).await;
        let naive_ticket = ticket_of(&h, &occ_naive).await;
        assert_eq!(naive_ticket.id, first_ticket.id);
        assert_eq!(naive_ticket.stitch_reason, StitchReason::SubjectMatch);
        assert_eq!(naive_ticket.stitch_confidence, Some(StitchConfidence::Low));

        // Same subject but with a threading header pointing nowhere: the
        // heuristic is disabled and a fresh ticket is created.
        let raw = concat!(
            "From: alice@customer.example\r\n",
            "To: support@example.com\r\n",
            "Subject: Re: Printer broken\r\n",
            "Date: Wed, 4 Jun 2025 09:00:00 +0000\r\n",
            "Message-ID: <threaded@x>\r\n",
            "In-Reply-To: <external-thread@elsewhere>\r\n",
            "\r\n",
            "threaded body\r\n",
        );
        let occ_threaded = ingest(&h, "m3", raw.as_bytes()).await;
        stitch_occurrence(&h, &occ_threaded).await;
        let threaded_ticket = ticket_of(&h, &occ_threaded).await;
        assert_ne!(threaded_ticket.id, first_ticket.id);
        assert_eq!(threaded_ticket.stitch_reason, StitchReason::NewTicket);
    }

    #[tokio::test]
    async fn routing_job_is_enqueued_with_creation_flag() {
        let h = harness().await;
        let occurrence_id = ingest(&h, "m1", &sample_rfc822("S", "mid@x", "b")).await;
        stitch_occurrence(&h, &occurrence_id).await;

        let conn = h.dispatcher.db.connection().await.expect("conn");
        let mut rows = conn
            .query(
                "SELECT payload_json FROM jobs WHERE type = 'ticket_apply_routing'",
                (),
            )
            .await
            .expect("query");
        let row = rows.next().await.expect("row").expect("routing job");
        let payload: String = row.get(0).expect("payload");
        let value: serde_json::Value = serde_json::from_str(&payload).expect("json");
        assert_eq!(value["ticket_created"], true);
        assert_eq!(value["occurrence_id"], occurrence_id);
    }

    #[test]
    fn reply_token_extraction() {
        assert_eq!(
            extract_reply_token("ticket+abc123@example.com").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_reply_token("Ticket+ABC@example.com"),
            None,
            "alias prefix is case-sensitive lowercase"
        );
        assert_eq!(extract_reply_token("support@example.com"), None);
        assert_eq!(extract_reply_token("ticket+@example.com"), None);
        assert_eq!(extract_reply_token("not-an-address"), None);
    }
}
