use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Job;
use crate::canonical::{CanonicalRepository, Direction};
use crate::jobs::JobDispatcher;
use crate::mime::RecipientSource;
use crate::occurrences::{Occurrence, OccurrenceRepository, Stage};
use crate::orgs::{OrgError, OrgRepository};
use crate::routing::{RoutingInput, RoutingRepository, RoutingRule, allowlist_matches, first_match, rule_actions};
use crate::tickets::{TicketEventKind, TicketRepository, TicketStatus};
use crate::worker::JobError;

#[derive(Debug, Serialize, Deserialize)]
pub struct RoutingJobPayload {
    pub organization_id: String,
    pub occurrence_id: String,
    pub ticket_id: String,
    pub ticket_created: bool,
}

/// Apply the allowlist gate and the first matching routing rule to a ticket
/// that was just created by this occurrence. Re-stitched occurrences of an
/// existing ticket and outbound mirror copies skip routing entirely.
pub async fn handle_ticket_apply_routing(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: RoutingJobPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::fatal(format!("invalid ticket_apply_routing payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let occurrence = occurrences
        .get(&payload.organization_id, &payload.occurrence_id)
        .await
        .map_err(|err| JobError::fatal(format!("load occurrence: {err}")))?;

    match route(dispatcher, &payload, &occurrence).await {
        Ok(()) => Ok(()),
        Err(err) => {
            occurrences
                .record_stage_error(
                    &payload.organization_id,
                    &occurrence.id,
                    Stage::Route,
                    &err.to_string(),
                )
                .await
                .map_err(|record_err| {
                    JobError::retryable(format!("record route error: {record_err}"))
                })?;
            Err(err)
        }
    }
}

async fn route(
    dispatcher: &JobDispatcher,
    payload: &RoutingJobPayload,
    occurrence: &Occurrence,
) -> Result<(), JobError> {
    let organization_id = payload.organization_id.as_str();
    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());

    let canonical_id = occurrence.canonical_message_id.as_deref().ok_or_else(|| {
        JobError::fatal(format!(
            "occurrence {} reached routing without a canonical link",
            occurrence.id
        ))
    })?;
    let canonical = CanonicalRepository::new(dispatcher.db.clone())
        .get(organization_id, canonical_id)
        .await
        .map_err(|err| JobError::retryable(format!("load canonical message: {err}")))?;

    if canonical.direction == Direction::Outbound || !payload.ticket_created {
        occurrences
            .set_routed(organization_id, &occurrence.id, None)
            .await
            .map_err(|err| JobError::retryable(format!("record routed state: {err}")))?;
        return Ok(());
    }

    let tickets = TicketRepository::new(dispatcher.db.clone());
    let routing = RoutingRepository::new(dispatcher.db.clone());

    // Allowlist gate. Unknown recipient evidence or a recipient outside the
    // allowlist marks the fresh ticket as spam; no rules are consulted.
    let recipient = occurrence.original_recipient.clone();
    let allowlist = routing
        .list_allowlist(organization_id)
        .await
        .map_err(|err| JobError::retryable(format!("load allowlist: {err}")))?;
    let unknown_source = occurrence.recipient_source == Some(RecipientSource::Unknown);
    let allowlisted = recipient
        .as_deref()
        .is_some_and(|recipient| allowlist_matches(&allowlist, recipient));

    if unknown_source || !allowlisted {
        tickets
            .set_status(organization_id, &payload.ticket_id, TicketStatus::Spam)
            .await
            .map_err(|err| JobError::retryable(format!("mark spam: {err}")))?;
        tickets
            .record_event(
                organization_id,
                &payload.ticket_id,
                TicketEventKind::AutoSpam,
                serde_json::json!({
                    "recipient": recipient,
                    "recipient_source": occurrence.recipient_source.map(|s| s.as_str()),
                }),
            )
            .await
            .map_err(|err| JobError::retryable(format!("record auto_spam event: {err}")))?;
        occurrences
            .set_routed(organization_id, &occurrence.id, None)
            .await
            .map_err(|err| JobError::retryable(format!("record routed state: {err}")))?;
        info!(
            occurrence_id = %occurrence.id,
            ticket_id = %payload.ticket_id,
            "recipient not allowlisted; ticket marked spam"
        );
        return Ok(());
    }

    let rules = routing
        .list_rules(organization_id)
        .await
        .map_err(|err| JobError::retryable(format!("load routing rules: {err}")))?;
    let input = RoutingInput {
        recipient,
        sender_email: canonical.from_email.clone(),
        direction: Direction::Inbound,
    };

    if let Some(rule) = first_match(&rules, &input) {
        if let Some(route_error) =
            apply_rule(dispatcher, payload, &canonical.id, rule).await?
        {
            // Fail closed: ticket keeps its defaults, the error is visible.
            occurrences
                .set_routed(organization_id, &occurrence.id, Some(&route_error))
                .await
                .map_err(|err| JobError::retryable(format!("record routed state: {err}")))?;
            return Ok(());
        }
    }

    occurrences
        .set_routed(organization_id, &occurrence.id, None)
        .await
        .map_err(|err| JobError::retryable(format!("record routed state: {err}")))?;
    Ok(())
}

/// Apply one matched rule. Returns a route error string when the rule is
/// misconfigured (referencing a queue or user that no longer exists).
async fn apply_rule(
    dispatcher: &JobDispatcher,
    payload: &RoutingJobPayload,
    canonical_id: &str,
    rule: &RoutingRule,
) -> Result<Option<String>, JobError> {
    let organization_id = payload.organization_id.as_str();
    let tickets = TicketRepository::new(dispatcher.db.clone());
    let orgs = OrgRepository::new(dispatcher.db.clone());

    // Drop is exclusive: the ticket and the stitched link vanish.
    if rule.action_drop {
        tickets
            .record_event(
                organization_id,
                &payload.ticket_id,
                TicketEventKind::Dropped,
                serde_json::json!({ "rule_id": rule.id }),
            )
            .await
            .map_err(|err| JobError::retryable(format!("record drop event: {err}")))?;
        CanonicalRepository::new(dispatcher.db.clone())
            .clear_ticket(organization_id, &payload.ticket_id)
            .await
            .map_err(|err| JobError::retryable(format!("clear stitched link: {err}")))?;
        tickets
            .delete(organization_id, &payload.ticket_id)
            .await
            .map_err(|err| JobError::retryable(format!("drop ticket: {err}")))?;
        info!(
            ticket_id = %payload.ticket_id,
            rule_id = %rule.id,
            canonical_message_id = %canonical_id,
            "routing rule dropped ticket"
        );
        return Ok(None);
    }

    if let Some(queue_id) = rule.action_assign_queue_id.as_deref() {
        match orgs.get_queue(organization_id, queue_id).await {
            Ok(_) => {
                tickets
                    .assign_queue(organization_id, &payload.ticket_id, queue_id)
                    .await
                    .map_err(|err| JobError::retryable(format!("assign queue: {err}")))?;
            }
            Err(OrgError::QueueNotFound(_)) => {
                return Ok(Some(format!(
                    "rule {} references missing queue {queue_id}",
                    rule.id
                )));
            }
            Err(err) => {
                return Err(JobError::retryable(format!("queue lookup: {err}")));
            }
        }
    } else if let Some(user_id) = rule.action_assign_user_id.as_deref() {
        match orgs.get_user(organization_id, user_id).await {
            Ok(_) => {
                tickets
                    .assign_user(organization_id, &payload.ticket_id, user_id)
                    .await
                    .map_err(|err| JobError::retryable(format!("assign user: {err}")))?;
            }
            Err(OrgError::UserNotFound(_)) => {
                return Ok(Some(format!(
                    "rule {} references missing user {user_id}",
                    rule.id
                )));
            }
            Err(err) => {
                return Err(JobError::retryable(format!("user lookup: {err}")));
            }
        }
    }

    if let Some(status_str) = rule.action_set_status.as_deref() {
        let Some(status) = TicketStatus::from_str(status_str) else {
            return Ok(Some(format!(
                "rule {} sets unknown status {status_str:?}",
                rule.id
            )));
        };
        tickets
            .set_status(organization_id, &payload.ticket_id, status)
            .await
            .map_err(|err| JobError::retryable(format!("set status: {err}")))?;
    }

    if rule.action_auto_close {
        tickets
            .set_status(organization_id, &payload.ticket_id, TicketStatus::Closed)
            .await
            .map_err(|err| JobError::retryable(format!("auto close: {err}")))?;
        tickets
            .record_event(
                organization_id,
                &payload.ticket_id,
                TicketEventKind::AutoClosed,
                serde_json::json!({ "rule_id": rule.id }),
            )
            .await
            .map_err(|err| JobError::retryable(format!("record auto_close event: {err}")))?;
    }

    tickets
        .record_event(
            organization_id,
            &payload.ticket_id,
            TicketEventKind::RuleApplied,
            serde_json::json!({
                "rule_id": rule.id,
                "actions": rule_actions(rule),
            }),
        )
        .await
        .map_err(|err| JobError::retryable(format!("record rule event: {err}")))?;

    info!(
        ticket_id = %payload.ticket_id,
        rule_id = %rule.id,
        "routing rule applied"
    );
    Ok(None)
}
