use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, require_timestamp, to_rfc3339};

const TICKET_COLUMNS: &str = "id, organization_id, code, subject, normalized_subject, status, priority, requester_email, requester_name, assignee_user_id, assignee_queue_id, reply_token, stitch_reason, stitch_confidence, last_activity_at, closed_at, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Open,
    Pending,
    Resolved,
    Closed,
    Spam,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::Open => "open",
            TicketStatus::Pending => "pending",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
            TicketStatus::Spam => "spam",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "new" => Some(TicketStatus::New),
            "open" => Some(TicketStatus::Open),
            "pending" => Some(TicketStatus::Pending),
            "resolved" => Some(TicketStatus::Resolved),
            "closed" => Some(TicketStatus::Closed),
            "spam" => Some(TicketStatus::Spam),
            _ => None,
        }
    }

    /// Subject-match stitching only considers tickets still in play.
    pub fn is_open_for_stitching(&self) -> bool {
        matches!(
            self,
            TicketStatus::New | TicketStatus::Open | TicketStatus::Pending
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StitchReason {
    NewTicket,
    XOssMarker,
    ReplyToToken,
    ReferencesGraph,
    SubjectMatch,
}

impl StitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StitchReason::NewTicket => "new_ticket",
            StitchReason::XOssMarker => "x_oss_marker",
            StitchReason::ReplyToToken => "reply_to_token",
            StitchReason::ReferencesGraph => "references_graph",
            StitchReason::SubjectMatch => "subject_match",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "new_ticket" => Some(StitchReason::NewTicket),
            "x_oss_marker" => Some(StitchReason::XOssMarker),
            "reply_to_token" => Some(StitchReason::ReplyToToken),
            "references_graph" => Some(StitchReason::ReferencesGraph),
            "subject_match" => Some(StitchReason::SubjectMatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StitchConfidence {
    High,
    Medium,
    Low,
}

impl StitchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            StitchConfidence::High => "high",
            StitchConfidence::Medium => "medium",
            StitchConfidence::Low => "low",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "high" => Some(StitchConfidence::High),
            "medium" => Some(StitchConfidence::Medium),
            "low" => Some(StitchConfidence::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: String,
    pub organization_id: String,
    pub code: String,
    pub subject: Option<String>,
    pub normalized_subject: Option<String>,
    pub status: TicketStatus,
    pub priority: String,
    pub requester_email: Option<String>,
    pub requester_name: Option<String>,
    pub assignee_user_id: Option<String>,
    pub assignee_queue_id: Option<String>,
    pub reply_token: String,
    pub stitch_reason: StitchReason,
    pub stitch_confidence: Option<StitchConfidence>,
    pub last_activity_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub organization_id: String,
    pub subject: Option<String>,
    pub normalized_subject: Option<String>,
    pub requester_email: Option<String>,
    pub requester_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketEventKind {
    Created,
    MessageAttached,
    StatusChanged,
    Assigned,
    AutoSpam,
    AutoClosed,
    RuleApplied,
    Dropped,
}

impl TicketEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketEventKind::Created => "created",
            TicketEventKind::MessageAttached => "message_attached",
            TicketEventKind::StatusChanged => "status_changed",
            TicketEventKind::Assigned => "assigned",
            TicketEventKind::AutoSpam => "auto_spam",
            TicketEventKind::AutoClosed => "auto_closed",
            TicketEventKind::RuleApplied => "rule_applied",
            TicketEventKind::Dropped => "dropped",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TicketEvent {
    pub id: String,
    pub organization_id: String,
    pub ticket_id: String,
    pub kind: String,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ticket not found: {0}")]
    NotFound(String),
    #[error("invalid ticket column value {0}")]
    InvalidValue(String),
}

#[derive(Clone)]
pub struct TicketRepository {
    db: Database,
}

impl TicketRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewTicket) -> Result<Ticket, TicketError> {
        let id = Uuid::new_v4().to_string();
        let code = generate_code();
        let reply_token = Uuid::new_v4().simple().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO tickets (id, organization_id, code, subject, normalized_subject, status, priority, requester_email, requester_name, reply_token, stitch_reason, last_activity_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'new', 'normal', ?6, ?7, ?8, 'new_ticket', ?9, ?9, ?9)
                     RETURNING {TICKET_COLUMNS}"
                ),
                params![
                    id.clone(),
                    new.organization_id.clone(),
                    code,
                    new.subject,
                    new.normalized_subject,
                    new.requester_email,
                    new.requester_name,
                    reply_token,
                    now
                ],
            )
            .await?;

        let ticket = match rows.next().await? {
            Some(row) => row_to_ticket(row)?,
            None => return Err(TicketError::NotFound("insert failed".into())),
        };

        self.record_event(
            &new.organization_id,
            &id,
            TicketEventKind::Created,
            serde_json::json!({ "code": ticket.code }),
        )
        .await?;
        Ok(ticket)
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> Result<Ticket, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_ticket(row),
            None => Err(TicketError::NotFound(id.to_string())),
        }
    }

    pub async fn exists(&self, organization_id: &str, id: &str) -> Result<bool, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM tickets WHERE organization_id = ?1 AND id = ?2 LIMIT 1",
                params![organization_id, id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn find_by_reply_token(
        &self,
        organization_id: &str,
        reply_token: &str,
    ) -> Result<Option<Ticket>, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets
                     WHERE organization_id = ?1 AND reply_token = ?2"
                ),
                params![organization_id, reply_token],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_ticket(row)?)),
            None => Ok(None),
        }
    }

    /// Most recently active open ticket with the same normalized subject and
    /// requester inside the window.
    pub async fn find_open_by_subject(
        &self,
        organization_id: &str,
        normalized_subject: &str,
        requester_email: &str,
        active_since: DateTime<Utc>,
    ) -> Result<Option<Ticket>, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets
                     WHERE organization_id = ?1
                       AND requester_email = ?2
                       AND normalized_subject = ?3
                       AND status IN ('new', 'open', 'pending')
                       AND last_activity_at >= ?4
                     ORDER BY last_activity_at DESC
                     LIMIT 1"
                ),
                params![
                    organization_id,
                    requester_email,
                    normalized_subject,
                    to_rfc3339(active_since)
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_ticket(row)?)),
            None => Ok(None),
        }
    }

    pub async fn set_status(
        &self,
        organization_id: &str,
        id: &str,
        status: TicketStatus,
    ) -> Result<Ticket, TicketError> {
        let now = now_rfc3339();
        let closed_at = matches!(status, TicketStatus::Closed).then(|| now.clone());

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE tickets
                     SET status = ?3, closed_at = ?4, updated_at = ?5
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {TICKET_COLUMNS}"
                ),
                params![organization_id, id, status.as_str(), closed_at, now],
            )
            .await?;

        let ticket = match rows.next().await? {
            Some(row) => row_to_ticket(row)?,
            None => return Err(TicketError::NotFound(id.to_string())),
        };

        self.record_event(
            organization_id,
            id,
            TicketEventKind::StatusChanged,
            serde_json::json!({ "status": status.as_str() }),
        )
        .await?;
        Ok(ticket)
    }

    /// Assign to a user, clearing any queue assignment (and vice versa); the
    /// two are mutually exclusive by schema and by construction here.
    pub async fn assign_user(
        &self,
        organization_id: &str,
        id: &str,
        user_id: &str,
    ) -> Result<Ticket, TicketError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE tickets
                     SET assignee_user_id = ?3, assignee_queue_id = NULL, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {TICKET_COLUMNS}"
                ),
                params![organization_id, id, user_id, now],
            )
            .await?;

        let ticket = match rows.next().await? {
            Some(row) => row_to_ticket(row)?,
            None => return Err(TicketError::NotFound(id.to_string())),
        };
        self.record_event(
            organization_id,
            id,
            TicketEventKind::Assigned,
            serde_json::json!({ "user_id": user_id }),
        )
        .await?;
        Ok(ticket)
    }

    pub async fn assign_queue(
        &self,
        organization_id: &str,
        id: &str,
        queue_id: &str,
    ) -> Result<Ticket, TicketError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE tickets
                     SET assignee_queue_id = ?3, assignee_user_id = NULL, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {TICKET_COLUMNS}"
                ),
                params![organization_id, id, queue_id, now],
            )
            .await?;

        let ticket = match rows.next().await? {
            Some(row) => row_to_ticket(row)?,
            None => return Err(TicketError::NotFound(id.to_string())),
        };
        self.record_event(
            organization_id,
            id,
            TicketEventKind::Assigned,
            serde_json::json!({ "queue_id": queue_id }),
        )
        .await?;
        Ok(ticket)
    }

    pub async fn record_stitch(
        &self,
        organization_id: &str,
        id: &str,
        reason: StitchReason,
        confidence: Option<StitchConfidence>,
    ) -> Result<(), TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE tickets
                 SET stitch_reason = ?3, stitch_confidence = ?4, updated_at = ?5
                 WHERE organization_id = ?1 AND id = ?2
                 RETURNING id",
                params![
                    organization_id,
                    id,
                    reason.as_str(),
                    confidence.map(|c| c.as_str()),
                    now_rfc3339()
                ],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(TicketError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn touch_activity(
        &self,
        organization_id: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE tickets
                 SET last_activity_at = ?3, updated_at = ?4
                 WHERE organization_id = ?1 AND id = ?2
                 RETURNING id",
                params![organization_id, id, to_rfc3339(at), now_rfc3339()],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(TicketError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Hard delete (routing `drop` action). Audit events survive on purpose.
    pub async fn delete(&self, organization_id: &str, id: &str) -> Result<(), TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM tickets WHERE organization_id = ?1 AND id = ?2 RETURNING id",
                params![organization_id, id],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(TicketError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn record_event(
        &self,
        organization_id: &str,
        ticket_id: &str,
        kind: TicketEventKind,
        detail: Value,
    ) -> Result<(), TicketError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO ticket_events (id, organization_id, ticket_id, kind, detail_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                organization_id,
                ticket_id,
                kind.as_str(),
                serde_json::to_string(&detail)?,
                now_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn list_events(
        &self,
        organization_id: &str,
        ticket_id: &str,
    ) -> Result<Vec<TicketEvent>, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, organization_id, ticket_id, kind, detail_json, created_at
                 FROM ticket_events
                 WHERE organization_id = ?1 AND ticket_id = ?2
                 ORDER BY created_at",
                params![organization_id, ticket_id],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            let detail_json: String = row.get(4)?;
            let created_at: String = row.get(5)?;
            events.push(TicketEvent {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                ticket_id: row.get(2)?,
                kind: row.get(3)?,
                detail: serde_json::from_str(&detail_json)?,
                created_at: require_timestamp(created_at)?,
            });
        }
        Ok(events)
    }
}

fn generate_code() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("T-{}", id[..8].to_uppercase())
}

fn row_to_ticket(row: Row) -> Result<Ticket, TicketError> {
    let status_str: String = row.get(5)?;
    let stitch_reason_str: String = row.get(12)?;
    let stitch_confidence_str: Option<String> = row.get(13)?;
    let last_activity_at: String = row.get(14)?;
    let closed_at: Option<String> = row.get(15)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    let status =
        TicketStatus::from_str(&status_str).ok_or(TicketError::InvalidValue(status_str))?;
    let stitch_reason = StitchReason::from_str(&stitch_reason_str)
        .ok_or(TicketError::InvalidValue(stitch_reason_str))?;
    let stitch_confidence = match stitch_confidence_str {
        Some(value) => {
            Some(StitchConfidence::from_str(&value).ok_or(TicketError::InvalidValue(value))?)
        }
        None => None,
    };

    Ok(Ticket {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        code: row.get(2)?,
        subject: row.get(3)?,
        normalized_subject: row.get(4)?,
        status,
        priority: row.get(6)?,
        requester_email: row.get(7)?,
        requester_name: row.get(8)?,
        assignee_user_id: row.get(9)?,
        assignee_queue_id: row.get(10)?,
        reply_token: row.get(11)?,
        stitch_reason,
        stitch_confidence,
        last_activity_at: require_timestamp(last_activity_at)?,
        closed_at: parse_timestamp(closed_at)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}
