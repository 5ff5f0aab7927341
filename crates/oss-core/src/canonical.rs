use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{
    Database, DbError, is_unique_violation, now_rfc3339, parse_timestamp, require_timestamp,
    to_rfc3339,
};
use crate::mime::EmailAddress;

const CANONICAL_COLUMNS: &str = "id, organization_id, fingerprint_v1, body_text_hash, subject, from_email, from_name, to_json, cc_json, date_header, snippet, body_text, body_html, message_id_header, in_reply_to_json, references_json, reply_to, x_oss_ticket_id, x_oss_message_id, direction, parser_version, sanitizer_revision, ticket_id, created_at, updated_at, collision_group_id";

const ATTACHMENT_COLUMNS: &str = "id, organization_id, canonical_message_id, content_hash, filename, content_type, size_bytes, is_inline, content_id, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// The deduped logical email. N occurrences across N mailboxes may point at
/// one canonical row; a canonical row points at no more than one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalMessage {
    pub id: String,
    pub organization_id: String,
    pub fingerprint_v1: String,
    pub body_text_hash: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub date_header: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub message_id_header: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub reply_to: Option<String>,
    pub x_oss_ticket_id: Option<String>,
    pub x_oss_message_id: Option<String>,
    pub direction: Direction,
    pub parser_version: String,
    pub sanitizer_revision: String,
    pub ticket_id: Option<String>,
    pub collision_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCanonicalMessage {
    pub organization_id: String,
    pub fingerprint_v1: String,
    pub body_text_hash: String,
    pub subject: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub date_header: Option<DateTime<Utc>>,
    pub snippet: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub message_id_header: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub reply_to: Option<String>,
    pub x_oss_ticket_id: Option<String>,
    pub x_oss_message_id: Option<String>,
    pub direction: Direction,
    pub parser_version: String,
    pub sanitizer_revision: String,
}

/// What the fingerprint upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting of this fingerprint.
    Created,
    /// Identical content already existed; the row was refreshed in place.
    Reused,
    /// Same fingerprint, different body hash: a second row now coexists in a
    /// shared collision group.
    Collision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub organization_id: String,
    pub canonical_message_id: String,
    pub content_hash: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub is_inline: bool,
    pub content_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub content_hash: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionGroupSummary {
    pub id: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical message not found: {0}")]
    NotFound(String),
    #[error("invalid direction value {0}")]
    InvalidDirection(String),
    #[error("fingerprint upsert did not converge for {0}")]
    UpsertRace(String),
}

#[derive(Clone)]
pub struct CanonicalRepository {
    db: Database,
}

impl CanonicalRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert on `(organization, fingerprint_v1)`.
    ///
    /// Identical body hash reuses the stored row (refreshing parser output in
    /// place). A differing body hash inserts a sibling row and links every
    /// row of the fingerprint into one collision group. Two workers racing on
    /// the same content are resolved by the unique index: the loser re-reads
    /// the winner's row.
    pub async fn upsert(
        &self,
        new: NewCanonicalMessage,
    ) -> Result<(CanonicalMessage, UpsertOutcome), CanonicalError> {
        let conn = self.db.connection().await?;

        for _ in 0..2 {
            let existing = self
                .rows_by_fingerprint(&conn, &new.organization_id, &new.fingerprint_v1)
                .await?;

            if let Some(row) = existing
                .iter()
                .find(|row| row.body_text_hash == new.body_text_hash)
            {
                let refreshed = self.refresh_in_place(&conn, row, &new).await?;
                return Ok((refreshed, UpsertOutcome::Reused));
            }

            if !existing.is_empty() {
                let group_id = match existing.iter().find_map(|r| r.collision_group_id.clone()) {
                    Some(group_id) => group_id,
                    None => self.create_collision_group(&conn, &new.organization_id).await?,
                };

                match self.insert_row(&conn, &new, Some(&group_id)).await {
                    Ok(inserted) => {
                        conn.execute(
                            "UPDATE canonical_messages
                             SET collision_group_id = ?3, updated_at = ?4
                             WHERE organization_id = ?1 AND fingerprint_v1 = ?2
                               AND collision_group_id IS NULL",
                            params![
                                new.organization_id.clone(),
                                new.fingerprint_v1.clone(),
                                group_id,
                                now_rfc3339()
                            ],
                        )
                        .await?;
                        return Ok((inserted, UpsertOutcome::Collision));
                    }
                    Err(CanonicalError::Sql(err)) if is_unique_violation(&err) => continue,
                    Err(err) => return Err(err),
                }
            }

            match self.insert_row(&conn, &new, None).await {
                Ok(inserted) => return Ok((inserted, UpsertOutcome::Created)),
                Err(CanonicalError::Sql(err)) if is_unique_violation(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Err(CanonicalError::UpsertRace(new.fingerprint_v1))
    }

    pub async fn get(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<CanonicalMessage, CanonicalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CANONICAL_COLUMNS} FROM canonical_messages
                     WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_canonical(row),
            None => Err(CanonicalError::NotFound(id.to_string())),
        }
    }

    pub async fn set_ticket(
        &self,
        organization_id: &str,
        id: &str,
        ticket_id: &str,
    ) -> Result<(), CanonicalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE canonical_messages
                 SET ticket_id = ?3, updated_at = ?4
                 WHERE organization_id = ?1 AND id = ?2
                 RETURNING id",
                params![organization_id, id, ticket_id, now_rfc3339()],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(CanonicalError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Detach every canonical message from a ticket (used by the routing
    /// `drop` action before the ticket row is hard-deleted).
    pub async fn clear_ticket(
        &self,
        organization_id: &str,
        ticket_id: &str,
    ) -> Result<(), CanonicalError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE canonical_messages
             SET ticket_id = NULL, updated_at = ?3
             WHERE organization_id = ?1 AND ticket_id = ?2",
            params![organization_id, ticket_id, now_rfc3339()],
        )
        .await?;
        Ok(())
    }

    /// Map `In-Reply-To` / `References` ids to a ticket through the stored
    /// `Message-ID` headers of already-stitched canonical messages.
    pub async fn find_ticket_by_message_ids(
        &self,
        organization_id: &str,
        message_ids: &[String],
    ) -> Result<Option<String>, CanonicalError> {
        if message_ids.is_empty() {
            return Ok(None);
        }

        let placeholders = (0..message_ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT ticket_id FROM canonical_messages
             WHERE organization_id = ?1 AND ticket_id IS NOT NULL
               AND message_id_header IN ({placeholders})
             ORDER BY created_at
             LIMIT 1"
        );

        let mut values: Vec<libsql::Value> = vec![organization_id.into()];
        for id in message_ids {
            values.push(id.as_str().into());
        }

        let conn = self.db.connection().await?;
        let mut rows = conn.query(&sql, values).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(None),
        }
    }

    /// Record attachment metadata. Returns false when the
    /// `(canonical_message, content_hash)` pair already exists.
    pub async fn add_attachment(
        &self,
        organization_id: &str,
        canonical_message_id: &str,
        new: &NewAttachment,
    ) -> Result<bool, CanonicalError> {
        let conn = self.db.connection().await?;
        let result = conn
            .execute(
                "INSERT INTO attachments (id, organization_id, canonical_message_id, content_hash, filename, content_type, size_bytes, is_inline, content_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    Uuid::new_v4().to_string(),
                    organization_id,
                    canonical_message_id,
                    new.content_hash.clone(),
                    new.filename.clone(),
                    new.content_type.clone(),
                    new.size_bytes,
                    new.is_inline as i64,
                    new.content_id.clone(),
                    now_rfc3339()
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_attachments(
        &self,
        organization_id: &str,
        canonical_message_id: &str,
    ) -> Result<Vec<Attachment>, CanonicalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments
                     WHERE organization_id = ?1 AND canonical_message_id = ?2
                     ORDER BY created_at"
                ),
                params![organization_id, canonical_message_id],
            )
            .await?;

        let mut attachments = Vec::new();
        while let Some(row) = rows.next().await? {
            attachments.push(row_to_attachment(row)?);
        }
        Ok(attachments)
    }

    pub async fn list_collision_groups(
        &self,
        organization_id: &str,
    ) -> Result<Vec<CollisionGroupSummary>, CanonicalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT g.id, COUNT(m.id), g.created_at
                 FROM collision_groups g
                 JOIN canonical_messages m
                   ON m.collision_group_id = g.id AND m.organization_id = g.organization_id
                 WHERE g.organization_id = ?1
                 GROUP BY g.id, g.created_at
                 ORDER BY g.created_at DESC",
                params![organization_id],
            )
            .await?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await? {
            let created_at: String = row.get(2)?;
            groups.push(CollisionGroupSummary {
                id: row.get(0)?,
                message_count: row.get(1)?,
                created_at: require_timestamp(created_at)?,
            });
        }
        Ok(groups)
    }

    /// Admin backfill: scan fingerprints carrying more than one canonical row
    /// and attach a shared collision group wherever one is missing. Returns
    /// the number of rows that gained a group.
    pub async fn assign_missing_collision_groups(
        &self,
        organization_id: &str,
    ) -> Result<usize, CanonicalError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT fingerprint_v1 FROM canonical_messages
                 WHERE organization_id = ?1
                 GROUP BY fingerprint_v1
                 HAVING COUNT(*) > 1 AND COUNT(collision_group_id) < COUNT(*)",
                params![organization_id],
            )
            .await?;

        let mut fingerprints = Vec::new();
        while let Some(row) = rows.next().await? {
            let fingerprint: String = row.get(0)?;
            fingerprints.push(fingerprint);
        }

        let mut assigned = 0;
        for fingerprint in fingerprints {
            let existing = self
                .rows_by_fingerprint(&conn, organization_id, &fingerprint)
                .await?;
            let group_id = match existing.iter().find_map(|r| r.collision_group_id.clone()) {
                Some(group_id) => group_id,
                None => self.create_collision_group(&conn, organization_id).await?,
            };

            assigned += conn
                .execute(
                    "UPDATE canonical_messages
                     SET collision_group_id = ?3, updated_at = ?4
                     WHERE organization_id = ?1 AND fingerprint_v1 = ?2
                       AND collision_group_id IS NULL",
                    params![organization_id, fingerprint, group_id, now_rfc3339()],
                )
                .await? as usize;
        }

        Ok(assigned)
    }

    async fn rows_by_fingerprint(
        &self,
        conn: &Connection,
        organization_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<CanonicalMessage>, CanonicalError> {
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CANONICAL_COLUMNS} FROM canonical_messages
                     WHERE organization_id = ?1 AND fingerprint_v1 = ?2
                     ORDER BY created_at"
                ),
                params![organization_id, fingerprint],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_canonical(row)?);
        }
        Ok(messages)
    }

    async fn refresh_in_place(
        &self,
        conn: &Connection,
        existing: &CanonicalMessage,
        new: &NewCanonicalMessage,
    ) -> Result<CanonicalMessage, CanonicalError> {
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE canonical_messages
                     SET snippet = ?3, body_text = ?4, body_html = ?5,
                         parser_version = ?6, sanitizer_revision = ?7, updated_at = ?8
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {CANONICAL_COLUMNS}"
                ),
                params![
                    existing.organization_id.clone(),
                    existing.id.clone(),
                    new.snippet.clone(),
                    new.body_text.clone(),
                    new.body_html.clone(),
                    new.parser_version.clone(),
                    new.sanitizer_revision.clone(),
                    now_rfc3339()
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_canonical(row),
            None => Err(CanonicalError::NotFound(existing.id.clone())),
        }
    }

    async fn insert_row(
        &self,
        conn: &Connection,
        new: &NewCanonicalMessage,
        collision_group_id: Option<&str>,
    ) -> Result<CanonicalMessage, CanonicalError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let to_json = serde_json::to_string(&new.to)?;
        let cc_json = serde_json::to_string(&new.cc)?;
        let in_reply_to_json = serde_json::to_string(&new.in_reply_to)?;
        let references_json = serde_json::to_string(&new.references)?;

        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO canonical_messages (id, organization_id, fingerprint_v1, body_text_hash, subject, from_email, from_name, to_json, cc_json, date_header, snippet, body_text, body_html, message_id_header, in_reply_to_json, references_json, reply_to, x_oss_ticket_id, x_oss_message_id, direction, parser_version, sanitizer_revision, ticket_id, created_at, updated_at, collision_group_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, NULL, ?23, ?23, ?24)
                     RETURNING {CANONICAL_COLUMNS}"
                ),
                params![
                    id,
                    new.organization_id.clone(),
                    new.fingerprint_v1.clone(),
                    new.body_text_hash.clone(),
                    new.subject.clone(),
                    new.from_email.clone(),
                    new.from_name.clone(),
                    to_json,
                    cc_json,
                    new.date_header.map(to_rfc3339),
                    new.snippet.clone(),
                    new.body_text.clone(),
                    new.body_html.clone(),
                    new.message_id_header.clone(),
                    in_reply_to_json,
                    references_json,
                    new.reply_to.clone(),
                    new.x_oss_ticket_id.clone(),
                    new.x_oss_message_id.clone(),
                    new.direction.as_str(),
                    new.parser_version.clone(),
                    new.sanitizer_revision.clone(),
                    now,
                    collision_group_id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_canonical(row),
            None => Err(CanonicalError::NotFound("insert failed".into())),
        }
    }

    async fn create_collision_group(
        &self,
        conn: &Connection,
        organization_id: &str,
    ) -> Result<String, CanonicalError> {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO collision_groups (id, organization_id, created_at) VALUES (?1, ?2, ?3)",
            params![id.clone(), organization_id, now_rfc3339()],
        )
        .await?;
        Ok(id)
    }
}

fn row_to_canonical(row: Row) -> Result<CanonicalMessage, CanonicalError> {
    let to_json: String = row.get(7)?;
    let cc_json: String = row.get(8)?;
    let date_header: Option<String> = row.get(9)?;
    let in_reply_to_json: String = row.get(14)?;
    let references_json: String = row.get(15)?;
    let direction_str: String = row.get(19)?;
    let created_at: String = row.get(23)?;
    let updated_at: String = row.get(24)?;

    let direction = Direction::from_str(&direction_str)
        .ok_or(CanonicalError::InvalidDirection(direction_str))?;

    Ok(CanonicalMessage {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        fingerprint_v1: row.get(2)?,
        body_text_hash: row.get(3)?,
        subject: row.get(4)?,
        from_email: row.get(5)?,
        from_name: row.get(6)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        date_header: parse_timestamp(date_header)?,
        snippet: row.get(10)?,
        body_text: row.get(11)?,
        body_html: row.get(12)?,
        message_id_header: row.get(13)?,
        in_reply_to: serde_json::from_str(&in_reply_to_json)?,
        references: serde_json::from_str(&references_json)?,
        reply_to: row.get(16)?,
        x_oss_ticket_id: row.get(17)?,
        x_oss_message_id: row.get(18)?,
        direction,
        parser_version: row.get(20)?,
        sanitizer_revision: row.get(21)?,
        ticket_id: row.get(22)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
        collision_group_id: row.get(25)?,
    })
}

fn row_to_attachment(row: Row) -> Result<Attachment, CanonicalError> {
    let is_inline: i64 = row.get(7)?;
    let created_at: String = row.get(9)?;

    Ok(Attachment {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        canonical_message_id: row.get(2)?,
        content_hash: row.get(3)?,
        filename: row.get(4)?,
        content_type: row.get(5)?,
        size_bytes: row.get(6)?,
        is_inline: is_inline != 0,
        content_id: row.get(8)?,
        created_at: require_timestamp(created_at)?,
    })
}
