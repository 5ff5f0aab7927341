use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, is_unique_violation, now_rfc3339, require_timestamp};
use crate::mime::{RecipientConfidence, RecipientEvidence, RecipientSource};

const OCCURRENCE_COLUMNS: &str = "id, organization_id, mailbox_id, provider_message_id, state, raw_blob_hash, canonical_message_id, original_recipient, recipient_source, recipient_confidence, fetch_error, parse_error, stitch_error, route_error, created_at, updated_at";

/// Pipeline position of one appearance of a message in one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceState {
    Discovered,
    Fetched,
    Parsed,
    Stitched,
    Routed,
    Failed,
}

impl OccurrenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceState::Discovered => "discovered",
            OccurrenceState::Fetched => "fetched",
            OccurrenceState::Parsed => "parsed",
            OccurrenceState::Stitched => "stitched",
            OccurrenceState::Routed => "routed",
            OccurrenceState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "discovered" => Some(OccurrenceState::Discovered),
            "fetched" => Some(OccurrenceState::Fetched),
            "parsed" => Some(OccurrenceState::Parsed),
            "stitched" => Some(OccurrenceState::Stitched),
            "routed" => Some(OccurrenceState::Routed),
            "failed" => Some(OccurrenceState::Failed),
            _ => None,
        }
    }
}

/// Pipeline stage names, used to pick the error column a failure lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Parse,
    Stitch,
    Route,
}

impl Stage {
    fn error_column(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch_error",
            Stage::Parse => "parse_error",
            Stage::Stitch => "stitch_error",
            Stage::Route => "route_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub id: String,
    pub organization_id: String,
    pub mailbox_id: String,
    pub provider_message_id: String,
    pub state: OccurrenceState,
    pub raw_blob_hash: Option<String>,
    pub canonical_message_id: Option<String>,
    pub original_recipient: Option<String>,
    pub recipient_source: Option<RecipientSource>,
    pub recipient_confidence: Option<RecipientConfidence>,
    pub fetch_error: Option<String>,
    pub parse_error: Option<String>,
    pub stitch_error: Option<String>,
    pub route_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum OccurrenceError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("occurrence not found: {0}")]
    NotFound(String),
    #[error("invalid occurrence state value {0}")]
    InvalidState(String),
}

#[derive(Clone)]
pub struct OccurrenceRepository {
    db: Database,
}

impl OccurrenceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a discovered occurrence. Re-discovery of a known
    /// `(mailbox, provider_message_id)` pair is a no-op that returns the
    /// existing row, so backfill and history sync can race freely.
    pub async fn upsert_discovered(
        &self,
        organization_id: &str,
        mailbox_id: &str,
        provider_message_id: &str,
    ) -> Result<(Occurrence, bool), OccurrenceError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let inserted = conn
            .query(
                &format!(
                    "INSERT INTO message_occurrences (id, organization_id, mailbox_id, provider_message_id, state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'discovered', ?5, ?5)
                     RETURNING {OCCURRENCE_COLUMNS}"
                ),
                params![id, organization_id, mailbox_id, provider_message_id, now],
            )
            .await;

        match inserted {
            Ok(mut rows) => {
                let row = rows
                    .next()
                    .await?
                    .ok_or_else(|| OccurrenceError::NotFound("insert failed".into()))?;
                Ok((row_to_occurrence(row)?, true))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = self
                    .get_by_provider_id(organization_id, mailbox_id, provider_message_id)
                    .await?;
                Ok((existing, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> Result<Occurrence, OccurrenceError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM message_occurrences WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_occurrence(row),
            None => Err(OccurrenceError::NotFound(id.to_string())),
        }
    }

    pub async fn get_by_provider_id(
        &self,
        organization_id: &str,
        mailbox_id: &str,
        provider_message_id: &str,
    ) -> Result<Occurrence, OccurrenceError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {OCCURRENCE_COLUMNS} FROM message_occurrences
                     WHERE organization_id = ?1 AND mailbox_id = ?2 AND provider_message_id = ?3"
                ),
                params![organization_id, mailbox_id, provider_message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_occurrence(row),
            None => Err(OccurrenceError::NotFound(provider_message_id.to_string())),
        }
    }

    pub async fn set_fetched(
        &self,
        organization_id: &str,
        id: &str,
        raw_blob_hash: &str,
    ) -> Result<Occurrence, OccurrenceError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE message_occurrences
                     SET state = 'fetched', raw_blob_hash = ?3, fetch_error = NULL, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {OCCURRENCE_COLUMNS}"
                ),
                params![organization_id, id, raw_blob_hash, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_occurrence(row),
            None => Err(OccurrenceError::NotFound(id.to_string())),
        }
    }

    pub async fn set_parsed(
        &self,
        organization_id: &str,
        id: &str,
        canonical_message_id: &str,
        evidence: &RecipientEvidence,
    ) -> Result<Occurrence, OccurrenceError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE message_occurrences
                     SET state = 'parsed',
                         canonical_message_id = ?3,
                         original_recipient = ?4,
                         recipient_source = ?5,
                         recipient_confidence = ?6,
                         parse_error = NULL,
                         updated_at = ?7
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {OCCURRENCE_COLUMNS}"
                ),
                params![
                    organization_id,
                    id,
                    canonical_message_id,
                    evidence.original_recipient.clone(),
                    evidence.source.as_str(),
                    evidence.confidence.as_str(),
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_occurrence(row),
            None => Err(OccurrenceError::NotFound(id.to_string())),
        }
    }

    pub async fn set_stitched(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<Occurrence, OccurrenceError> {
        self.set_state(organization_id, id, OccurrenceState::Stitched)
            .await
    }

    pub async fn set_routed(
        &self,
        organization_id: &str,
        id: &str,
        route_error: Option<&str>,
    ) -> Result<Occurrence, OccurrenceError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE message_occurrences
                     SET state = 'routed', route_error = ?3, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {OCCURRENCE_COLUMNS}"
                ),
                params![organization_id, id, route_error, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_occurrence(row),
            None => Err(OccurrenceError::NotFound(id.to_string())),
        }
    }

    /// Record a stage error without changing state; the job layer decides
    /// whether the failure retries or goes terminal.
    pub async fn record_stage_error(
        &self,
        organization_id: &str,
        id: &str,
        stage: Stage,
        error: &str,
    ) -> Result<(), OccurrenceError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE message_occurrences
                     SET {} = ?3, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING id",
                    stage.error_column()
                ),
                params![organization_id, id, error, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(OccurrenceError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Terminal failure: record the stage error and park the occurrence.
    pub async fn set_failed(
        &self,
        organization_id: &str,
        id: &str,
        stage: Stage,
        error: &str,
    ) -> Result<(), OccurrenceError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE message_occurrences
                     SET state = 'failed', {} = ?3, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING id",
                    stage.error_column()
                ),
                params![organization_id, id, error, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(OccurrenceError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn count_by_canonical(
        &self,
        organization_id: &str,
        canonical_message_id: &str,
    ) -> Result<i64, OccurrenceError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM message_occurrences
                 WHERE organization_id = ?1 AND canonical_message_id = ?2",
                params![organization_id, canonical_message_id],
            )
            .await?;
        let count: i64 = rows
            .next()
            .await?
            .ok_or_else(|| OccurrenceError::NotFound(canonical_message_id.to_string()))?
            .get(0)?;
        Ok(count)
    }

    async fn set_state(
        &self,
        organization_id: &str,
        id: &str,
        state: OccurrenceState,
    ) -> Result<Occurrence, OccurrenceError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE message_occurrences
                     SET state = ?3, updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {OCCURRENCE_COLUMNS}"
                ),
                params![organization_id, id, state.as_str(), now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_occurrence(row),
            None => Err(OccurrenceError::NotFound(id.to_string())),
        }
    }
}

fn row_to_occurrence(row: Row) -> Result<Occurrence, OccurrenceError> {
    let state_str: String = row.get(4)?;
    let source_str: Option<String> = row.get(8)?;
    let confidence_str: Option<String> = row.get(9)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    let state = OccurrenceState::from_str(&state_str)
        .ok_or(OccurrenceError::InvalidState(state_str))?;
    let recipient_source = match source_str {
        Some(value) => Some(
            RecipientSource::from_str(&value).ok_or(OccurrenceError::InvalidState(value))?,
        ),
        None => None,
    };
    let recipient_confidence = match confidence_str {
        Some(value) => Some(
            RecipientConfidence::from_str(&value).ok_or(OccurrenceError::InvalidState(value))?,
        ),
        None => None,
    };

    Ok(Occurrence {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        provider_message_id: row.get(3)?,
        state,
        raw_blob_hash: row.get(5)?,
        canonical_message_id: row.get(6)?,
        original_recipient: row.get(7)?,
        recipient_source,
        recipient_confidence,
        fetch_error: row.get(10)?,
        parse_error: row.get(11)?,
        stitch_error: row.get(12)?,
        route_error: row.get(13)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}
