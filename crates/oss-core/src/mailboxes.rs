use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{CredentialCrypto, CryptoError, MailboxCredentials};
use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, require_timestamp, to_rfc3339};

const MAILBOX_COLUMNS: &str = "id, organization_id, purpose, provider, email, credentials_cipher, history_cursor, last_full_sync_at, last_incremental_sync_at, last_sync_error, paused_until, pause_reason, consecutive_sync_failures, sync_status, created_at, updated_at";

pub const PURPOSE_JOURNAL: &str = "journal";
pub const AUTO_PAUSE_REASON: &str = "auto: repeated sync failures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxSyncStatus {
    /// History sync is operating normally.
    Normal,
    /// Credentials were rejected; sync returns early until they are refreshed.
    Degraded,
}

impl MailboxSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxSyncStatus::Normal => "normal",
            MailboxSyncStatus::Degraded => "degraded",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "normal" => Some(MailboxSyncStatus::Normal),
            "degraded" => Some(MailboxSyncStatus::Degraded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: String,
    pub organization_id: String,
    pub purpose: String,
    pub provider: String,
    pub email: String,
    pub credentials_cipher: Option<String>,
    pub history_cursor: Option<String>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub paused_until: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub consecutive_sync_failures: i64,
    pub sync_status: MailboxSyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mailbox {
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| until > now)
    }

    /// `now - last_incremental_sync_at`, falling back to the last full sync.
    pub fn sync_lag(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_incremental_sync_at
            .or(self.last_full_sync_at)
            .map(|at| now - at)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SyncKind {
    Full,
    Incremental,
}

/// Circuit-breaker knobs, read from config at boot.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub threshold: i64,
    pub pause: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            pause: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOutcome {
    pub consecutive_failures: i64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventKind {
    BackfillCompleted,
    InvalidCursorRecovery,
    BreakerTripped,
    Paused,
    Resumed,
    MessageDeleted,
    Degraded,
}

impl SyncEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventKind::BackfillCompleted => "backfill_completed",
            SyncEventKind::InvalidCursorRecovery => "invalid_cursor_recovery",
            SyncEventKind::BreakerTripped => "breaker_tripped",
            SyncEventKind::Paused => "paused",
            SyncEventKind::Resumed => "resumed",
            SyncEventKind::MessageDeleted => "message_deleted",
            SyncEventKind::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub id: String,
    pub organization_id: String,
    pub mailbox_id: String,
    pub kind: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("mailbox not found: {0}")]
    NotFound(String),
    #[error("mailbox {0} has no stored credentials")]
    MissingCredentials(String),
    #[error("invalid sync status value {0}")]
    InvalidSyncStatus(String),
}

#[derive(Clone)]
pub struct MailboxRepository {
    db: Database,
}

impl MailboxRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        organization_id: &str,
        purpose: &str,
        provider: &str,
        email: &str,
        credentials: Option<&MailboxCredentials>,
        crypto: &CredentialCrypto,
    ) -> Result<Mailbox, MailboxError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let sealed = credentials
            .map(|creds| crypto.seal_credentials(creds))
            .transpose()?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO mailboxes (id, organization_id, purpose, provider, email, credentials_cipher, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     RETURNING {MAILBOX_COLUMNS}"
                ),
                params![id, organization_id, purpose, provider, email, sealed, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| MailboxError::NotFound("insert failed".into()))?;
        row_to_mailbox(row)
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> Result<Mailbox, MailboxError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_mailbox(row),
            None => Err(MailboxError::NotFound(id.to_string())),
        }
    }

    pub async fn get_journal(&self, organization_id: &str) -> Result<Mailbox, MailboxError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE organization_id = ?1 AND purpose = ?2"
                ),
                params![organization_id, PURPOSE_JOURNAL],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_mailbox(row),
            None => Err(MailboxError::NotFound(format!(
                "journal mailbox for {organization_id}"
            ))),
        }
    }

    pub async fn credentials(
        &self,
        mailbox: &Mailbox,
        crypto: &CredentialCrypto,
    ) -> Result<MailboxCredentials, MailboxError> {
        let sealed = mailbox
            .credentials_cipher
            .as_deref()
            .ok_or_else(|| MailboxError::MissingCredentials(mailbox.id.clone()))?;
        Ok(crypto.open_credentials(sealed)?)
    }

    /// Store fresh credentials and lift a degraded state. Enqueueing the
    /// follow-up history sync is the caller's decision.
    pub async fn update_credentials(
        &self,
        organization_id: &str,
        id: &str,
        credentials: &MailboxCredentials,
        crypto: &CredentialCrypto,
    ) -> Result<Mailbox, MailboxError> {
        let sealed = crypto.seal_credentials(credentials)?;
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE mailboxes
                     SET credentials_cipher = ?3, sync_status = 'normal', updated_at = ?4
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {MAILBOX_COLUMNS}"
                ),
                params![organization_id, id, sealed, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_mailbox(row),
            None => Err(MailboxError::NotFound(id.to_string())),
        }
    }

    /// Successful sync: advance the cursor, stamp the sync time, clear the
    /// error and reset the failure counter.
    pub async fn record_sync_success(
        &self,
        organization_id: &str,
        id: &str,
        kind: SyncKind,
        cursor: Option<&str>,
    ) -> Result<Mailbox, MailboxError> {
        let now = now_rfc3339();
        let column = match kind {
            SyncKind::Full => "last_full_sync_at",
            SyncKind::Incremental => "last_incremental_sync_at",
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE mailboxes
                     SET {column} = ?3,
                         history_cursor = COALESCE(?4, history_cursor),
                         last_sync_error = NULL,
                         consecutive_sync_failures = 0,
                         updated_at = ?3
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {MAILBOX_COLUMNS}"
                ),
                params![organization_id, id, now, cursor],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_mailbox(row),
            None => Err(MailboxError::NotFound(id.to_string())),
        }
    }

    /// Failed sync: bump the consecutive-failure counter and record the
    /// error. Crossing the breaker threshold sets the pause window.
    pub async fn record_sync_failure(
        &self,
        organization_id: &str,
        id: &str,
        error: &str,
        breaker: &BreakerConfig,
    ) -> Result<BreakerOutcome, MailboxError> {
        let now = Utc::now();
        let now_str = to_rfc3339(now);

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE mailboxes
                 SET consecutive_sync_failures = consecutive_sync_failures + 1,
                     last_sync_error = ?3,
                     updated_at = ?4
                 WHERE organization_id = ?1 AND id = ?2
                 RETURNING consecutive_sync_failures",
                params![organization_id, id, error, now_str.clone()],
            )
            .await?;

        let failures: i64 = rows
            .next()
            .await?
            .ok_or_else(|| MailboxError::NotFound(id.to_string()))?
            .get(0)?;

        let tripped = failures >= breaker.threshold;
        if tripped {
            let until = now + chrono::Duration::from_std(breaker.pause).unwrap_or_default();
            conn.execute(
                "UPDATE mailboxes
                 SET paused_until = ?3, pause_reason = ?4, updated_at = ?5
                 WHERE organization_id = ?1 AND id = ?2",
                params![
                    organization_id,
                    id,
                    to_rfc3339(until),
                    AUTO_PAUSE_REASON,
                    now_str
                ],
            )
            .await?;
            self.record_event(
                organization_id,
                id,
                SyncEventKind::BreakerTripped,
                Some(&format!("{failures} consecutive failures")),
            )
            .await?;
        }

        Ok(BreakerOutcome {
            consecutive_failures: failures,
            tripped,
        })
    }

    pub async fn pause(
        &self,
        organization_id: &str,
        id: &str,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<Mailbox, MailboxError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE mailboxes
                     SET paused_until = ?3, pause_reason = ?4, updated_at = ?5
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {MAILBOX_COLUMNS}"
                ),
                params![organization_id, id, to_rfc3339(until), reason, now],
            )
            .await?;

        let mailbox = match rows.next().await? {
            Some(row) => row_to_mailbox(row)?,
            None => return Err(MailboxError::NotFound(id.to_string())),
        };
        self.record_event(organization_id, id, SyncEventKind::Paused, Some(reason))
            .await?;
        Ok(mailbox)
    }

    /// Clear the pause window and the failure counter so the next sync starts
    /// from a clean slate.
    pub async fn resume(&self, organization_id: &str, id: &str) -> Result<Mailbox, MailboxError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE mailboxes
                     SET paused_until = NULL, pause_reason = NULL,
                         consecutive_sync_failures = 0, updated_at = ?3
                     WHERE organization_id = ?1 AND id = ?2
                     RETURNING {MAILBOX_COLUMNS}"
                ),
                params![organization_id, id, now],
            )
            .await?;

        let mailbox = match rows.next().await? {
            Some(row) => row_to_mailbox(row)?,
            None => return Err(MailboxError::NotFound(id.to_string())),
        };
        self.record_event(organization_id, id, SyncEventKind::Resumed, None)
            .await?;
        Ok(mailbox)
    }

    pub async fn set_degraded(
        &self,
        organization_id: &str,
        id: &str,
        error: &str,
    ) -> Result<(), MailboxError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE mailboxes
                 SET sync_status = 'degraded', last_sync_error = ?3, updated_at = ?4
                 WHERE organization_id = ?1 AND id = ?2
                 RETURNING id",
                params![organization_id, id, error, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(MailboxError::NotFound(id.to_string()));
        }
        self.record_event(organization_id, id, SyncEventKind::Degraded, Some(error))
            .await?;
        Ok(())
    }

    pub async fn record_event(
        &self,
        organization_id: &str,
        mailbox_id: &str,
        kind: SyncEventKind,
        detail: Option<&str>,
    ) -> Result<(), MailboxError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO sync_events (id, organization_id, mailbox_id, kind, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                organization_id,
                mailbox_id,
                kind.as_str(),
                detail,
                now_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn list_events(
        &self,
        organization_id: &str,
        mailbox_id: &str,
        limit: i64,
    ) -> Result<Vec<SyncEvent>, MailboxError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, organization_id, mailbox_id, kind, detail, created_at
                 FROM sync_events
                 WHERE organization_id = ?1 AND mailbox_id = ?2
                 ORDER BY created_at DESC
                 LIMIT ?3",
                params![organization_id, mailbox_id, limit],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            let created_at: String = row.get(5)?;
            events.push(SyncEvent {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                mailbox_id: row.get(2)?,
                kind: row.get(3)?,
                detail: row.get(4)?,
                created_at: require_timestamp(created_at)?,
            });
        }
        Ok(events)
    }
}

fn row_to_mailbox(row: Row) -> Result<Mailbox, MailboxError> {
    let last_full_sync_at: Option<String> = row.get(7)?;
    let last_incremental_sync_at: Option<String> = row.get(8)?;
    let paused_until: Option<String> = row.get(10)?;
    let sync_status_str: String = row.get(13)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    let sync_status = MailboxSyncStatus::from_str(&sync_status_str)
        .ok_or(MailboxError::InvalidSyncStatus(sync_status_str))?;

    Ok(Mailbox {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        purpose: row.get(2)?,
        provider: row.get(3)?,
        email: row.get(4)?,
        credentials_cipher: row.get(5)?,
        history_cursor: row.get(6)?,
        last_full_sync_at: parse_timestamp(last_full_sync_at)?,
        last_incremental_sync_at: parse_timestamp(last_incremental_sync_at)?,
        last_sync_error: row.get(9)?,
        paused_until: parse_timestamp(paused_until)?,
        pause_reason: row.get(11)?,
        consecutive_sync_failures: row.get(12)?,
        sync_status,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}
