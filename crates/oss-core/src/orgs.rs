use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, require_timestamp};

const ORG_COLUMNS: &str = "id, name, domains_json, created_at, updated_at";
const USER_COLUMNS: &str = "id, organization_id, email, display_name, created_at, updated_at";
const QUEUE_COLUMNS: &str = "id, organization_id, name, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// Domains the org receives mail on; drives to/cc recipient scanning.
    pub domains: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum OrgError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("organization not found: {0}")]
    NotFound(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("queue {0} is still referenced and cannot be deleted")]
    QueueInUse(String),
}

#[derive(Clone)]
pub struct OrgRepository {
    db: Database,
}

impl OrgRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        name: impl Into<String>,
        domains: Vec<String>,
    ) -> Result<Organization, OrgError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let domains_json = serde_json::to_string(&domains)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO organizations (id, name, domains_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     RETURNING {ORG_COLUMNS}"
                ),
                params![id, name.into(), domains_json, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| OrgError::NotFound("insert failed".into()))?;
        row_to_org(row)
    }

    pub async fn get(&self, id: &str) -> Result<Organization, OrgError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ORG_COLUMNS} FROM organizations WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_org(row),
            None => Err(OrgError::NotFound(id.to_string())),
        }
    }

    pub async fn create_user(
        &self,
        organization_id: &str,
        email: impl Into<String>,
        display_name: Option<String>,
    ) -> Result<User, OrgError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO users (id, organization_id, email, display_name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     RETURNING {USER_COLUMNS}"
                ),
                params![id, organization_id, email.into(), display_name, now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| OrgError::UserNotFound("insert failed".into()))?;
        row_to_user(row)
    }

    pub async fn get_user(&self, organization_id: &str, id: &str) -> Result<User, OrgError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE organization_id = ?1 AND id = ?2"),
                params![organization_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_user(row),
            None => Err(OrgError::UserNotFound(id.to_string())),
        }
    }

    pub async fn create_queue(
        &self,
        organization_id: &str,
        name: impl Into<String>,
    ) -> Result<Queue, OrgError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO queues (id, organization_id, name, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     RETURNING {QUEUE_COLUMNS}"
                ),
                params![id, organization_id, name.into(), now],
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| OrgError::QueueNotFound("insert failed".into()))?;
        row_to_queue(row)
    }

    pub async fn get_queue(&self, organization_id: &str, id: &str) -> Result<Queue, OrgError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queues WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_queue(row),
            None => Err(OrgError::QueueNotFound(id.to_string())),
        }
    }

    /// Delete a queue unless a routing rule or a live ticket assignment still
    /// references it.
    pub async fn delete_queue(&self, organization_id: &str, id: &str) -> Result<(), OrgError> {
        let conn = self.db.connection().await?;

        let mut rows = conn
            .query(
                "SELECT
                     (SELECT COUNT(*) FROM routing_rules WHERE organization_id = ?1 AND action_assign_queue_id = ?2)
                   + (SELECT COUNT(*) FROM tickets WHERE organization_id = ?1 AND assignee_queue_id = ?2)",
                params![organization_id, id],
            )
            .await?;
        let references: i64 = rows
            .next()
            .await?
            .ok_or_else(|| OrgError::QueueNotFound(id.to_string()))?
            .get(0)?;
        if references > 0 {
            return Err(OrgError::QueueInUse(id.to_string()));
        }

        let mut rows = conn
            .query(
                "DELETE FROM queues WHERE organization_id = ?1 AND id = ?2 RETURNING id",
                params![organization_id, id],
            )
            .await?;
        if rows.next().await?.is_none() {
            return Err(OrgError::QueueNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn row_to_org(row: Row) -> Result<Organization, OrgError> {
    let domains_json: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        domains: serde_json::from_str(&domains_json)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}

fn row_to_user(row: Row) -> Result<User, OrgError> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(User {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}

fn row_to_queue(row: Row) -> Result<Queue, OrgError> {
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    Ok(Queue {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}
