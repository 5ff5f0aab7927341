use chrono::{DateTime, Utc};
use globset::Glob;
use libsql::{Row, params};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::canonical::Direction;
use crate::db::{Database, DbError, now_rfc3339, require_timestamp};

const ALLOWLIST_COLUMNS: &str = "id, organization_id, pattern, enabled, created_at, updated_at";
const RULE_COLUMNS: &str = "id, organization_id, priority, enabled, description, recipient_pattern, sender_domain_pattern, sender_email_pattern, direction, action_assign_queue_id, action_assign_user_id, action_set_status, action_drop, action_auto_close, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistEntry {
    pub id: String,
    pub organization_id: String,
    pub pattern: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub id: String,
    pub organization_id: String,
    pub priority: i64,
    pub enabled: bool,
    pub description: Option<String>,
    pub recipient_pattern: Option<String>,
    pub sender_domain_pattern: Option<String>,
    pub sender_email_pattern: Option<String>,
    pub direction: Option<Direction>,
    pub action_assign_queue_id: Option<String>,
    pub action_assign_user_id: Option<String>,
    pub action_set_status: Option<String>,
    pub action_drop: bool,
    pub action_auto_close: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRoutingRule {
    pub priority: i64,
    pub enabled: bool,
    pub description: Option<String>,
    pub recipient_pattern: Option<String>,
    pub sender_domain_pattern: Option<String>,
    pub sender_email_pattern: Option<String>,
    pub direction: Option<Direction>,
    pub action_assign_queue_id: Option<String>,
    pub action_assign_user_id: Option<String>,
    pub action_set_status: Option<String>,
    pub action_drop: bool,
    pub action_auto_close: bool,
}

/// The evaluator's view of one occurrence.
#[derive(Debug, Clone)]
pub struct RoutingInput {
    pub recipient: Option<String>,
    pub sender_email: Option<String>,
    pub direction: Direction,
}

/// Outcome of a dry routing evaluation; the live path applies the same
/// matched rule, so simulate answers "what would happen" exactly.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub allowlisted: bool,
    pub would_mark_spam: bool,
    pub matched_rule_id: Option<String>,
    pub applied_actions: Vec<String>,
    pub explanation: String,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("routing rule not found: {0}")]
    NotFound(String),
    #[error("invalid direction value {0}")]
    InvalidDirection(String),
}

#[derive(Clone)]
pub struct RoutingRepository {
    db: Database,
}

impl RoutingRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn add_allowlist_entry(
        &self,
        organization_id: &str,
        pattern: &str,
        enabled: bool,
    ) -> Result<AllowlistEntry, RoutingError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO routing_allowlist (id, organization_id, pattern, enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     RETURNING {ALLOWLIST_COLUMNS}"
                ),
                params![id, organization_id, pattern.to_lowercase(), enabled as i64, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_allowlist(row),
            None => Err(RoutingError::NotFound("allowlist insert failed".into())),
        }
    }

    pub async fn list_allowlist(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AllowlistEntry>, RoutingError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ALLOWLIST_COLUMNS} FROM routing_allowlist
                     WHERE organization_id = ?1
                     ORDER BY pattern"
                ),
                params![organization_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(row_to_allowlist(row)?);
        }
        Ok(entries)
    }

    pub async fn create_rule(
        &self,
        organization_id: &str,
        new: NewRoutingRule,
    ) -> Result<RoutingRule, RoutingError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO routing_rules (id, organization_id, priority, enabled, description, recipient_pattern, sender_domain_pattern, sender_email_pattern, direction, action_assign_queue_id, action_assign_user_id, action_set_status, action_drop, action_auto_close, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                     RETURNING {RULE_COLUMNS}"
                ),
                params![
                    id,
                    organization_id,
                    new.priority,
                    new.enabled as i64,
                    new.description,
                    new.recipient_pattern.map(|p| p.to_lowercase()),
                    new.sender_domain_pattern.map(|p| p.to_lowercase()),
                    new.sender_email_pattern.map(|p| p.to_lowercase()),
                    new.direction.map(|d| d.as_str()),
                    new.action_assign_queue_id,
                    new.action_assign_user_id,
                    new.action_set_status,
                    new.action_drop as i64,
                    new.action_auto_close as i64,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RoutingError::NotFound("rule insert failed".into())),
        }
    }

    /// Rules in evaluation order (ascending priority, stable by creation).
    pub async fn list_rules(&self, organization_id: &str) -> Result<Vec<RoutingRule>, RoutingError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM routing_rules
                     WHERE organization_id = ?1
                     ORDER BY priority, created_at"
                ),
                params![organization_id],
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }
}

/// Glob match against a lowercased value. A pattern that fails to compile
/// matches nothing.
fn glob_match(pattern: &str, value: &str) -> bool {
    match Glob::new(&pattern.to_lowercase()) {
        Ok(glob) => glob.compile_matcher().is_match(value.to_lowercase()),
        Err(err) => {
            warn!(pattern, error = %err, "unparseable routing glob");
            false
        }
    }
}

pub fn allowlist_matches(entries: &[AllowlistEntry], recipient: &str) -> bool {
    entries
        .iter()
        .filter(|entry| entry.enabled)
        .any(|entry| glob_match(&entry.pattern, recipient))
}

/// Empty predicates match everything; non-empty predicates glob-match the
/// lowercased value.
pub fn rule_matches(rule: &RoutingRule, input: &RoutingInput) -> bool {
    if let Some(required) = rule.direction {
        if required != input.direction {
            return false;
        }
    }

    if let Some(pattern) = rule.recipient_pattern.as_deref() {
        match input.recipient.as_deref() {
            Some(recipient) if glob_match(pattern, recipient) => {}
            _ => return false,
        }
    }

    if let Some(pattern) = rule.sender_email_pattern.as_deref() {
        match input.sender_email.as_deref() {
            Some(sender) if glob_match(pattern, sender) => {}
            _ => return false,
        }
    }

    if let Some(pattern) = rule.sender_domain_pattern.as_deref() {
        let domain = input
            .sender_email
            .as_deref()
            .and_then(|email| email.rsplit_once('@'))
            .map(|(_, domain)| domain);
        match domain {
            Some(domain) if glob_match(pattern, domain) => {}
            _ => return false,
        }
    }

    true
}

pub fn first_match<'r>(rules: &'r [RoutingRule], input: &RoutingInput) -> Option<&'r RoutingRule> {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .find(|rule| rule_matches(rule, input))
}

pub fn rule_actions(rule: &RoutingRule) -> Vec<String> {
    let mut actions = Vec::new();
    if let Some(queue) = &rule.action_assign_queue_id {
        actions.push(format!("assign_queue:{queue}"));
    }
    if let Some(user) = &rule.action_assign_user_id {
        actions.push(format!("assign_user:{user}"));
    }
    if let Some(status) = &rule.action_set_status {
        actions.push(format!("set_status:{status}"));
    }
    if rule.action_drop {
        actions.push("drop".to_string());
    }
    if rule.action_auto_close {
        actions.push("auto_close".to_string());
    }
    actions
}

/// Dry-run the §4.D.4 decision: allowlist gate first, then the first
/// matching enabled rule in ascending priority.
pub fn simulate(
    allowlist: &[AllowlistEntry],
    rules: &[RoutingRule],
    input: &RoutingInput,
) -> RoutingDecision {
    let allowlisted = input
        .recipient
        .as_deref()
        .is_some_and(|recipient| allowlist_matches(allowlist, recipient));

    if input.direction == Direction::Outbound {
        return RoutingDecision {
            allowlisted,
            would_mark_spam: false,
            matched_rule_id: None,
            applied_actions: Vec::new(),
            explanation: "outbound occurrences are not routed".to_string(),
        };
    }

    if !allowlisted {
        return RoutingDecision {
            allowlisted: false,
            would_mark_spam: true,
            matched_rule_id: None,
            applied_actions: Vec::new(),
            explanation: match input.recipient.as_deref() {
                Some(recipient) => {
                    format!("recipient {recipient} matches no enabled allowlist pattern")
                }
                None => "no recipient evidence".to_string(),
            },
        };
    }

    match first_match(rules, input) {
        Some(rule) => RoutingDecision {
            allowlisted: true,
            would_mark_spam: false,
            matched_rule_id: Some(rule.id.clone()),
            applied_actions: rule_actions(rule),
            explanation: format!(
                "rule priority {} ({}) matches first",
                rule.priority,
                rule.description.as_deref().unwrap_or("unnamed")
            ),
        },
        None => RoutingDecision {
            allowlisted: true,
            would_mark_spam: false,
            matched_rule_id: None,
            applied_actions: Vec::new(),
            explanation: "no routing rule matches; ticket keeps its defaults".to_string(),
        },
    }
}

fn row_to_allowlist(row: Row) -> Result<AllowlistEntry, RoutingError> {
    let enabled: i64 = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(AllowlistEntry {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        pattern: row.get(2)?,
        enabled: enabled != 0,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}

fn row_to_rule(row: Row) -> Result<RoutingRule, RoutingError> {
    let enabled: i64 = row.get(3)?;
    let direction_str: Option<String> = row.get(8)?;
    let action_drop: i64 = row.get(12)?;
    let action_auto_close: i64 = row.get(13)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    let direction = match direction_str {
        Some(value) => {
            Some(Direction::from_str(&value).ok_or(RoutingError::InvalidDirection(value))?)
        }
        None => None,
    };

    Ok(RoutingRule {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        priority: row.get(2)?,
        enabled: enabled != 0,
        description: row.get(4)?,
        recipient_pattern: row.get(5)?,
        sender_domain_pattern: row.get(6)?,
        sender_email_pattern: row.get(7)?,
        direction,
        action_assign_queue_id: row.get(9)?,
        action_assign_user_id: row.get(10)?,
        action_set_status: row.get(11)?,
        action_drop: action_drop != 0,
        action_auto_close: action_auto_close != 0,
        created_at: require_timestamp(created_at)?,
        updated_at: require_timestamp(updated_at)?,
    })
}
