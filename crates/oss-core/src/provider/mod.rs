use async_trait::async_trait;
use thiserror::Error;

use crate::mailboxes::Mailbox;

mod fake;
mod gmail;

pub use fake::{FakeFailure, FakeProvider};
pub use gmail::GmailProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEventKind {
    MessageAdded,
    MessageDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEvent {
    pub kind: HistoryEventKind,
    pub provider_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryDelta {
    pub events: Vec<HistoryEvent>,
    pub new_cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub email: String,
    pub scopes: Vec<String>,
    /// The provider's current history cursor, recorded by backfill so the
    /// first incremental sync starts from "now".
    pub history_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The stored history cursor is no longer usable. Never retried in
    /// place; deterministically triggers backfill recovery.
    #[error("history cursor is invalid or expired")]
    InvalidCursor,
    #[error("provider rejected credentials")]
    Unauthorized,
    #[error("provider resource not found: {0}")]
    NotFound(String),
    #[error("provider rate limited")]
    RateLimited,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("provider api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("mailbox has no stored credentials")]
    MissingCredentials,
    #[error("credential decryption failed: {0}")]
    Credentials(String),
}

impl ProviderError {
    /// Everything except an invalid cursor is worth retrying with backoff;
    /// auth errors additionally degrade the mailbox at the call site.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::InvalidCursor)
    }
}

/// The mailbox provider the sync controller and pipeline consume. One
/// instance serves every mailbox; per-mailbox state rides on the `Mailbox`
/// row (address, sealed credentials, cursor).
#[async_trait]
pub trait Provider: Send + Sync {
    async fn list_messages(
        &self,
        mailbox: &Mailbox,
        page_token: Option<&str>,
    ) -> Result<MessagePage, ProviderError>;

    async fn history_delta(
        &self,
        mailbox: &Mailbox,
        cursor: &str,
    ) -> Result<HistoryDelta, ProviderError>;

    async fn fetch_raw(
        &self,
        mailbox: &Mailbox,
        provider_message_id: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    async fn profile(&self, mailbox: &Mailbox) -> Result<Profile, ProviderError>;
}
