use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::mailboxes::Mailbox;

use super::{
    HistoryDelta, HistoryEvent, HistoryEventKind, MessagePage, Profile, Provider, ProviderError,
};

/// Failure the fake injects on the next matching call, then clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeFailure {
    InvalidCursor,
    RateLimited,
    Unauthorized,
}

impl FakeFailure {
    fn to_error(self) -> ProviderError {
        match self {
            FakeFailure::InvalidCursor => ProviderError::InvalidCursor,
            FakeFailure::RateLimited => ProviderError::RateLimited,
            FakeFailure::Unauthorized => ProviderError::Unauthorized,
        }
    }
}

#[derive(Default)]
struct MailboxState {
    /// provider_message_id -> raw rfc822 bytes
    messages: BTreeMap<String, Vec<u8>>,
    /// (sequence, event)
    history: Vec<(u64, HistoryEvent)>,
    cursor: u64,
}

#[derive(Default)]
struct FakeState {
    mailboxes: HashMap<String, MailboxState>,
    history_failures: Vec<FakeFailure>,
    list_failures: Vec<FakeFailure>,
    history_calls: usize,
    page_size: usize,
}

/// Deterministic in-memory provider for tests and local development.
/// Messages are keyed by mailbox email; history cursors are sequence
/// numbers rendered as decimal strings.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a message into a mailbox and record a `message_added` event.
    pub fn deliver(&self, mailbox_email: &str, provider_message_id: &str, raw: &[u8]) {
        let mut state = self.state.lock().expect("fake provider lock");
        let mailbox = state.mailboxes.entry(mailbox_email.to_string()).or_default();
        mailbox.cursor += 1;
        let cursor = mailbox.cursor;
        mailbox
            .messages
            .insert(provider_message_id.to_string(), raw.to_vec());
        mailbox.history.push((
            cursor,
            HistoryEvent {
                kind: HistoryEventKind::MessageAdded,
                provider_message_id: provider_message_id.to_string(),
            },
        ));
    }

    /// Delete a message and record a `message_deleted` event.
    pub fn remove(&self, mailbox_email: &str, provider_message_id: &str) {
        let mut state = self.state.lock().expect("fake provider lock");
        let mailbox = state.mailboxes.entry(mailbox_email.to_string()).or_default();
        mailbox.cursor += 1;
        let cursor = mailbox.cursor;
        mailbox.messages.remove(provider_message_id);
        mailbox.history.push((
            cursor,
            HistoryEvent {
                kind: HistoryEventKind::MessageDeleted,
                provider_message_id: provider_message_id.to_string(),
            },
        ));
    }

    /// Queue failures returned by subsequent `history_delta` calls, in order.
    pub fn fail_history(&self, failures: &[FakeFailure]) {
        let mut state = self.state.lock().expect("fake provider lock");
        state.history_failures.extend_from_slice(failures);
    }

    /// Queue failures returned by subsequent `list_messages` calls, in order.
    pub fn fail_list(&self, failures: &[FakeFailure]) {
        let mut state = self.state.lock().expect("fake provider lock");
        state.list_failures.extend_from_slice(failures);
    }

    /// Page size for `list_messages`; zero means everything on one page.
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().expect("fake provider lock").page_size = page_size;
    }

    pub fn history_calls(&self) -> usize {
        self.state.lock().expect("fake provider lock").history_calls
    }

    pub fn current_cursor(&self, mailbox_email: &str) -> String {
        let state = self.state.lock().expect("fake provider lock");
        state
            .mailboxes
            .get(mailbox_email)
            .map(|m| m.cursor)
            .unwrap_or(0)
            .to_string()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn list_messages(
        &self,
        mailbox: &Mailbox,
        page_token: Option<&str>,
    ) -> Result<MessagePage, ProviderError> {
        let mut state = self.state.lock().expect("fake provider lock");
        if !state.list_failures.is_empty() {
            return Err(state.list_failures.remove(0).to_error());
        }

        let page_size = state.page_size;
        let ids: Vec<String> = state
            .mailboxes
            .get(&mailbox.email)
            .map(|m| m.messages.keys().cloned().collect())
            .unwrap_or_default();

        if page_size == 0 {
            return Ok(MessagePage {
                ids,
                next_page_token: None,
            });
        }

        let offset: usize = page_token
            .map(|token| token.parse().map_err(|_| ProviderError::InvalidCursor))
            .transpose()?
            .unwrap_or(0);
        let page: Vec<String> = ids.iter().skip(offset).take(page_size).cloned().collect();
        let next = (offset + page.len() < ids.len()).then(|| (offset + page.len()).to_string());

        Ok(MessagePage {
            ids: page,
            next_page_token: next,
        })
    }

    async fn history_delta(
        &self,
        mailbox: &Mailbox,
        cursor: &str,
    ) -> Result<HistoryDelta, ProviderError> {
        let mut state = self.state.lock().expect("fake provider lock");
        state.history_calls += 1;
        if !state.history_failures.is_empty() {
            return Err(state.history_failures.remove(0).to_error());
        }

        let since: u64 = cursor.parse().map_err(|_| ProviderError::InvalidCursor)?;
        let mailbox_state = state.mailboxes.entry(mailbox.email.clone()).or_default();

        let events = mailbox_state
            .history
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, event)| event.clone())
            .collect();

        Ok(HistoryDelta {
            events,
            new_cursor: mailbox_state.cursor.to_string(),
        })
    }

    async fn fetch_raw(
        &self,
        mailbox: &Mailbox,
        provider_message_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let state = self.state.lock().expect("fake provider lock");
        state
            .mailboxes
            .get(&mailbox.email)
            .and_then(|m| m.messages.get(provider_message_id))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(provider_message_id.to_string()))
    }

    async fn profile(&self, mailbox: &Mailbox) -> Result<Profile, ProviderError> {
        let state = self.state.lock().expect("fake provider lock");
        let cursor = state
            .mailboxes
            .get(&mailbox.email)
            .map(|m| m.cursor)
            .unwrap_or(0);
        Ok(Profile {
            email: mailbox.email.clone(),
            scopes: vec!["https://mail.google.com/".to_string()],
            history_cursor: Some(cursor.to_string()),
        })
    }
}
