use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::crypto::CredentialCrypto;
use crate::mailboxes::Mailbox;

use super::{
    HistoryDelta, HistoryEvent, HistoryEventKind, MessagePage, Profile, Provider, ProviderError,
};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";

/// Gmail-shaped provider. Authenticates each call with the access token from
/// the mailbox's sealed credentials; token refresh happens outside the core.
pub struct GmailProvider {
    http: Client,
    api_base: String,
    crypto: CredentialCrypto,
}

impl GmailProvider {
    pub fn new(http: Client, crypto: CredentialCrypto) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            crypto,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn bearer_token(&self, mailbox: &Mailbox) -> Result<String, ProviderError> {
        let sealed = mailbox
            .credentials_cipher
            .as_deref()
            .ok_or(ProviderError::MissingCredentials)?;
        let credentials = self
            .crypto
            .open_credentials(sealed)
            .map_err(|err| ProviderError::Credentials(err.to_string()))?;
        Ok(credentials.access_token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        mailbox: &Mailbox,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let token = self.bearer_token(mailbox)?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => Err(ProviderError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                // 429 is an explicit rate limit; 403 usually means
                // userRateLimitExceeded on this API.
                Err(ProviderError::RateLimited)
            }
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound(url.to_string())),
            status if status.is_success() => {
                let body = response.text().await?;
                Ok(serde_json::from_str(&body)?)
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(ProviderError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    history_id: Option<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageChange>,
    #[serde(default)]
    messages_deleted: Vec<MessageChange>,
}

#[derive(Debug, Deserialize)]
struct MessageChange {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageResponse {
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
    history_id: Option<String>,
}

#[async_trait]
impl Provider for GmailProvider {
    async fn list_messages(
        &self,
        mailbox: &Mailbox,
        page_token: Option<&str>,
    ) -> Result<MessagePage, ProviderError> {
        let url = format!("{}/{}/messages", self.api_base, mailbox.email);
        let mut query: Vec<(&str, &str)> = vec![("includeSpamTrash", "true")];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let response: ListMessagesResponse = self.get_json(mailbox, &url, &query).await?;
        Ok(MessagePage {
            ids: response.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn history_delta(
        &self,
        mailbox: &Mailbox,
        cursor: &str,
    ) -> Result<HistoryDelta, ProviderError> {
        let url = format!("{}/{}/history", self.api_base, mailbox.email);
        let mut events = Vec::new();
        let mut new_cursor: Option<String> = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, &str)> = vec![("startHistoryId", cursor)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let response: HistoryResponse = match self.get_json(mailbox, &url, &query).await {
                Ok(response) => response,
                // Gmail reports an expired startHistoryId as 404.
                Err(ProviderError::NotFound(_)) => return Err(ProviderError::InvalidCursor),
                Err(err) => return Err(err),
            };

            if response.history_id.is_some() {
                new_cursor = response.history_id;
            }

            for record in response.history {
                for change in record.messages_added {
                    events.push(HistoryEvent {
                        kind: HistoryEventKind::MessageAdded,
                        provider_message_id: change.message.id,
                    });
                }
                for change in record.messages_deleted {
                    events.push(HistoryEvent {
                        kind: HistoryEventKind::MessageDeleted,
                        provider_message_id: change.message.id,
                    });
                }
            }

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(HistoryDelta {
            events,
            new_cursor: new_cursor.unwrap_or_else(|| cursor.to_string()),
        })
    }

    async fn fetch_raw(
        &self,
        mailbox: &Mailbox,
        provider_message_id: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/{}/messages/{}",
            self.api_base, mailbox.email, provider_message_id
        );
        let response: RawMessageResponse = self
            .get_json(mailbox, &url, &[("format", "raw")])
            .await
            .map_err(|err| match err {
                ProviderError::NotFound(_) => {
                    ProviderError::NotFound(provider_message_id.to_string())
                }
                other => other,
            })?;

        let raw = response
            .raw
            .ok_or_else(|| ProviderError::NotFound(provider_message_id.to_string()))?;
        decode_raw(&raw).ok_or(ProviderError::Api {
            status: 200,
            message: "raw message payload is not valid base64".to_string(),
        })
    }

    async fn profile(&self, mailbox: &Mailbox) -> Result<Profile, ProviderError> {
        let url = format!("{}/{}/profile", self.api_base, mailbox.email);
        let response: ProfileResponse = self.get_json(mailbox, &url, &[]).await?;
        Ok(Profile {
            email: response.email_address,
            scopes: Vec::new(),
            history_cursor: response.history_id,
        })
    }
}

fn decode_raw(data: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| URL_SAFE.decode(data))
        .or_else(|_| STANDARD.decode(data))
        .ok()
}
