//! HTTP client for the external message persistence service.
//!
//! The relay never blocks a chat session on persistence: saves are spawned
//! fire-and-forget by the connection handler and failures are only logged.
//! Interactive fetches (`request_history`, `request_chats`) surface failures
//! as a single `error` frame to the requester.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use banter_types::api::{ChatListResponse, HistoryResponse, SaveMessageRequest};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("history service returned {0}")]
    Status(reqwest::StatusCode),
}

/// JSON client for the history service. Cheap to clone; all methods share
/// one connection pool and one request timeout.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    base: String,
    http: reqwest::Client,
}

impl HistoryClient {
    /// `base_url` is the API root including the `/api` prefix, e.g.
    /// `http://localhost:5001/api`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HistoryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let mut base = base_url.into();
        while base.ends_with('/') {
            base.pop();
        }
        Ok(Self { base, http })
    }

    /// `POST {base}/messages/save`; the service answers 201 on success.
    pub async fn save_message(&self, message: &SaveMessageRequest) -> Result<(), HistoryError> {
        let response = self
            .http
            .post(format!("{}/messages/save", self.base))
            .json(message)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::CREATED {
            return Err(HistoryError::Status(response.status()));
        }
        debug!(sender = %message.sender, recipient = %message.recipient, "message saved");
        Ok(())
    }

    /// Fetch up to `limit` stored messages between `username` and `chat_with`
    /// (`chat_with` may be the literal `group`).
    pub async fn message_history(
        &self,
        username: &str,
        chat_with: &str,
        limit: u32,
    ) -> Result<Vec<Value>, HistoryError> {
        let limit = limit.to_string();
        let response = self
            .http
            .get(format!("{}/messages/history", self.base))
            .query(&[
                ("username", username),
                ("chat_with", chat_with),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HistoryError::Status(response.status()));
        }
        let body: HistoryResponse = response.json().await?;
        debug!(user = username, chat_with, count = body.messages.len(), "history fetched");
        Ok(body.messages)
    }

    /// Fetch the list of conversations `username` has taken part in.
    pub async fn chat_list(&self, username: &str) -> Result<Vec<Value>, HistoryError> {
        let response = self
            .http
            .get(format!("{}/chats/list", self.base))
            .query(&[("username", username)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(HistoryError::Status(response.status()));
        }
        let body: ChatListResponse = response.json().await?;
        Ok(body.chats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slashes_from_base_url() {
        let client = HistoryClient::new("http://localhost:5001/api//", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base, "http://localhost:5001/api");
    }
}
