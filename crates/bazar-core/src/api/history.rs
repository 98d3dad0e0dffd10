use std::time::Duration;

use tracing::debug;

use crate::error::{ChatError, Result};
use crate::models::{ConversationVisibility, Message, MessageRecord};

/// Something that can serve history pages. The REST client implements
/// this; tests substitute an in-memory source.
pub trait HistorySource: Send + Sync {
    /// One page of a conversation's history, newest-first, as the server
    /// orders it.
    fn fetch_page(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        page: u32,
        page_size: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Message>>> + Send;
}

/// REST client for the history API.
pub struct HistoryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(ChatError::Auth("missing bearer token".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::HistoryFetch(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token,
        })
    }

    /// Tell the server the viewer has read this conversation.
    pub async fn mark_as_read(&self, conversation_id: &str, viewer_id: &str) -> Result<()> {
        let url = format!(
            "{}/conversations/{}/read",
            self.base_url, conversation_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "viewerId": viewer_id }))
            .send()
            .await
            .map_err(|e| ChatError::Dispatch(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Dispatch(format!(
                "mark-as-read rejected ({}): {}",
                status, body
            )));
        }
        Ok(())
    }

    /// Per-user conversation visibility records (hidden/deleted), fetched
    /// on session start. The server owns this state; the client only
    /// projects it.
    pub async fn conversation_state(&self, viewer_id: &str) -> Result<Vec<ConversationVisibility>> {
        let url = format!("{}/users/{}/conversation-state", self.base_url, viewer_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ChatError::HistoryFetch(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth("conversation-state fetch unauthorized".into()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::HistoryFetch(format!(
                "conversation-state failed ({}): {}",
                status, body
            )));
        }

        response
            .json::<Vec<ConversationVisibility>>()
            .await
            .map_err(|e| ChatError::HistoryFetch(e.to_string()))
    }
}

impl HistorySource for HistoryClient {
    async fn fetch_page(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<Message>> {
        let url = format!("{}/conversations/{}/messages", self.base_url, conversation_id);
        debug!(%conversation_id, page, page_size, "fetching history page");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("viewer", viewer_id),
                ("page", &page.to_string()),
                ("pageSize", &page_size.to_string()),
            ])
            .send()
            .await
            .map_err(|e| ChatError::HistoryFetch(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth("history fetch unauthorized".into()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::HistoryFetch(format!(
                "history fetch failed ({}): {}",
                status, body
            )));
        }

        let records: Vec<MessageRecord> = response
            .json()
            .await
            .map_err(|e| ChatError::HistoryFetch(e.to_string()))?;
        Ok(records.into_iter().map(MessageRecord::into_message).collect())
    }
}
