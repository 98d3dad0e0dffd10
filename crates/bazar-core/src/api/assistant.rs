use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChatError, Result};
use crate::models::{Message, ProductSuggestion};

/// Structured reply from the assistant API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantReply {
    pub reply_text: String,
    #[serde(default)]
    pub suggested_products: Vec<ProductSuggestion>,
    #[serde(default)]
    pub clarifying_question: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatTurn {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    user_id: String,
    history: Vec<ChatTurn>,
}

/// The assistant request/response surface. The API is stateless per
/// call; the caller supplies a bounded trailing window of prior turns.
pub trait AssistantApi: Send + Sync {
    fn chat(
        &self,
        message: &str,
        user_id: &str,
        history: &[Message],
    ) -> impl std::future::Future<Output = Result<AssistantReply>> + Send;
}

/// REST client for the AI assistant endpoint.
pub struct AssistantClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    context_window: usize,
}

impl AssistantClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
        context_window: usize,
    ) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(ChatError::Auth("missing bearer token".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Dispatch(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token,
            context_window,
        })
    }

    /// The trailing context window: the most recent turns, oldest first.
    fn context_turns(&self, user_id: &str, history: &[Message]) -> Vec<ChatTurn> {
        let start = history.len().saturating_sub(self.context_window);
        history[start..]
            .iter()
            .map(|m| ChatTurn {
                role: if m.sender_id == user_id { "user" } else { "assistant" },
                content: m.text().to_string(),
            })
            .collect()
    }
}

impl AssistantApi for AssistantClient {
    async fn chat(&self, message: &str, user_id: &str, history: &[Message]) -> Result<AssistantReply> {
        let url = format!("{}/chat", self.base_url);
        let request = ChatRequest {
            message: message.to_string(),
            user_id: user_id.to_string(),
            history: self.context_turns(user_id, history),
        };
        debug!(user_id, turns = request.history.len(), "assistant chat request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChatError::Dispatch(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth("assistant call unauthorized".into()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Dispatch(format!(
                "assistant call failed ({}): {}",
                status, body
            )));
        }

        response
            .json::<AssistantReply>()
            .await
            .map_err(|e| ChatError::Dispatch(e.to_string()))
    }
}
