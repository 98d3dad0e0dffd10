use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Reserved sender id for the AI assistant.
pub const AI_SENDER_ID: &str = "ai-assistant";

/// Placeholder shown in place of a recalled message's payload.
pub const RECALLED_PLACEHOLDER: &str = "[recalled]";

static PROVISIONAL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Provisional id for a locally authored message awaiting server
/// confirmation. The counter disambiguates sends within the same
/// millisecond.
pub fn next_provisional_id(now_millis: i64) -> String {
    let n = PROVISIONAL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("local-{}-{}", now_millis, n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Location,
}

/// A product the assistant suggests alongside its reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSuggestion {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Message payload, decided once at ingestion.
///
/// The assistant's structured replies (suggestions, clarifying question)
/// become `AiReply` when the response is parsed; nothing downstream
/// re-inspects raw JSON to figure out what a message is.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Plain(String),
    AiReply {
        text: String,
        suggestions: Vec<ProductSuggestion>,
        clarifying_question: Option<String>,
    },
}

impl MessageBody {
    pub fn text(&self) -> &str {
        match self {
            MessageBody::Plain(text) => text,
            MessageBody::AiReply { text, .. } => text,
        }
    }
}

/// The atomic unit of a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique per conversation. Starts as `local-...` for optimistic
    /// sends and is reconciled to the server-assigned id.
    pub id: String,
    pub conversation_id: String,
    /// Human user id, or [`AI_SENDER_ID`] for assistant replies.
    pub sender_id: String,
    pub kind: MessageKind,
    pub body: MessageBody,
    /// Server-assigned milliseconds; the sort key.
    pub sent_at: i64,
    /// Set by the read-receipt reconciler, never by the UI.
    pub read_at: Option<i64>,
    /// Terminal once set; the payload becomes a tombstone.
    pub recalled: bool,
    /// Deleted on this device only: hidden from snapshots but kept in
    /// the store so a history re-fetch cannot resurrect it.
    pub is_local_only: bool,
}

impl Message {
    pub fn text(&self) -> &str {
        self.body.text()
    }

    pub fn is_provisional(&self) -> bool {
        self.id.starts_with("local-")
    }

    pub fn is_from_assistant(&self) -> bool {
        self.sender_id == AI_SENDER_ID
    }
}

/// Raw message as the server ships it, over the live channel and from
/// the history API alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub sent_at: i64,
    #[serde(default)]
    pub read_at: Option<i64>,
    #[serde(default)]
    pub recalled: bool,
    #[serde(default)]
    pub suggested_products: Vec<ProductSuggestion>,
    #[serde(default)]
    pub clarifying_question: Option<String>,
}

impl MessageRecord {
    /// Ingest into the client model. The body variant is decided here,
    /// exactly once: assistant messages carrying structure become
    /// `AiReply`, everything else is `Plain`.
    pub fn into_message(self) -> Message {
        let body = if self.sender_id == AI_SENDER_ID
            && (!self.suggested_products.is_empty() || self.clarifying_question.is_some())
        {
            MessageBody::AiReply {
                text: self.content,
                suggestions: self.suggested_products,
                clarifying_question: self.clarifying_question,
            }
        } else {
            MessageBody::Plain(self.content)
        };

        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            kind: self.kind,
            body,
            sent_at: self.sent_at,
            read_at: self.read_at,
            recalled: self.recalled,
            is_local_only: false,
        }
    }
}
