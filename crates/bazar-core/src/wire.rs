//! Wire frames for the live channel.
//!
//! Both directions are JSON text frames: a tagged `op` for client
//! requests and a tagged `event` for server pushes.

use serde::{Deserialize, Serialize};

use crate::models::{MessageKind, MessageRecord};

/// Client -> server operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Leave {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    SendMessage {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        /// Client-generated provisional id, echoed back by the server so
        /// reconciliation is exact instead of heuristic.
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "senderId")]
        sender_id: String,
        kind: MessageKind,
        content: String,
    },
    MarkRead {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "viewerId")]
        viewer_id: String,
    },
    Recall {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

/// Server -> client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: MessageRecord,
        /// Present when this message originated from this client; carries
        /// the provisional id from the matching `SendMessage`.
        #[serde(rename = "clientId", default)]
        client_id: Option<String>,
    },
    MessageRecalled {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Seen {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "seenBy")]
        seen_by: String,
        #[serde(rename = "upTo")]
        up_to: i64,
    },
    Presence {
        #[serde(rename = "userId")]
        user_id: String,
        online: bool,
        at: i64,
    },
    /// The listing behind a conversation was edited or deleted.
    ConversationUpdated {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Blocked {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        by: String,
    },
    Unblocked {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        by: String,
    },
    Joined {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
}

impl ServerEvent {
    /// Conversation this event belongs to, when it targets one.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ServerEvent::NewMessage { message, .. } => Some(&message.conversation_id),
            ServerEvent::MessageRecalled { conversation_id, .. }
            | ServerEvent::Seen { conversation_id, .. }
            | ServerEvent::ConversationUpdated { conversation_id }
            | ServerEvent::Blocked { conversation_id, .. }
            | ServerEvent::Unblocked { conversation_id, .. }
            | ServerEvent::Joined { conversation_id } => Some(conversation_id),
            ServerEvent::Presence { .. } => None,
        }
    }
}
