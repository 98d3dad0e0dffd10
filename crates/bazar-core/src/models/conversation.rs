use serde::{Deserialize, Serialize};

/// Prefix marking a conversation as an AI assistant thread.
pub const AI_CONVERSATION_PREFIX: &str = "ai-assistant-";

/// The assistant conversation id for a user. Deterministic, so client
/// and server agree on identity without a handshake.
pub fn ai_conversation_id(user_id: &str) -> String {
    format!("{}{}", AI_CONVERSATION_PREFIX, user_id)
}

pub fn is_ai_conversation(conversation_id: &str) -> bool {
    conversation_id.starts_with(AI_CONVERSATION_PREFIX)
}

/// Per-user conversation state as the server records it. The server is
/// the source of truth for hidden/deleted conversations; the client
/// keeps only a read-through projection of these records, fetched on
/// session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationVisibility {
    pub conversation_id: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub hidden_at: Option<i64>,
}
