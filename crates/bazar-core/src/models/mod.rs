pub mod conversation;
pub mod message;
pub mod presence;

pub use conversation::{ai_conversation_id, is_ai_conversation, ConversationVisibility};
pub use message::{
    next_provisional_id, Message, MessageBody, MessageKind, MessageRecord, ProductSuggestion,
    AI_SENDER_ID,
};
pub use presence::{PresenceSource, PresenceTracker};
