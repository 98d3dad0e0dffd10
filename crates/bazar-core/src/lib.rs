//! Realtime chat synchronization engine for the marketplace client.
//!
//! Keeps a per-conversation message list consistent between the client
//! and the server across an unreliable, reconnecting transport, behind
//! one surface for both backends: the live bidirectional channel
//! (human-to-human chat) and the request/response AI assistant.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod error;
pub mod models;
pub mod receipts;
pub mod send;
pub mod store;
pub mod wire;

pub use chat::{ChatEngine, Conversation, LiveChannelChat, RequestResponseChat};
pub use config::CoreConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ChatError, Result};
pub use models::{Message, MessageBody, MessageKind};
pub use store::{LoadOutcome, MessageStore, ScrollAnchor};
