pub mod message_store;
pub mod pagination;

pub use message_store::{MessageStore, SharedMessageStore};
pub use pagination::{LoadOutcome, PaginationController, ScrollAnchor};
