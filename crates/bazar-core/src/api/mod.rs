pub mod assistant;
pub mod history;

pub use assistant::{AssistantApi, AssistantClient, AssistantReply};
pub use history::{HistoryClient, HistorySource};
