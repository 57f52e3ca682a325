//! Domain models for archived Slack entities

mod conversation;
mod entity;
mod file_status;
mod message;

pub use conversation::{Conversation, ConversationType};
pub use entity::EntityKind;
pub use file_status::FileWalkStatus;
pub use message::{Message, Ts, file_urls};
