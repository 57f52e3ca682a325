//! Incremental synchronization
//!
//! - [`ConversationSync`] pulls a conversation's trunk and threads
//! - [`Watermark`] recovers sync progress from the archive
//! - [`FileIndex`] walks the workspace files listing

mod conversation;
mod files;
mod watermark;

pub use conversation::{ConversationSync, SyncOptions, SyncPhase, SyncStats};
pub use files::{DELETED_MARKER, FileIndex, FileWalkStats};
pub use watermark::Watermark;
