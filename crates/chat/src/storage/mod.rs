//! On-disk archive storage
//!
//! Everything is plain JSON so the archive stays human-inspectable.
//! All writes go through a temp file and a rename.

mod atomic;
mod days;
mod json;
mod snapshot;

pub use atomic::{AtomicFile, write_atomic};
pub use days::{ConversationDir, MergeOutcome, is_day_name};
pub use json::{read_json, to_archive_bytes, write_json};
pub use snapshot::SnapshotStore;
