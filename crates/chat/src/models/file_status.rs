//! Progress of the files-listing walk

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tracks how far the files listing has been walked
///
/// The listing can only be paged by creation time, so the walk first pages
/// backward until it finds the oldest file, then forward from the newest
/// file seen. Persisted after every page so an interrupted walk resumes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileWalkStatus {
    /// Oldest file descriptor; set once the backward walk has finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_file: Option<Value>,
    /// Newest file descriptor seen so far; the forward walk stops on it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_file: Option<Value>,
    /// Creation time the backward walk resumes from (`ts_to`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_to_oldest: Option<i64>,
    /// Creation time the forward walk resumes from (`ts_from`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_from_newest: Option<i64>,
}

impl FileWalkStatus {
    /// Whether the one-time backward walk has completed
    pub fn backward_done(&self) -> bool {
        self.oldest_file.as_ref().is_some_and(|v| !v.is_null())
    }

    /// Record a page seen by the backward walk
    pub fn after_backward_page(mut self, oldest_created: i64, newest_created: i64) -> Self {
        self.ts_to_oldest = Some(oldest_created);
        self.ts_from_newest = Some(newest_created.max(self.ts_from_newest.unwrap_or(0)));
        self
    }

    /// Record a page seen by the forward walk
    pub fn after_forward_page(mut self, newest_created: i64) -> Self {
        self.ts_from_newest = Some(newest_created);
        self
    }
}
