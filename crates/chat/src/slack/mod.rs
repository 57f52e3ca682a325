//! Slack Web API integration
//!
//! This module provides:
//! - The [`SlackApi`] trait over the endpoints the archiver uses
//! - A blocking HTTP client implementing it
//! - An in-memory implementation for tests
//! - Retry policy for transient failures

mod client;
mod error;
mod memory;
mod retry;

pub use client::{SlackClient, is_slack_url};
pub use error::ApiError;
pub use memory::InMemorySlack;
pub use retry::RetryPolicy;

use crate::models::{ConversationType, EntityKind, Ts};
use api::{FilesQuery, HistoryPage, ListPage};

/// Largest page the history endpoints accept
pub const HISTORY_PAGE_LIMIT: u32 = 1000;

/// Slack Web API response types
pub mod api {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    use crate::models::Message;

    /// A page of `conversations.history` or `conversations.replies`
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct HistoryPage {
        #[serde(default)]
        pub messages: Vec<Message>,
        #[serde(default)]
        pub has_more: bool,
        #[serde(default)]
        pub response_metadata: Option<ResponseMetadata>,
    }

    impl HistoryPage {
        /// Pagination cursor, if the server returned a non-empty one
        pub fn next_cursor(&self) -> Option<&str> {
            self.response_metadata
                .as_ref()
                .and_then(|m| m.next_cursor.as_deref())
                .filter(|c| !c.is_empty())
        }
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ResponseMetadata {
        #[serde(default)]
        pub next_cursor: Option<String>,
    }

    /// One page of a list endpoint
    ///
    /// `items` is the response field named by the entity kind: an array
    /// for conversations and users, a name-to-URL map for emoji.
    #[derive(Debug, Clone, Default)]
    pub struct ListPage {
        pub items: Value,
        pub next_cursor: Option<String>,
    }

    /// Parameters of `files.list`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilesQuery {
        /// Only files created at or after this time
        pub ts_from: Option<i64>,
        /// Only files created at or before this time
        pub ts_to: Option<i64>,
        pub count: u32,
    }

    impl FilesQuery {
        pub const PAGE_SIZE: u32 = 1000;

        pub fn newest() -> Self {
            Self {
                ts_from: None,
                ts_to: None,
                count: Self::PAGE_SIZE,
            }
        }

        pub fn up_to(ts_to: i64) -> Self {
            Self {
                ts_to: Some(ts_to),
                ..Self::newest()
            }
        }

        pub fn since(ts_from: i64) -> Self {
            Self {
                ts_from: Some(ts_from),
                ..Self::newest()
            }
        }
    }
}

/// The Slack endpoints the archiver depends on
///
/// Each method is a single remote call; callers wrap them in a
/// [`RetryPolicy`].
pub trait SlackApi: Send + Sync {
    /// One page of a conversation's top-level history, messages newer than `oldest`
    fn history(&self, channel: &str, oldest: &Ts, cursor: Option<&str>) -> Result<HistoryPage, ApiError>;

    /// One page of a thread; the parent is always repeated first
    fn replies(
        &self,
        channel: &str,
        thread_ts: &Ts,
        oldest: &Ts,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, ApiError>;

    /// One page of a list endpoint (conversations are filtered by `types`)
    fn list(
        &self,
        kind: EntityKind,
        types: &[ConversationType],
        cursor: Option<&str>,
    ) -> Result<ListPage, ApiError>;

    /// File descriptors matching `query`
    fn list_files(&self, query: &FilesQuery) -> Result<Vec<serde_json::Value>, ApiError>;

    /// Delete a file from the workspace
    fn delete_file(&self, file_id: &str) -> Result<(), ApiError>;

    /// Join a public channel
    fn join_channel(&self, channel: &str) -> Result<(), ApiError>;

    /// Whether the credential is a bot token (bots must join public channels to read them)
    fn is_bot_token(&self) -> bool;
}

impl<T: SlackApi + ?Sized> SlackApi for std::sync::Arc<T> {
    fn history(&self, channel: &str, oldest: &Ts, cursor: Option<&str>) -> Result<HistoryPage, ApiError> {
        (**self).history(channel, oldest, cursor)
    }

    fn replies(
        &self,
        channel: &str,
        thread_ts: &Ts,
        oldest: &Ts,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, ApiError> {
        (**self).replies(channel, thread_ts, oldest, cursor)
    }

    fn list(
        &self,
        kind: EntityKind,
        types: &[ConversationType],
        cursor: Option<&str>,
    ) -> Result<ListPage, ApiError> {
        (**self).list(kind, types, cursor)
    }

    fn list_files(&self, query: &FilesQuery) -> Result<Vec<serde_json::Value>, ApiError> {
        (**self).list_files(query)
    }

    fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        (**self).delete_file(file_id)
    }

    fn join_channel(&self, channel: &str) -> Result<(), ApiError> {
        (**self).join_channel(channel)
    }

    fn is_bot_token(&self) -> bool {
        (**self).is_bot_token()
    }
}
