//! Attachment downloads
//!
//! This module provides:
//! - Content-addressed naming of downloaded URLs
//! - A worker pool that remembers unfinished work
//! - The pending queue persisted between runs
//! - The [`Downloader`] composing them

mod downloader;
mod fetch;
mod naming;
mod pool;
mod queue;

pub use downloader::{DownloadSummary, Downloader, DownloaderOptions, file_missing, storage_dir};
pub use fetch::{Fetch, FetchResponse, HttpFetcher, USER_AGENT, request_headers};
pub use naming::{MAX_NAME_LEN, name_for, url_to_filename};
pub use pool::{Requeue, WorkerPool};
pub use queue::{Job, PendingQueue};

use serde_json::Value;

use crate::models::{Message, file_urls};

/// Profile image sizes kept for every user
const AVATAR_KEYS: [&str; 3] = ["image_512", "image_192", "image_72"];

/// Accepts URLs to download
///
/// Implemented by [`Downloader`]; sync code only depends on this trait.
pub trait AttachmentSink: Sync {
    /// Queue `url`; `false` when it is already downloaded or downloads are off
    fn enqueue(&self, url: &str, hint: Option<&str>) -> bool;

    /// Queue everything a message references
    fn enqueue_message(&self, message: &Message) -> usize {
        message
            .attachment_urls()
            .iter()
            .filter(|url| self.enqueue(url, None))
            .count()
    }

    /// Queue a file descriptor's download and preview
    fn enqueue_file(&self, file: &Value) -> usize {
        file_urls(file)
            .iter()
            .filter(|url| self.enqueue(url, None))
            .count()
    }

    /// Queue a user's avatars, named by their avatar hash
    fn enqueue_user(&self, user: &Value) -> usize {
        let Some(profile) = user.get("profile") else {
            return 0;
        };
        let hash = profile.get("avatar_hash").and_then(Value::as_str);
        AVATAR_KEYS
            .iter()
            .filter_map(|key| profile.get(*key).and_then(Value::as_str))
            .filter(|url| self.enqueue(url, Some(hash.unwrap_or("None"))))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Option<String>)>>);

    impl AttachmentSink for Recorder {
        fn enqueue(&self, url: &str, hint: Option<&str>) -> bool {
            self.0
                .lock()
                .unwrap()
                .push((url.to_string(), hint.map(str::to_string)));
            true
        }
    }

    #[test]
    fn test_enqueue_user_avatars() {
        let sink = Recorder::default();
        let user = json!({
            "id": "U1",
            "profile": {
                "avatar_hash": "abc",
                "image_72": "https://avatars.slack-edge.com/u_72.png",
                "image_512": "https://avatars.slack-edge.com/u_512.png",
                "image_24": "https://avatars.slack-edge.com/u_24.png"
            }
        });
        assert_eq!(sink.enqueue_user(&user), 2);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![
                ("https://avatars.slack-edge.com/u_512.png".to_string(), Some("abc".to_string())),
                ("https://avatars.slack-edge.com/u_72.png".to_string(), Some("abc".to_string())),
            ]
        );
    }

    #[test]
    fn test_enqueue_file() {
        let sink = Recorder::default();
        let file = json!({"id": "F1", "url_private": "https://files.slack.com/a", "thumb_480": "https://files.slack.com/a_480"});
        assert_eq!(sink.enqueue_file(&file), 2);
        assert_eq!(sink.enqueue_user(&json!({"id": "U2"})), 0);
    }
}
