//! Incremental sync of one conversation
//!
//! The conversation's top-level history (the trunk) is paged forward from
//! the watermark, and every thread whose parent reports a reply newer than
//! what the archive holds has its replies paged forward too. Broadcast
//! copies of replies are left to the thread pass, so the newest archived
//! reply of a thread always marks a contiguous prefix.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::download::AttachmentSink;
use crate::models::{Conversation, Message, Ts};
use crate::slack::api::HistoryPage;
use crate::slack::{RetryPolicy, SlackApi};
use crate::storage::{ConversationDir, MergeOutcome};

use super::Watermark;

/// Steps of a conversation sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    ScanExisting,
    FetchTrunk,
    FetchReplies,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Start the trunk walk this far before the newest archived message
    /// instead of from the beginning
    pub trunk_lookback: Option<Duration>,
}

/// What one sync did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pages: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Threads whose replies were fetched
    pub threads: usize,
    /// Downloads queued
    pub attachments: usize,
    /// Nothing was fetched (archived channel the credential cannot read)
    pub skipped: bool,
}

impl SyncStats {
    fn absorb(&mut self, outcome: &MergeOutcome, attachments: usize) {
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
        self.attachments += attachments;
    }
}

/// Pulls new and changed messages of a conversation into its directory
pub struct ConversationSync<'a> {
    api: &'a dyn SlackApi,
    retry: &'a RetryPolicy,
    sink: &'a dyn AttachmentSink,
    options: SyncOptions,
}

impl<'a> ConversationSync<'a> {
    pub fn new(api: &'a dyn SlackApi, retry: &'a RetryPolicy, sink: &'a dyn AttachmentSink) -> Self {
        Self {
            api,
            retry,
            sink,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Sync `conversation` into `dir`
    ///
    /// An API error aborts the sync; day files merged before it stay valid
    /// and the next run resumes from them.
    pub fn sync(&self, conversation: &Conversation, dir: &ConversationDir) -> Result<SyncStats> {
        let label = conversation.pretty_name();
        let mut stats = SyncStats::default();

        // Bots read public channels only as members
        if conversation.is_public_channel() && self.api.is_bot_token() && !conversation.is_member {
            if conversation.is_archived {
                info!(
                    "{}: Skipping archived channel because of bot token (try a personal token instead)",
                    label
                );
                stats.skipped = true;
                return Ok(stats);
            }
            info!("Joining channel {}", label);
            self.retry
                .call(&format!("{}: conversations.join", label), || {
                    self.api.join_channel(&conversation.id)
                })
                .with_context(|| format!("{}: failed to join channel", label))?;
        }

        let mut phase = SyncPhase::ScanExisting;
        let mut watermark = Watermark::default();
        let mut threads = Vec::new();
        loop {
            debug!("{}: {:?}", label, phase);
            phase = match phase {
                SyncPhase::ScanExisting => {
                    watermark = Watermark::scan(dir)?;
                    SyncPhase::FetchTrunk
                }
                SyncPhase::FetchTrunk => {
                    threads = self.fetch_trunk(conversation, dir, &watermark, &mut stats)?;
                    SyncPhase::FetchReplies
                }
                SyncPhase::FetchReplies => {
                    for thread_ts in &threads {
                        self.fetch_replies(conversation, dir, &watermark, thread_ts, &mut stats)?;
                    }
                    SyncPhase::Done
                }
                SyncPhase::Done => break,
            };
        }

        Ok(stats)
    }

    /// Where the trunk walk starts
    fn trunk_start(&self, watermark: &Watermark) -> Ts {
        match (self.options.trunk_lookback, &watermark.latest_trunk_ts) {
            (Some(lookback), Some(latest)) => {
                let secs = latest.key().0.saturating_sub(lookback.as_secs());
                if secs <= 1 {
                    Ts::start()
                } else {
                    Ts::new(format!("{}.000000", secs))
                }
            }
            _ => Ts::start(),
        }
    }

    /// Page the trunk, returning the threads that need their replies fetched
    fn fetch_trunk(
        &self,
        conversation: &Conversation,
        dir: &ConversationDir,
        watermark: &Watermark,
        stats: &mut SyncStats,
    ) -> Result<Vec<Ts>> {
        let label = conversation.pretty_name();
        let mut oldest = self.trunk_start(watermark);
        let mut cursor: Option<String> = None;
        let mut threads = Vec::new();
        let mut queued = HashSet::new();

        loop {
            let page = self
                .retry
                .call(&format!("{}: conversations.history", label), || {
                    self.api.history(&conversation.id, &oldest, cursor.as_deref())
                })
                .with_context(|| format!("{}: failed to fetch history", label))?;
            stats.pages += 1;

            let page = split_page(page, |m| !m.is_broadcast());
            for msg in &page.messages {
                if msg.is_thread_parent() && watermark.needs_replies(msg) {
                    if let Some(ts) = msg.ts() {
                        if queued.insert(ts.clone()) {
                            threads.push(ts);
                        }
                    }
                }
            }

            self.merge(dir, "trunk", &page.messages, &mut oldest, stats)?;
            page.advance(&mut oldest);
            cursor = page.cursor;
            if page.done {
                break;
            }
        }

        Ok(threads)
    }

    fn fetch_replies(
        &self,
        conversation: &Conversation,
        dir: &ConversationDir,
        watermark: &Watermark,
        thread_ts: &Ts,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let label = conversation.pretty_name();
        let mut oldest = watermark.replies_from(thread_ts);
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .retry
                .call(&format!("{}: conversations.replies", label), || {
                    self.api
                        .replies(&conversation.id, thread_ts, &oldest, cursor.as_deref())
                })
                .with_context(|| format!("{}: failed to fetch replies to {}", label, thread_ts))?;
            stats.pages += 1;

            // The parent leads every page and is already archived with the trunk
            let page = split_page(page, |m| !m.is_trunk());
            self.merge(dir, "reply", &page.messages, &mut oldest, stats)?;
            page.advance(&mut oldest);
            cursor = page.cursor;
            if page.done {
                break;
            }
        }

        stats.threads += 1;
        Ok(())
    }

    fn merge(
        &self,
        dir: &ConversationDir,
        kind: &str,
        messages: &[Message],
        oldest: &mut Ts,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let outcome = dir.merge(kind, messages)?;
        let attachments = outcome
            .fresh
            .iter()
            .filter(|m| m.has_attachments())
            .map(|m| self.sink.enqueue_message(m))
            .sum();
        stats.absorb(&outcome, attachments);

        if let Some(latest) = outcome.latest {
            if latest > *oldest {
                *oldest = latest;
            }
        }
        Ok(())
    }
}

/// A fetched page reduced to what gets merged
struct Split {
    /// Kept messages, sorted by `ts`
    messages: Vec<Message>,
    /// Newest `ts` on the page, kept or not
    latest: Option<Ts>,
    cursor: Option<String>,
    done: bool,
}

impl Split {
    /// Move `oldest` past everything the page delivered
    ///
    /// A page of filtered-out messages still moves the walk forward.
    fn advance(&self, oldest: &mut Ts) {
        if let Some(latest) = &self.latest {
            if latest > oldest {
                *oldest = latest.clone();
            }
        }
    }
}

/// Keep the messages passing `keep`, plus paging state
///
/// The walk is done when there is neither a cursor nor more to fetch, or
/// when the server returns an empty page without a cursor.
fn split_page(page: HistoryPage, keep: impl Fn(&Message) -> bool) -> Split {
    let cursor = page.next_cursor().map(str::to_string);
    let done = cursor.is_none() && (!page.has_more || page.messages.is_empty());
    let latest = page.messages.iter().filter_map(Message::ts).max();

    let mut messages: Vec<Message> = page.messages.into_iter().filter(|m| keep(m)).collect();
    messages.sort_by_key(Message::ts);
    Split {
        messages,
        latest,
        cursor,
        done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationType, EntityKind};
    use crate::slack::api::{FilesQuery, ListPage};
    use crate::slack::{ApiError, InMemorySlack};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl AttachmentSink for Recorder {
        fn enqueue(&self, url: &str, _hint: Option<&str>) -> bool {
            self.0.lock().unwrap().push(url.to_string());
            true
        }
    }

    fn channel(id: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            name: Some("general".to_string()),
            is_channel: true,
            is_member: true,
            ..Default::default()
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new().with_unit(Duration::ZERO)
    }

    #[test]
    fn test_split_page() {
        let page = HistoryPage {
            messages: vec![
                Message::new(json!({"ts": "3.0"})),
                Message::new(json!({"ts": "1.0"})),
                Message::new(json!({"ts": "2.0", "subtype": "thread_broadcast", "thread_ts": "1.0"})),
            ],
            has_more: true,
            response_metadata: None,
        };
        let split = split_page(page, |m| !m.is_broadcast());
        let ts: Vec<_> = split.messages.iter().filter_map(Message::ts).collect();
        assert_eq!(ts, vec![Ts::from("1.0"), Ts::from("3.0")]);
        assert_eq!(split.latest, Some(Ts::from("3.0")));
        assert_eq!(split.cursor, None);
        assert!(!split.done);
    }

    /// History whose first page holds only broadcasts and has no cursor
    struct BroadcastsFirst {
        oldest_seen: Mutex<Vec<Ts>>,
    }

    impl SlackApi for BroadcastsFirst {
        fn history(&self, _channel: &str, oldest: &Ts, _cursor: Option<&str>) -> Result<HistoryPage, ApiError> {
            let mut seen = self.oldest_seen.lock().unwrap();
            seen.push(oldest.clone());
            if seen.len() > 3 {
                return Err(ApiError::api("conversations.history", "looping"));
            }
            let messages = if *oldest < Ts::from("20.000000") {
                vec![
                    Message::new(json!({"ts": "10.000000", "subtype": "thread_broadcast", "thread_ts": "5.000000"})),
                    Message::new(json!({"ts": "20.000000", "subtype": "thread_broadcast", "thread_ts": "5.000000"})),
                ]
            } else {
                vec![Message::new(json!({"ts": "30.000000", "text": "after"}))]
            };
            Ok(HistoryPage {
                has_more: *oldest < Ts::from("20.000000"),
                messages,
                response_metadata: None,
            })
        }

        fn replies(&self, _: &str, _: &Ts, _: &Ts, _: Option<&str>) -> Result<HistoryPage, ApiError> {
            Ok(HistoryPage::default())
        }

        fn list(&self, _: EntityKind, _: &[ConversationType], _: Option<&str>) -> Result<ListPage, ApiError> {
            unimplemented!()
        }

        fn list_files(&self, _: &FilesQuery) -> Result<Vec<serde_json::Value>, ApiError> {
            unimplemented!()
        }

        fn delete_file(&self, _: &str) -> Result<(), ApiError> {
            unimplemented!()
        }

        fn join_channel(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }

        fn is_bot_token(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_broadcast_only_page_advances() {
        let dir = TempDir::new().unwrap();
        let api = BroadcastsFirst {
            oldest_seen: Mutex::new(Vec::new()),
        };
        let sink = Recorder::default();
        let policy = retry();
        let conv_dir = ConversationDir::new(dir.path().join("C1"), "#general");

        let stats = ConversationSync::new(&api, &policy, &sink)
            .sync(&channel("C1"), &conv_dir)
            .unwrap();
        assert_eq!(stats.pages, 2);
        assert_eq!(stats.inserted, 1);
        assert_eq!(
            *api.oldest_seen.lock().unwrap(),
            vec![Ts::start(), Ts::from("20.000000")]
        );
    }

    #[test]
    fn test_attachments_queued_for_fresh_messages() {
        let dir = TempDir::new().unwrap();
        let slack = InMemorySlack::new();
        slack.add_message(
            "C1",
            Message::new(json!({
                "ts": "1700000000.000100",
                "files": [{"id": "F1", "url_private": "https://files.slack.com/F1/a.png"}]
            })),
        );
        let sink = Recorder::default();
        let policy = retry();
        let engine = ConversationSync::new(&slack, &policy, &sink);
        let conv_dir = ConversationDir::new(dir.path().join("C1"), "#general");

        let stats = engine.sync(&channel("C1"), &conv_dir).unwrap();
        assert_eq!(stats.attachments, 1);
        // Unchanged on the second run: nothing fresh, nothing queued
        let stats = engine.sync(&channel("C1"), &conv_dir).unwrap();
        assert_eq!(stats.attachments, 0);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_bot_joins_public_channel() {
        let dir = TempDir::new().unwrap();
        let slack = InMemorySlack::new().as_bot();
        let sink = Recorder::default();
        let policy = retry();
        let engine = ConversationSync::new(&slack, &policy, &sink);

        let mut conv = channel("C1");
        conv.is_member = false;
        engine
            .sync(&conv, &ConversationDir::new(dir.path().join("C1"), "#general"))
            .unwrap();
        assert_eq!(slack.joined_channels(), vec!["C1"]);

        conv.id = "C2".to_string();
        conv.is_archived = true;
        let stats = engine
            .sync(&conv, &ConversationDir::new(dir.path().join("C2"), "#old"))
            .unwrap();
        assert!(stats.skipped);
        assert_eq!(slack.joined_channels(), vec!["C1"]);
        assert!(!slack.calls().iter().any(|c| c == "conversations.history:C2"));
    }

    #[test]
    fn test_trunk_lookback() {
        let slack = InMemorySlack::new();
        let sink = Recorder::default();
        let policy = retry();
        let engine = ConversationSync::new(&slack, &policy, &sink).with_options(SyncOptions {
            trunk_lookback: Some(Duration::from_secs(3600)),
        });
        let watermark = Watermark {
            latest_trunk_ts: Some(Ts::from("1700003600.000500")),
            ..Default::default()
        };
        assert_eq!(engine.trunk_start(&watermark), Ts::from("1700000000.000000"));
        assert_eq!(engine.trunk_start(&Watermark::default()), Ts::start());
    }

    #[test]
    fn test_api_error_aborts() {
        let dir = TempDir::new().unwrap();
        let slack = InMemorySlack::new();
        slack.fail_channel("C1", "channel_not_found");
        let sink = Recorder::default();
        let policy = retry();
        let engine = ConversationSync::new(&slack, &policy, &sink);

        let err = engine
            .sync(&channel("C1"), &ConversationDir::new(dir.path().join("C1"), "#general"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("channel_not_found"));
        assert!(!dir.path().join("C1").exists());
    }
}
