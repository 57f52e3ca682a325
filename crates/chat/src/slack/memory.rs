//! In-memory Slack workspace
//!
//! Implements [`SlackApi`] over plain maps so the sync engine and the
//! archive can be exercised without a network.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;

use super::api::{FilesQuery, HistoryPage, ListPage, ResponseMetadata};
use super::{ApiError, SlackApi};
use crate::models::{Conversation, ConversationType, EntityKind, Message, Ts};

/// In-memory implementation of SlackApi
///
/// Messages added with [`InMemorySlack::add_message`] land in the channel
/// history when they are top-level (or broadcast) and in their thread when
/// they are replies. Pages are cut at `page_size` and the cursor is the last
/// delivered `ts`, so paging is stable.
pub struct InMemorySlack {
    history: RwLock<HashMap<String, Vec<Message>>>,
    threads: RwLock<HashMap<(String, Ts), Vec<Message>>>,
    lists: RwLock<HashMap<EntityKind, Value>>,
    files: RwLock<Vec<Value>>,
    failing: RwLock<HashMap<String, String>>,
    deleted: RwLock<Vec<String>>,
    joined: RwLock<Vec<String>>,
    calls: RwLock<Vec<String>>,
    page_size: usize,
    bot: bool,
}

impl Default for InMemorySlack {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySlack {
    pub fn new() -> Self {
        Self {
            history: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            files: RwLock::new(Vec::new()),
            failing: RwLock::new(HashMap::new()),
            deleted: RwLock::new(Vec::new()),
            joined: RwLock::new(Vec::new()),
            calls: RwLock::new(Vec::new()),
            page_size: 1000,
            bot: false,
        }
    }

    /// Cut history, reply and list pages at `size` entries
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Behave like a bot credential
    pub fn as_bot(mut self) -> Self {
        self.bot = true;
        self
    }

    /// Add or replace a message (matched by `ts`)
    pub fn add_message(&self, channel: &str, message: Message) {
        let Some(ts) = message.ts() else {
            return;
        };

        if message.is_trunk() || message.is_broadcast() {
            let mut history = self.history.write().unwrap();
            upsert(history.entry(channel.to_string()).or_default(), &ts, message.clone());
        }
        if !message.is_trunk() {
            if let Some(thread_ts) = message.thread_ts() {
                let mut threads = self.threads.write().unwrap();
                upsert(
                    threads.entry((channel.to_string(), thread_ts)).or_default(),
                    &ts,
                    message,
                );
            }
        }
    }

    /// Make every history and replies call for `channel` fail with `error`
    pub fn fail_channel(&self, channel: &str, error: &str) {
        self.failing
            .write()
            .unwrap()
            .insert(channel.to_string(), error.to_string());
    }

    /// Set the full response field of a list endpoint
    pub fn set_list(&self, kind: EntityKind, items: Value) {
        self.lists.write().unwrap().insert(kind, items);
    }

    pub fn add_file(&self, file: Value) {
        self.files.write().unwrap().push(file);
    }

    /// File ids passed to `files.delete`
    pub fn deleted_files(&self) -> Vec<String> {
        self.deleted.read().unwrap().clone()
    }

    /// Channel ids passed to `conversations.join`
    pub fn joined_channels(&self) -> Vec<String> {
        self.joined.read().unwrap().clone()
    }

    /// Every call made, as `method:argument`
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    fn record(&self, method: &str, arg: &str) {
        self.calls.write().unwrap().push(format!("{}:{}", method, arg));
    }

    fn check_failing(&self, method: &str, channel: &str) -> Result<(), ApiError> {
        match self.failing.read().unwrap().get(channel) {
            Some(error) => Err(ApiError::api(method, error.clone())),
            None => Ok(()),
        }
    }

    /// Messages newer than `oldest` and than the cursor, one page of them
    fn page(&self, messages: &[Message], oldest: &Ts, cursor: Option<&str>) -> (Vec<Message>, bool) {
        let after = cursor.map(Ts::from);
        let mut newer: Vec<(Ts, &Message)> = messages
            .iter()
            .filter_map(|m| m.ts().map(|ts| (ts, m)))
            .filter(|(ts, _)| ts > oldest && after.as_ref().is_none_or(|a| ts > a))
            .collect();
        newer.sort_by(|a, b| a.0.cmp(&b.0));

        let has_more = newer.len() > self.page_size;
        let page = newer
            .into_iter()
            .take(self.page_size)
            .map(|(_, m)| m.clone())
            .collect();
        (page, has_more)
    }
}

fn upsert(messages: &mut Vec<Message>, ts: &Ts, message: Message) {
    match messages.iter_mut().find(|m| m.ts().as_ref() == Some(ts)) {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

fn page_result(messages: Vec<Message>, has_more: bool, cursor: Option<Ts>) -> HistoryPage {
    HistoryPage {
        messages,
        has_more,
        response_metadata: cursor.filter(|_| has_more).map(|ts| ResponseMetadata {
            next_cursor: Some(ts.to_string()),
        }),
    }
}

impl SlackApi for InMemorySlack {
    fn history(&self, channel: &str, oldest: &Ts, cursor: Option<&str>) -> Result<HistoryPage, ApiError> {
        self.record("conversations.history", channel);
        self.check_failing("conversations.history", channel)?;

        let history = self.history.read().unwrap();
        let messages = history.get(channel).map(Vec::as_slice).unwrap_or_default();
        let (page, has_more) = self.page(messages, oldest, cursor);
        let last = page.last().and_then(Message::ts);
        Ok(page_result(page, has_more, last))
    }

    fn replies(
        &self,
        channel: &str,
        thread_ts: &Ts,
        oldest: &Ts,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, ApiError> {
        self.record("conversations.replies", &format!("{}/{}", channel, thread_ts));
        self.check_failing("conversations.replies", channel)?;

        let threads = self.threads.read().unwrap();
        let replies = threads
            .get(&(channel.to_string(), thread_ts.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let (page, has_more) = self.page(replies, oldest, cursor);
        let last = page.last().and_then(Message::ts);

        // The parent leads every page
        let parent = self
            .history
            .read()
            .unwrap()
            .get(channel)
            .and_then(|msgs| msgs.iter().find(|m| m.ts().as_ref() == Some(thread_ts)).cloned());
        let messages = parent.into_iter().chain(page).collect();

        Ok(page_result(messages, has_more, last))
    }

    fn list(
        &self,
        kind: EntityKind,
        types: &[ConversationType],
        cursor: Option<&str>,
    ) -> Result<ListPage, ApiError> {
        self.record(kind.endpoint(), cursor.unwrap_or(""));

        let items = self
            .lists
            .read()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| match kind {
                EntityKind::Emoji => Value::Object(Default::default()),
                _ => Value::Array(Vec::new()),
            });

        if !kind.is_cursor_paginated() {
            return Ok(ListPage {
                items,
                next_cursor: None,
            });
        }

        let all: Vec<Value> = match items {
            Value::Array(items) => items
                .into_iter()
                .filter(|item| {
                    kind != EntityKind::Conversations
                        || Conversation::from_value(item).is_some_and(|c| types.contains(&c.kind()))
                })
                .collect(),
            _ => Vec::new(),
        };

        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(all.len());
        let page = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();

        Ok(ListPage {
            items: Value::Array(page),
            next_cursor: (end < all.len()).then(|| end.to_string()),
        })
    }

    fn list_files(&self, query: &FilesQuery) -> Result<Vec<Value>, ApiError> {
        self.record(
            "files.list",
            &format!("{:?}-{:?}", query.ts_from, query.ts_to),
        );

        let created = |f: &Value| f.get("created").and_then(Value::as_i64).unwrap_or(0);
        let mut matching: Vec<Value> = self
            .files
            .read()
            .unwrap()
            .iter()
            .filter(|f| query.ts_from.is_none_or(|from| created(f) >= from))
            .filter(|f| query.ts_to.is_none_or(|to| created(f) <= to))
            .cloned()
            .collect();

        // Newest first, like the real endpoint
        matching.sort_by_key(|f| std::cmp::Reverse(created(f)));
        matching.truncate(query.count as usize);
        Ok(matching)
    }

    fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        self.record("files.delete", file_id);

        let mut files = self.files.write().unwrap();
        let before = files.len();
        files.retain(|f| f.get("id").and_then(Value::as_str) != Some(file_id));
        if files.len() == before {
            return Err(ApiError::api("files.delete", "file_not_found"));
        }
        self.deleted.write().unwrap().push(file_id.to_string());
        Ok(())
    }

    fn join_channel(&self, channel: &str) -> Result<(), ApiError> {
        self.record("conversations.join", channel);
        self.joined.write().unwrap().push(channel.to_string());
        Ok(())
    }

    fn is_bot_token(&self) -> bool {
        self.bot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(v: Value) -> Message {
        Message::new(v)
    }

    #[test]
    fn test_history_paging() {
        let slack = InMemorySlack::new().with_page_size(2);
        for ts in ["1.0", "2.0", "3.0"] {
            slack.add_message("C1", msg(json!({"ts": ts})));
        }

        let first = slack.history("C1", &Ts::start(), None).unwrap();
        assert_eq!(first.messages.len(), 2);
        assert!(first.has_more);
        let cursor = first.next_cursor().map(str::to_string);
        assert_eq!(cursor.as_deref(), Some("2.0"));

        let second = slack.history("C1", &Ts::start(), cursor.as_deref()).unwrap();
        assert_eq!(second.messages.len(), 1);
        assert!(!second.has_more);
        assert_eq!(second.next_cursor(), None);
    }

    #[test]
    fn test_oldest_is_exclusive() {
        let slack = InMemorySlack::new();
        slack.add_message("C1", msg(json!({"ts": "1.0"})));
        slack.add_message("C1", msg(json!({"ts": "2.0"})));
        let page = slack.history("C1", &Ts::from("1.0"), None).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].ts(), Some(Ts::from("2.0")));
    }

    #[test]
    fn test_replies_lead_with_parent() {
        let slack = InMemorySlack::new();
        slack.add_message("C1", msg(json!({"ts": "1.0", "thread_ts": "1.0", "latest_reply": "3.0"})));
        slack.add_message("C1", msg(json!({"ts": "2.0", "thread_ts": "1.0"})));
        slack.add_message(
            "C1",
            msg(json!({"ts": "3.0", "thread_ts": "1.0", "subtype": "thread_broadcast"})),
        );

        let history = slack.history("C1", &Ts::start(), None).unwrap();
        assert_eq!(history.messages.len(), 2);

        let replies = slack.replies("C1", &Ts::from("1.0"), &Ts::from("2.0"), None).unwrap();
        let ts: Vec<_> = replies.messages.iter().filter_map(Message::ts).collect();
        assert_eq!(ts, vec![Ts::from("1.0"), Ts::from("3.0")]);
    }

    #[test]
    fn test_failing_channel() {
        let slack = InMemorySlack::new();
        slack.fail_channel("C1", "channel_not_found");
        let err = slack.history("C1", &Ts::start(), None).unwrap_err();
        assert_eq!(err, ApiError::api("conversations.history", "channel_not_found"));
    }

    #[test]
    fn test_list_filters_types() {
        let slack = InMemorySlack::new();
        slack.set_list(
            EntityKind::Conversations,
            json!([
                {"id": "C1", "is_channel": true},
                {"id": "G1", "is_channel": true, "is_private": true},
                {"id": "D1", "is_im": true}
            ]),
        );
        let page = slack
            .list(EntityKind::Conversations, &ConversationType::PRIVATE, None)
            .unwrap();
        assert_eq!(page.items, json!([{"id": "G1", "is_channel": true, "is_private": true}, {"id": "D1", "is_im": true}]));
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_files_newest_first_inclusive() {
        let slack = InMemorySlack::new();
        for (id, created) in [("F1", 10), ("F2", 20), ("F3", 30)] {
            slack.add_file(json!({"id": id, "created": created}));
        }
        let files = slack
            .list_files(&FilesQuery {
                count: 2,
                ..FilesQuery::up_to(20)
            })
            .unwrap();
        let ids: Vec<_> = files.iter().map(|f| f["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["F2", "F1"]);
    }

    #[test]
    fn test_delete_file() {
        let slack = InMemorySlack::new();
        slack.add_file(json!({"id": "F1", "created": 1}));
        slack.delete_file("F1").unwrap();
        assert!(slack.delete_file("F1").is_err());
        assert_eq!(slack.deleted_files(), vec!["F1"]);
    }
}
