//! Message model: an opaque Slack message record keyed by its `ts`

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Slack timestamp string (`"<seconds>.<fraction>"`)
///
/// Unique within a conversation. Ordered numerically, so `"9.5"` sorts
/// before `"10.0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ts(pub String);

impl Ts {
    /// Sentinel used as `oldest` when nothing has been synced yet.
    ///
    /// `0` makes the history API return the newest page first; `1` pages
    /// forward from the beginning.
    pub const START: &'static str = "1";

    pub fn new(ts: impl Into<String>) -> Self {
        Self(ts.into())
    }

    pub fn start() -> Self {
        Self(Self::START.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric sort key: whole seconds and microseconds
    pub fn key(&self) -> (u64, u32) {
        ts_key(&self.0)
    }

    /// Seconds since the epoch as a float (for arithmetic only)
    pub fn as_secs_f64(&self) -> f64 {
        self.0.parse().unwrap_or(0.0)
    }

    /// Calendar day (UTC) of this timestamp, formatted `YYYY-MM-DD`
    pub fn day(&self) -> Option<String> {
        let (secs, micros) = self.key();
        let secs = i64::try_from(secs).ok()?;
        DateTime::from_timestamp(secs, micros * 1_000).map(|dt| dt.format("%Y-%m-%d").to_string())
    }
}

impl Ord for Ts {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key()).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Ts {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Ts {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Ts {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Ts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn ts_key(ts: &str) -> (u64, u32) {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let secs = secs.trim().parse().unwrap_or(0);
    let mut digits: String = frac.chars().take_while(|c| c.is_ascii_digit()).take(6).collect();
    while digits.len() < 6 {
        digits.push('0');
    }
    (secs, digits.parse().unwrap_or(0))
}

/// A single Slack message
///
/// The record is kept exactly as the API returned it; only the fields the
/// sync engine needs are exposed through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Value);

impl Message {
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn into_raw(self) -> Value {
        self.0
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// The message timestamp; `None` for malformed records
    pub fn ts(&self) -> Option<Ts> {
        self.str_field("ts").map(Ts::from)
    }

    pub fn thread_ts(&self) -> Option<Ts> {
        self.str_field("thread_ts").map(Ts::from)
    }

    /// Parent bookkeeping of its most recent reply
    pub fn latest_reply(&self) -> Option<Ts> {
        self.str_field("latest_reply").map(Ts::from)
    }

    pub fn subtype(&self) -> Option<&str> {
        self.str_field("subtype")
    }

    /// Top-level message: not in a thread, or the thread parent itself
    pub fn is_trunk(&self) -> bool {
        match (self.str_field("thread_ts"), self.str_field("ts")) {
            (None, _) => true,
            (Some(thread), Some(ts)) => thread == ts,
            (Some(_), None) => false,
        }
    }

    /// Parent of a thread (`ts == thread_ts`)
    pub fn is_thread_parent(&self) -> bool {
        match (self.str_field("thread_ts"), self.str_field("ts")) {
            (Some(thread), Some(ts)) => thread == ts,
            _ => false,
        }
    }

    /// Copy of a thread reply surfaced in the channel feed
    pub fn is_broadcast(&self) -> bool {
        self.subtype() == Some("thread_broadcast")
    }

    /// Whether the message references anything downloadable
    pub fn has_attachments(&self) -> bool {
        ["file", "files", "attachments"]
            .iter()
            .any(|k| self.0.get(*k).is_some())
    }

    /// Downloadable URLs: uploaded files and link-preview images
    pub fn attachment_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();

        let files: Vec<&Value> = match (self.0.get("files"), self.0.get("file")) {
            (Some(Value::Array(files)), _) if !files.is_empty() => files.iter().collect(),
            (_, Some(file)) if file.is_object() => vec![file],
            _ => Vec::new(),
        };
        for file in files {
            urls.extend(file_urls(file));
        }

        if let Some(Value::Array(attachments)) = self.0.get("attachments") {
            for att in attachments {
                urls.extend(pluck_urls(att, &["service_icon", "thumb_url"]));
            }
        }

        urls
    }
}

/// URLs worth downloading for a file descriptor
pub fn file_urls(file: &Value) -> Vec<String> {
    pluck_urls(file, &["url_private", "thumb_480"])
}

fn pluck_urls(obj: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ts_numeric_order() {
        let mut v = vec![Ts::from("10.0"), Ts::from("9.5"), Ts::from("9.000010"), Ts::from("9.00001")];
        v.sort();
        let ordered: Vec<&str> = v.iter().map(Ts::as_str).collect();
        assert_eq!(ordered, vec!["9.00001", "9.000010", "9.5", "10.0"]);
        assert!(Ts::from("1700000000.000200") > Ts::from("1700000000.000100"));
    }

    #[test]
    fn test_ts_day_is_utc() {
        assert_eq!(Ts::from("1.0").day().as_deref(), Some("1970-01-01"));
        assert_eq!(Ts::from("1704067200.000100").day().as_deref(), Some("2024-01-01"));
        assert_eq!(Ts::from("1704067199.999999").day().as_deref(), Some("2023-12-31"));
    }

    #[test]
    fn test_trunk_and_parent() {
        let plain = Message::new(json!({"ts": "1.0"}));
        let parent = Message::new(json!({"ts": "2.0", "thread_ts": "2.0", "latest_reply": "3.0"}));
        let reply = Message::new(json!({"ts": "3.0", "thread_ts": "2.0"}));

        assert!(plain.is_trunk());
        assert!(!plain.is_thread_parent());
        assert!(parent.is_trunk());
        assert!(parent.is_thread_parent());
        assert!(!reply.is_trunk());
        assert_eq!(parent.latest_reply(), Some(Ts::from("3.0")));
    }

    #[test]
    fn test_broadcast() {
        let echo = Message::new(json!({"ts": "3.0", "thread_ts": "2.0", "subtype": "thread_broadcast"}));
        assert!(echo.is_broadcast());
        assert!(!Message::new(json!({"ts": "3.0"})).is_broadcast());
    }

    #[test]
    fn test_attachment_urls() {
        let msg = Message::new(json!({
            "ts": "1.0",
            "files": [
                {"url_private": "https://files.slack.com/a.png", "thumb_480": "https://files.slack.com/a_480.png"},
                {"url_private": "https://files.slack.com/b.pdf"}
            ],
            "attachments": [
                {"service_icon": "https://example.com/icon.png", "thumb_url": "https://example.com/t.jpg", "title": "x"}
            ]
        }));
        assert!(msg.has_attachments());
        assert_eq!(
            msg.attachment_urls(),
            vec![
                "https://files.slack.com/a.png",
                "https://files.slack.com/a_480.png",
                "https://files.slack.com/b.pdf",
                "https://example.com/icon.png",
                "https://example.com/t.jpg",
            ]
        );
    }

    #[test]
    fn test_single_file_field() {
        let msg = Message::new(json!({"ts": "1.0", "file": {"url_private": "https://files.slack.com/c"}}));
        assert_eq!(msg.attachment_urls(), vec!["https://files.slack.com/c"]);
    }
}
