//! Per-conversation sync progress recovered from the archive

use std::collections::HashMap;

use anyhow::Result;

use crate::models::{Message, Ts};
use crate::storage::ConversationDir;

/// How far a conversation has been archived
///
/// Never stored: rebuilt from the day files on every run, so it cannot drift
/// from what is actually on disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Watermark {
    /// Newest archived top-level message
    pub latest_trunk_ts: Option<Ts>,
    /// Thread parent `ts` to the newest archived reply in that thread
    pub last_saved_replies: HashMap<Ts, Ts>,
}

impl Watermark {
    /// Scan the day files newest-first
    ///
    /// The first reply met for a thread is its newest archived one.
    pub fn scan(dir: &ConversationDir) -> Result<Self> {
        let mut watermark = Watermark::default();
        for file in dir.day_files(true)? {
            let mut messages: Vec<(Ts, Message)> = ConversationDir::load(&file)?
                .into_iter()
                .filter_map(|m| m.ts().map(|ts| (ts, m)))
                .collect();
            messages.sort_by(|a, b| b.0.cmp(&a.0));

            for (ts, msg) in messages {
                if msg.is_trunk() {
                    if watermark.latest_trunk_ts.as_ref().is_none_or(|t| ts > *t) {
                        watermark.latest_trunk_ts = Some(ts);
                    }
                } else if let Some(thread_ts) = msg.thread_ts() {
                    watermark.last_saved_replies.entry(thread_ts).or_insert(ts);
                }
            }
        }
        Ok(watermark)
    }

    /// Where to resume fetching replies of `thread_ts`
    pub fn replies_from(&self, thread_ts: &Ts) -> Ts {
        self.last_saved_replies
            .get(thread_ts)
            .cloned()
            .unwrap_or_else(Ts::start)
    }

    /// Whether a thread parent has replies newer than the archive holds
    pub fn needs_replies(&self, parent: &Message) -> bool {
        let Some(ts) = parent.ts() else {
            return false;
        };
        match (self.last_saved_replies.get(&ts), parent.latest_reply()) {
            (None, _) => true,
            (Some(saved), Some(latest)) => latest > *saved,
            (Some(_), None) => false,
        }
    }
}
