//! Day-partitioned conversation history
//!
//! Directory structure:
//! ```text
//! <archive_root>/
//!   C024BE91L/
//!     2024-01-01.json     # every message whose ts falls on that UTC day
//!     2024-01-02.json
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{info, warn};

use super::json::{read_json, write_json};
use crate::models::{Message, Ts};

/// Result of merging one batch into a conversation
#[derive(Debug, Default, Clone)]
pub struct MergeOutcome {
    /// Messages whose `ts` was not archived before
    pub inserted: usize,
    /// Messages whose archived content changed
    pub updated: usize,
    /// Inserted and updated messages, in `ts` order
    pub fresh: Vec<Message>,
    /// Greatest `ts` in the batch
    pub latest: Option<Ts>,
}

impl MergeOutcome {
    fn absorb(&mut self, other: MergeOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.fresh.extend(other.fresh);
        self.latest = self.latest.take().max(other.latest);
    }
}

/// One conversation's directory of day-partition files
#[derive(Debug, Clone)]
pub struct ConversationDir {
    path: PathBuf,
    label: String,
}

impl ConversationDir {
    /// `label` is only used in log lines
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn day_path(&self, day: &str) -> PathBuf {
        self.path.join(format!("{}.json", day))
    }

    /// All day-partition files, oldest day first unless `newest_first`
    pub fn day_files(&self, newest_first: bool) -> Result<Vec<PathBuf>> {
        if !self.path.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("Failed to list {}", self.path.display()))?
        {
            let path = entry?.path();
            let is_day = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .is_some_and(is_day_name);
            if is_day && path.is_file() {
                files.push(path);
            }
        }

        files.sort();
        if newest_first {
            files.reverse();
        }
        Ok(files)
    }

    /// Load one day-partition file
    pub fn load(path: &Path) -> Result<Vec<Message>> {
        read_json(path)
    }

    /// Every archived message, oldest day first
    pub fn all_messages(&self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for file in self.day_files(false)? {
            messages.extend(Self::load(&file)?);
        }
        Ok(messages)
    }

    /// Merge a batch of messages into the day-partition files
    ///
    /// Messages are grouped by the UTC day of their `ts`. Per day, a new
    /// `ts` is an insertion, a known `ts` with different content replaces
    /// the archived record, an identical record is skipped. A day whose
    /// content is unchanged is not rewritten, so re-merging a batch leaves
    /// every file byte-identical. The directory is only created when the
    /// first day file is about to be written.
    pub fn merge(&self, kind: &str, messages: &[Message]) -> Result<MergeOutcome> {
        let mut by_day: BTreeMap<String, Vec<&Message>> = BTreeMap::new();
        for msg in messages {
            match msg.ts().and_then(|ts| ts.day()) {
                Some(day) => by_day.entry(day).or_default().push(msg),
                None => warn!("{}: skipping message without a usable ts", self.label),
            }
        }

        let mut outcome = MergeOutcome::default();
        for (day, day_msgs) in by_day {
            outcome.absorb(self.merge_day(kind, &day, &day_msgs)?);
        }
        Ok(outcome)
    }

    fn merge_day(&self, kind: &str, day: &str, day_msgs: &[&Message]) -> Result<MergeOutcome> {
        let path = self.day_path(day);
        let existing = if path.exists() {
            Self::load(&path)?
        } else {
            Vec::new()
        };

        // Keying by ts also collapses duplicates already in the file
        let mut current: BTreeMap<Ts, Message> = BTreeMap::new();
        for msg in existing {
            match msg.ts() {
                Some(ts) => {
                    current.insert(ts, msg);
                }
                None => warn!("{}: dropping record without ts from {}", self.label, path.display()),
            }
        }

        let mut outcome = MergeOutcome::default();
        for msg in day_msgs {
            let Some(ts) = msg.ts() else { continue };
            outcome.latest = outcome.latest.take().max(Some(ts.clone()));
            match current.get(&ts) {
                Some(old) if old == *msg => continue,
                Some(_) => outcome.updated += 1,
                None => outcome.inserted += 1,
            }
            outcome.fresh.push((*msg).clone());
            current.insert(ts, (*msg).clone());
        }

        if outcome.inserted == 0 && outcome.updated == 0 {
            return Ok(outcome);
        }

        if outcome.inserted > 0 {
            info!(
                "{}: {} new {} messages (saving to {})",
                self.label,
                outcome.inserted,
                kind,
                path.display()
            );
        }
        if outcome.updated > 0 {
            info!(
                "{}: {} updated {} messages (saving to {})",
                self.label,
                outcome.updated,
                kind,
                path.display()
            );
        }

        fs::create_dir_all(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        let merged: Vec<Message> = current.into_values().collect();
        write_json(&path, &merged)?;

        Ok(outcome)
    }
}

/// `YYYY-MM-DD`
pub fn is_day_name(name: &str) -> bool {
    // chrono accepts unpadded fields, the archive never writes them
    name.len() == 10 && NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok()
}
