//! Workspace files listing
//!
//! Directory structure:
//! ```text
//! <archive_root>/_files/
//!   status.json          # walk progress
//!   2024-01-01/
//!     F0123ABCD.json     # file descriptor, by creation day (UTC)
//!   storage/             # downloads, see the download module
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::DateTime;
use log::info;
use serde_json::Value;

use crate::download::AttachmentSink;
use crate::models::FileWalkStatus;
use crate::slack::api::FilesQuery;
use crate::slack::{RetryPolicy, SlackApi};
use crate::storage::{is_day_name, read_json, write_json};

/// Marker set on a file record once the file was deleted from the workspace
pub const DELETED_MARKER: &str = "_archive_deleted";

/// What one files walk did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileWalkStats {
    pub pages: usize,
    pub records: usize,
    pub attachments: usize,
}

/// The `_files` directory of an archive
#[derive(Debug, Clone)]
pub struct FileIndex {
    path: PathBuf,
}

impl FileIndex {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join("_files"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn status_path(&self) -> PathBuf {
        self.path.join("status.json")
    }

    pub fn status(&self) -> Result<FileWalkStatus> {
        let path = self.status_path();
        if !path.exists() {
            return Ok(FileWalkStatus::default());
        }
        read_json(&path)
    }

    fn save_status(&self, status: &FileWalkStatus) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        write_json(&self.status_path(), status)
    }

    /// Where a file descriptor is recorded
    pub fn record_path(&self, file: &Value) -> Option<PathBuf> {
        let id = file.get("id").and_then(Value::as_str)?;
        let created = file.get("created").and_then(Value::as_i64)?;
        let day = DateTime::from_timestamp(created, 0)?.format("%Y-%m-%d").to_string();
        Some(self.path.join(day).join(format!("{}.json", id)))
    }

    /// Walk the listing, record every file seen and queue its download
    ///
    /// The first walk pages backward from the newest file until the oldest
    /// is found; every walk then pages forward from the newest file seen.
    /// Progress is saved after each page.
    pub fn refresh(
        &self,
        api: &dyn SlackApi,
        retry: &RetryPolicy,
        sink: &dyn AttachmentSink,
    ) -> Result<FileWalkStats> {
        let mut status = self.status()?;
        let mut stats = FileWalkStats::default();

        if !status.backward_done() {
            info!("Walking backwards to find oldest file (this may take a little while)...");
            let mut oldest: Option<Value> = None;
            loop {
                let query = status.ts_to_oldest.map_or_else(FilesQuery::newest, FilesQuery::up_to);
                let files = self.list(api, retry, &query)?;
                stats.pages += 1;
                if files.first().is_none() || same_file(files.first(), oldest.as_ref()) {
                    status.oldest_file = oldest;
                    self.save_status(&status)?;
                    info!("Oldest file found! Starting on new files...");
                    break;
                }

                self.record(&files, sink, &mut stats)?;
                let (first, last) = (created(&files[0]), created(&files[files.len() - 1]));
                oldest = Some(files[0].clone());
                // The forward walk stops once it sees this file again
                if status.newest_file.as_ref().is_none_or(|newest| created(newest) <= last) {
                    status.newest_file = Some(files[files.len() - 1].clone());
                }
                status = status.after_backward_page(first, last);
                self.save_status(&status)?;
                info!("Files walked back to {} ({} recorded)", first, stats.records);
            }
        }

        let mut newest = status.newest_file.clone();
        loop {
            let query = status.ts_from_newest.map_or_else(FilesQuery::newest, FilesQuery::since);
            let files = self.list(api, retry, &query)?;
            stats.pages += 1;
            if files.last().is_none() || same_file(files.last(), newest.as_ref()) {
                status.newest_file = newest;
                self.save_status(&status)?;
                break;
            }

            self.record(&files, sink, &mut stats)?;
            let last = files[files.len() - 1].clone();
            status = status.after_forward_page(created(&last));
            newest = Some(last);
            self.save_status(&status)?;
        }

        Ok(stats)
    }

    /// One page, oldest first
    fn list(&self, api: &dyn SlackApi, retry: &RetryPolicy, query: &FilesQuery) -> Result<Vec<Value>> {
        let mut files = retry
            .call("files.list", || api.list_files(query))
            .context("Failed to list files")?;
        files.sort_by_key(created);
        Ok(files)
    }

    fn record(&self, files: &[Value], sink: &dyn AttachmentSink, stats: &mut FileWalkStats) -> Result<()> {
        for file in files {
            stats.attachments += sink.enqueue_file(file);
            let Some(path) = self.record_path(file) else {
                log::warn!("Skipping file without id or creation time: {}", file);
                continue;
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            write_json(&path, file)?;
            stats.records += 1;
        }
        Ok(())
    }

    /// Recorded file descriptors in day directories, with their paths
    ///
    /// Only days strictly before `before` (a `YYYY-MM-DD` string) when given.
    pub fn records(&self, before: Option<&str>) -> Result<Vec<(PathBuf, Value)>> {
        if !self.path.is_dir() {
            return Ok(Vec::new());
        }

        let mut days = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("Failed to list {}", self.path.display()))?
        {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if is_day_name(&name) && path.is_dir() && before.is_none_or(|b| name.as_str() < b) {
                days.push(path);
            }
        }
        days.sort();

        let mut records = Vec::new();
        for day in days {
            let mut files: Vec<PathBuf> = fs::read_dir(&day)
                .with_context(|| format!("Failed to list {}", day.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            for file in files {
                let value: Value = read_json(&file)?;
                records.push((file, value));
            }
        }
        Ok(records)
    }
}

fn created(file: &Value) -> i64 {
    file.get("created").and_then(Value::as_i64).unwrap_or(0)
}

fn same_file(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match (a.get("id"), b.get("id")) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::InMemorySlack;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl AttachmentSink for Recorder {
        fn enqueue(&self, url: &str, _hint: Option<&str>) -> bool {
            self.0.lock().unwrap().push(url.to_string());
            true
        }
    }

    fn file(id: &str, created: i64) -> Value {
        json!({"id": id, "created": created, "url_private": format!("https://files.slack.com/{}", id)})
    }

    #[test]
    fn test_record_path() {
        let index = FileIndex::new(Path::new("/archive"));
        assert_eq!(
            index.record_path(&file("F1", 1704067200)),
            Some(PathBuf::from("/archive/_files/2024-01-01/F1.json"))
        );
        assert_eq!(index.record_path(&json!({"id": "F1"})), None);
    }

    #[test]
    fn test_walk_backward_then_forward() {
        let dir = TempDir::new().unwrap();
        let slack = InMemorySlack::new();
        for (i, created) in [100_000, 200_000, 300_000, 400_000, 500_000].iter().enumerate() {
            slack.add_file(file(&format!("F{}", i), *created));
        }
        let index = FileIndex::new(dir.path());
        let sink = Recorder::default();
        let retry = RetryPolicy::new().with_unit(Duration::ZERO);

        let stats = index.refresh(&slack, &retry, &sink).unwrap();
        assert_eq!(index.records(None).unwrap().len(), 5);
        // One backward page, the page that finds the oldest again, and one
        // forward page that only confirms the newest file
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.records, 5);
        let status = index.status().unwrap();
        assert_eq!(status.oldest_file.as_ref().unwrap()["id"], "F0");
        assert_eq!(status.newest_file.as_ref().unwrap()["id"], "F4");
        assert_eq!(status.ts_from_newest, Some(500_000));

        // A new file is picked up by the forward walk alone
        slack.add_file(file("F5", 600_000));
        let before = slack.calls().len();
        index.refresh(&slack, &retry, &sink).unwrap();
        assert_eq!(index.records(None).unwrap().len(), 6);
        assert!(slack.calls()[before..].iter().all(|c| c.starts_with("files.list:Some")));
        assert_eq!(index.status().unwrap().newest_file.unwrap()["id"], "F5");
    }

    #[test]
    fn test_records_before() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::new(dir.path());
        let slack = InMemorySlack::new();
        slack.add_file(file("OLD", 86_400));
        slack.add_file(file("NEW", 10 * 86_400));
        let sink = Recorder::default();
        index
            .refresh(&slack, &RetryPolicy::new().with_unit(Duration::ZERO), &sink)
            .unwrap();

        let old = index.records(Some("1970-01-05")).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].1["id"], "OLD");
    }

    #[test]
    fn test_empty_workspace() {
        let dir = TempDir::new().unwrap();
        let index = FileIndex::new(dir.path());
        let slack = InMemorySlack::new();
        let stats = index
            .refresh(&slack, &RetryPolicy::new().with_unit(Duration::ZERO), &Recorder::default())
            .unwrap();
        assert_eq!(stats.records, 0);
        assert!(!index.status().unwrap().backward_done());
    }
}
