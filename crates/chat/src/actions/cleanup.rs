//! Deleting old files from the workspace
//!
//! Only files whose download is present in the archive are deleted, and
//! only when confirmed; otherwise the pass reports what it would delete.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeDelta};
use log::{debug, error, info};
use rayon::prelude::*;
use regex::Regex;
use serde_json::Value;

use crate::download::file_missing;
use crate::slack::{RetryPolicy, SlackApi};
use crate::storage::write_json;
use crate::sync::{DELETED_MARKER, FileIndex};

/// Concurrent `files.delete` calls
const DELETE_THREADS: usize = 10;

/// Outcome of a delete pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Deleted, or that would be deleted in a dry run
    pub deleted: usize,
    /// Not deleted because the archived copy is missing or incomplete
    pub skipped: usize,
    pub errors: usize,
    pub dry_run: bool,
}

static AGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s(m|d)").expect("valid regex"));

/// Parse an age like `"60 days"` or `"2 months"` (a month is 30 days)
pub fn parse_age(s: &str) -> Option<TimeDelta> {
    let captures = AGE.captures(s)?;
    let count: i64 = captures[1].parse().ok()?;
    let days_per_unit = if &captures[2] == "m" { 30 } else { 1 };
    TimeDelta::try_days(count.checked_mul(days_per_unit)?)
}

/// Deletes files recorded before a cutoff day
pub struct FileCleanup<'a> {
    api: &'a dyn SlackApi,
    retry: &'a RetryPolicy,
    index: &'a FileIndex,
    storage: PathBuf,
}

impl<'a> FileCleanup<'a> {
    pub fn new(api: &'a dyn SlackApi, retry: &'a RetryPolicy, index: &'a FileIndex, storage: &Path) -> Self {
        Self {
            api,
            retry,
            index,
            storage: storage.to_path_buf(),
        }
    }

    /// Delete files created before `cutoff`; a dry run unless `confirm`
    pub fn run(&self, cutoff: NaiveDate, confirm: bool) -> Result<DeleteReport> {
        let cutoff_day = cutoff.format("%Y-%m-%d").to_string();
        let preview = if confirm {
            ""
        } else {
            " (PREVIEW ONLY; use '--confirm-delete' to actually delete these files)"
        };
        info!("Deleting files created before {}...{}", cutoff_day, preview);

        let mut report = DeleteReport {
            dry_run: !confirm,
            ..Default::default()
        };
        let mut candidates = Vec::new();
        for (path, file) in self.index.records(Some(&cutoff_day))? {
            if file.get(DELETED_MARKER).and_then(Value::as_bool) == Some(true) {
                continue;
            }
            if let Some(reason) = file_missing(&self.storage, &file) {
                debug!("{}: {}", path.display(), reason);
                report.skipped += 1;
                continue;
            }
            candidates.push((path, file));
        }

        if !confirm {
            report.deleted = candidates.len();
        } else {
            let deleted = AtomicUsize::new(0);
            let errors = AtomicUsize::new(0);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(DELETE_THREADS)
                .thread_name(|i| format!("delete-{}", i))
                .build()
                .context("Failed to start delete threads")?;

            pool.install(|| {
                candidates.into_par_iter().for_each(|(path, file)| {
                    match self.delete(&path, file) {
                        Ok(()) => deleted.fetch_add(1, Ordering::SeqCst),
                        Err(e) => {
                            error!("{:#}", e);
                            errors.fetch_add(1, Ordering::SeqCst)
                        }
                    };
                    let done = deleted.load(Ordering::SeqCst) + errors.load(Ordering::SeqCst);
                    if done % 10 == 0 {
                        info!("Deleted files: {} (errors: {})", deleted.load(Ordering::SeqCst), errors.load(Ordering::SeqCst));
                    }
                });
            });

            report.deleted = deleted.into_inner();
            report.errors = errors.into_inner();
        }

        info!("Deleted files: {}{}", report.deleted, preview);
        if report.skipped > 0 && report.deleted > 0 {
            info!(
                "Skipped files: {} (their archived copy is missing or incomplete; run with --verbose for details)",
                report.skipped
            );
        }
        if report.errors > 0 {
            info!("Errors: {}", report.errors);
        }
        Ok(report)
    }

    /// Delete one file remotely and mark its record
    fn delete(&self, path: &Path, mut file: Value) -> Result<()> {
        let id = file
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("{}: file record has no id", path.display()))?;

        self.retry
            .call("files.delete", || self.api.delete_file(&id))
            .with_context(|| format!("deleting file {}", id))?;

        if let Some(obj) = file.as_object_mut() {
            obj.insert(DELETED_MARKER.to_string(), Value::Bool(true));
        }
        write_json(path, &file)
    }
}
