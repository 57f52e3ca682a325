//! Download jobs and the pending set persisted between runs

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::{read_json, write_json};

/// One file to fetch
///
/// Identity is the local target. Serialized as a `[url, target]` pair; the
/// attempt counter only lives for the current run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, PathBuf)", into = "(String, PathBuf)")]
pub struct Job {
    pub url: String,
    pub target: PathBuf,
    pub attempts: u32,
}

impl Job {
    pub fn new(url: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            target: target.into(),
            attempts: 0,
        }
    }

    /// The same job, one failure later
    pub fn retried(self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self
        }
    }
}

impl From<(String, PathBuf)> for Job {
    fn from((url, target): (String, PathBuf)) -> Self {
        Job::new(url, target)
    }
}

impl From<Job> for (String, PathBuf) {
    fn from(job: Job) -> Self {
        (job.url, job.target)
    }
}

/// Jobs not confirmed complete, kept in `pending.json`
pub struct PendingQueue {
    path: PathBuf,
}

impl PendingQueue {
    pub const FILE_NAME: &'static str = "pending.json";

    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Jobs left by the previous run; empty when there is no file
    pub fn load(&self) -> Result<Vec<Job>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_json(&self.path)
    }

    /// Replace the pending set with `jobs`
    ///
    /// Duplicates (by target) and jobs whose target already exists are
    /// dropped. An empty set removes the file.
    pub fn store(&self, jobs: &[Job]) -> Result<usize> {
        let mut seen = HashSet::new();
        let jobs: Vec<&Job> = jobs
            .iter()
            .filter(|job| !job.target.exists())
            .filter(|job| seen.insert(job.target.clone()))
            .collect();

        if jobs.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to remove {}", self.path.display()));
                }
            }
            return Ok(0);
        }

        write_json(&self.path, &jobs)?;
        Ok(jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_job_serializes_as_pair() {
        let job = Job::new("https://example.com/a", "/tmp/a").retried();
        assert_eq!(serde_json::to_string(&job).unwrap(), r#"["https://example.com/a","/tmp/a"]"#);
        let back: Job = serde_json::from_str(r#"["https://example.com/a","/tmp/a"]"#).unwrap();
        assert_eq!(back.attempts, 0);
        assert_eq!(back.target, PathBuf::from("/tmp/a"));
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::new(dir.path());
        assert!(queue.load().unwrap().is_empty());

        let a = Job::new("https://example.com/a", dir.path().join("a"));
        let b = Job::new("https://example.com/b", dir.path().join("b"));
        assert_eq!(queue.store(&[a.clone(), b.clone(), a.clone()]).unwrap(), 2);
        assert_eq!(queue.load().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_completed_jobs_dropped() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::new(dir.path());
        let done = dir.path().join("done");
        fs::write(&done, b"x").unwrap();

        queue.store(&[Job::new("https://example.com/x", "/nonexistent/x")]).unwrap();
        assert!(queue.path().exists());

        assert_eq!(queue.store(&[Job::new("https://example.com/done", &done)]).unwrap(), 0);
        assert!(!queue.path().exists());
    }
}
