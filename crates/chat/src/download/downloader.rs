//! Resumable, deduplicating file downloader
//!
//! Files land in `<root>/_files/storage/<name>` next to a
//! `meta-<name>.txt` holding the response status and headers. A target that
//! exists is complete: it only appears through an atomic rename.

use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use serde_json::Value;

use super::fetch::{Fetch, HttpFetcher, request_headers};
use super::naming::name_for;
use super::pool::{Requeue, WorkerPool};
use super::queue::{Job, PendingQueue};
use super::AttachmentSink;
use crate::slack::is_slack_url;
use crate::storage::{AtomicFile, write_atomic};

/// Downloader settings
#[derive(Debug, Clone)]
pub struct DownloaderOptions {
    pub workers: usize,
    /// Accept and drop every enqueue
    pub no_download: bool,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            no_download: false,
        }
    }
}

/// Counters of a finished downloader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    /// Failed attempts, including ones that succeeded on retry
    pub failed: usize,
    /// Jobs saved to `pending.json` for the next run
    pub pending: usize,
}

/// Directory lock held while a target is being fetched
struct LockMarker {
    path: PathBuf,
}

impl LockMarker {
    /// `None` when another worker holds the lock
    fn acquire(path: PathBuf) -> Result<Option<Self>> {
        match fs::create_dir(&path) {
            Ok(()) => Ok(Some(Self { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to create lock {}", path.display())),
        }
    }
}

impl Drop for LockMarker {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

/// State shared by the download workers
struct Worker {
    fetcher: Box<dyn Fetch>,
    token: String,
    lockdir: PathBuf,
    downloaded: AtomicUsize,
    failed: AtomicUsize,
}

impl Worker {
    fn handle(&self, job: Job, queue: &Requeue<Job>) -> Result<()> {
        if job.target.exists() {
            return Ok(());
        }
        let name = job
            .target
            .file_name()
            .with_context(|| format!("Download target has no file name: {}", job.target.display()))?;

        let result = {
            let Some(_lock) = LockMarker::acquire(self.lockdir.join(name))? else {
                debug!("{} is being downloaded by another worker", job.url);
                return Ok(());
            };
            if job.target.exists() {
                return Ok(());
            }
            self.download(&job)
        };

        match result {
            Ok(()) => {
                let count = self.downloaded.fetch_add(1, Ordering::SeqCst) + 1;
                info!("Downloaded {} ({} left): {}", count, queue.len().saturating_sub(1), job.url);
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                let url = job.url.clone();
                if job.attempts == 0 {
                    queue.put(job.retried());
                } else {
                    queue.park(job);
                }
                Err(e.context(format!("Failed to download {}", url)))
            }
        }
    }

    fn download(&self, job: &Job) -> Result<()> {
        let meta_path = meta_path(&job.target)?;
        let headers = request_headers(&job.url, &self.token);

        let response = match self.fetcher.get(&job.url, &headers) {
            Ok(response) => response,
            Err(e) => {
                write_atomic(&meta_path, format!("999\nException: {:#}", e).as_bytes())?;
                return Err(e);
            }
        };

        if !(200..300).contains(&response.status) {
            warn!("{}: HTTP {} (saving the response anyway)", job.url, response.status);
        }

        let meta = format!(
            "{}\n{}",
            response.status,
            response
                .headers
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let etag = response.header("etag").map(str::to_string);

        let mut out = AtomicFile::create(&job.target)?;
        let mut hasher = Md5::new();
        let mut body = response.body;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = body
                .read(&mut buf)
                .with_context(|| format!("Failed to read response body of {}", job.url))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .with_context(|| format!("Failed to write {}", job.target.display()))?;
        }

        write_atomic(&meta_path, meta.as_bytes())?;
        out.commit()?;

        if is_slack_url(&job.url) {
            let digest = hex::encode(hasher.finalize());
            if let Some(expected) = etag.as_deref().and_then(md5_etag) {
                if expected != digest {
                    warn!(
                        "Downloading {}: checksum does not match. etag {} != md5 {}",
                        job.url, expected, digest
                    );
                }
            }
        }
        Ok(())
    }
}

/// The MD5 digest carried by a strong entity tag
fn md5_etag(etag: &str) -> Option<String> {
    if etag.starts_with("W/") {
        return None;
    }
    let tag = etag.trim().trim_matches('"').to_ascii_lowercase();
    (tag.len() == 32 && tag.chars().all(|c| c.is_ascii_hexdigit())).then_some(tag)
}

fn meta_path(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .with_context(|| format!("Download target has no file name: {}", target.display()))?;
    Ok(target.with_file_name(format!("meta-{}.txt", name.to_string_lossy())))
}

/// Downloads attachments on a worker pool, resuming across runs
///
/// Jobs left from the previous run are loaded on start. Call
/// [`Downloader::finish`] to drain the queue; dropping the downloader
/// instead stops the workers early. Either way every job not completed is
/// written back to `pending.json`.
pub struct Downloader {
    storage: PathBuf,
    pending: PendingQueue,
    pool: Option<WorkerPool<Job>>,
    worker: Arc<Worker>,
    no_download: bool,
}

impl Downloader {
    /// Start a downloader for the archive at `root`, fetching over HTTP
    pub fn start(root: &Path, token: &str, options: DownloaderOptions) -> Result<Self> {
        Self::with_fetcher(root, token, HttpFetcher::new(), options)
    }

    pub fn with_fetcher(
        root: &Path,
        token: &str,
        fetcher: impl Fetch + 'static,
        options: DownloaderOptions,
    ) -> Result<Self> {
        let storage = storage_dir(root);
        fs::create_dir_all(&storage)
            .with_context(|| format!("Failed to create {}", storage.display()))?;

        // Locks only guard the current run
        let lockdir = root.join("_lockdir");
        if lockdir.exists() {
            fs::remove_dir_all(&lockdir)
                .with_context(|| format!("Failed to clear {}", lockdir.display()))?;
        }
        fs::create_dir_all(&lockdir)
            .with_context(|| format!("Failed to create {}", lockdir.display()))?;

        let worker = Arc::new(Worker {
            fetcher: Box::new(fetcher),
            token: token.to_string(),
            lockdir,
            downloaded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        let handler = Arc::clone(&worker);
        let pool = WorkerPool::start("download", options.workers, move |job: Job, queue: &Requeue<Job>| {
            handler.handle(job, queue)
        })?;

        let pending = PendingQueue::new(root);
        let resumed = pending.load()?;
        if !resumed.is_empty() {
            info!("Resuming {} pending downloads", resumed.len());
        }
        for job in resumed {
            if !job.target.exists() {
                pool.put(job);
            }
        }

        Ok(Self {
            storage,
            pending,
            pool: Some(pool),
            worker,
            no_download: options.no_download,
        })
    }

    /// Local path a URL downloads to
    pub fn target_for(&self, url: &str, hint: Option<&str>) -> PathBuf {
        self.storage.join(name_for(url, hint))
    }

    /// Why the file descriptor's download is missing or wrong, if it is
    pub fn is_file_missing(&self, file: &Value) -> Option<String> {
        file_missing(&self.storage, file)
    }

    pub fn downloaded(&self) -> usize {
        self.worker.downloaded.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.worker.failed.load(Ordering::SeqCst)
    }

    /// Jobs queued or in flight
    pub fn remaining(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::len)
    }

    /// Drain the queue, stop the workers and persist what did not complete
    pub fn finish(mut self) -> Result<DownloadSummary> {
        let pending = match self.pool.take() {
            Some(mut pool) => {
                pool.join();
                self.persist(&pool)?
            }
            None => 0,
        };
        Ok(DownloadSummary {
            downloaded: self.downloaded(),
            failed: self.failed(),
            pending,
        })
    }

    fn persist(&self, pool: &WorkerPool<Job>) -> Result<usize> {
        let left = self.pending.store(&pool.incomplete())?;
        if left > 0 {
            warn!(
                "{} downloads did not complete; saved to {}",
                left,
                self.pending.path().display()
            );
        }
        Ok(left)
    }
}

impl AttachmentSink for Downloader {
    fn enqueue(&self, url: &str, hint: Option<&str>) -> bool {
        if self.no_download {
            return false;
        }
        let Some(pool) = &self.pool else {
            return false;
        };
        let target = self.target_for(url, hint);
        if target.exists() {
            return false;
        }
        pool.put(Job::new(url, target));
        true
    }
}

impl Drop for Downloader {
    fn drop(&mut self) {
        let Some(mut pool) = self.pool.take() else {
            return;
        };
        pool.cancel();
        if let Err(e) = self.persist(&pool) {
            log::error!("Failed to save pending downloads: {:#}", e);
        }
    }
}

/// Why a file descriptor's download under `storage` is missing or wrong
///
/// JPEGs are exempt from the size check: Slack recompresses them.
pub fn file_missing(storage: &Path, file: &Value) -> Option<String> {
    let Some(url) = file.get("url_private").and_then(Value::as_str) else {
        return Some("has no url_private".to_string());
    };
    let target = storage.join(name_for(url, None));
    let Ok(meta) = fs::metadata(&target) else {
        return Some(format!("{} does not exist", target.display()));
    };

    let expected = file.get("size").and_then(Value::as_u64);
    let is_jpeg = file.get("mimetype").and_then(Value::as_str) == Some("image/jpeg");
    match expected {
        Some(size) if size != meta.len() && !is_jpeg => Some(format!(
            "size does not match (actual size {} != expected size {})",
            meta.len(),
            size
        )),
        _ => None,
    }
}

/// Where downloads of the archive at `root` are stored
pub fn storage_dir(root: &Path) -> PathBuf {
    root.join("_files").join("storage")
}
