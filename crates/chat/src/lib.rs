//! Chat crate - Incremental Slack workspace archiving
//!
//! This crate provides everything the `lyra` CLI runs:
//! - Domain models (Ts, Message, Conversation, EntityKind)
//! - Slack Web API client with retry on transient failures
//! - JSON archive storage partitioned by day
//! - Incremental conversation sync and the files listing walk
//! - A resumable, multi-threaded attachment downloader
//! - Layout migrations and the delete-old-files pass
//!
//! The crate has no async runtime; network calls block the calling thread.

pub mod actions;
pub mod archive;
pub mod config;
pub mod download;
pub mod migrate;
pub mod models;
pub mod slack;
pub mod storage;
pub mod sync;

pub use actions::{DeleteReport, FileCleanup, parse_age};
pub use archive::{Archive, RefreshStats, RunOptions, RunStats};
pub use config::ArchiveConfig;
pub use download::{
    AttachmentSink, DownloadSummary, Downloader, DownloaderOptions, Fetch, FetchResponse, HttpFetcher,
    Job, PendingQueue, WorkerPool, name_for, url_to_filename,
};
pub use models::{Conversation, ConversationType, EntityKind, FileWalkStatus, Message, Ts};
pub use slack::{ApiError, InMemorySlack, RetryPolicy, SlackApi, SlackClient};
pub use storage::{ConversationDir, MergeOutcome, SnapshotStore};
pub use sync::{ConversationSync, FileIndex, FileWalkStats, SyncOptions, SyncStats, Watermark};
