//! Top-level archive coordinator
//!
//! One [`Archive`] mirrors one workspace into a directory:
//!
//! ```text
//! <root>/
//!   emoji.json  users.json  conversations.json   # list snapshots
//!   _<entity>-archive/                           # superseded snapshots
//!   <conversation_id>/<YYYY-MM-DD>.json          # messages by day
//!   _files/<YYYY-MM-DD>/<file_id>.json           # file records
//!   _files/storage/                              # downloads
//!   pending.json                                 # unfinished downloads
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use serde_json::Value;

use crate::actions::{DeleteReport, FileCleanup};
use crate::config::ArchiveConfig;
use crate::download::{
    AttachmentSink, DownloadSummary, Downloader, DownloaderOptions, Fetch, HttpFetcher, storage_dir,
};
use crate::migrate;
use crate::models::{Conversation, ConversationType, EntityKind};
use crate::slack::{RetryPolicy, SlackApi, SlackClient};
use crate::storage::{ConversationDir, SnapshotStore};
use crate::sync::{ConversationSync, FileIndex, FileWalkStats, SyncOptions};

/// Options for one archive run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Re-queue every attachment the archive references
    pub download_everything: bool,
    /// Actually delete old files instead of reporting them
    pub confirm_delete: bool,
    /// Download worker threads
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            download_everything: false,
            confirm_delete: false,
            workers: DownloaderOptions::default().workers,
        }
    }
}

/// What one refresh did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub conversations: usize,
    pub failed_conversations: usize,
    /// Messages inserted across all conversations
    pub inserted: usize,
    pub updated: usize,
    /// Snapshots that changed
    pub snapshots_changed: usize,
    pub files: FileWalkStats,
}

/// What one run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Whether a layout migration changed the archive
    pub migrated: bool,
    /// Downloads queued by the full re-scan
    pub requeued: usize,
    pub refresh: RefreshStats,
    pub downloads: DownloadSummary,
    pub deleted: Option<DeleteReport>,
}

/// A workspace mirrored into a directory
pub struct Archive {
    root: PathBuf,
    config: ArchiveConfig,
    api: Box<dyn SlackApi>,
    retry: RetryPolicy,
    snapshots: SnapshotStore,
    files: FileIndex,
}

impl Archive {
    /// Open the archive described by `config`, talking to Slack over HTTP
    pub fn open(config: ArchiveConfig) -> Result<Self> {
        let client = SlackClient::new(config.token.clone());
        Self::with_api(config, client)
    }

    /// Open the archive with a specific API implementation
    ///
    /// A missing root is created readable by the owner only.
    pub fn with_api(config: ArchiveConfig, api: impl SlackApi + 'static) -> Result<Self> {
        let root = config.dir.clone();
        if !root.exists() {
            fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create archive {}", root.display()))?;
            restrict_permissions(&root)?;
            migrate::set_layout_version(&root, migrate::latest_version())?;
            info!("{}: created archive at {}", config.name, root.display());
        }

        Ok(Self {
            snapshots: SnapshotStore::new(&root),
            files: FileIndex::new(&root),
            root,
            config,
            api: Box::new(api),
            retry: RetryPolicy::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn needs_upgrade(&self) -> Result<bool> {
        Ok(!migrate::pending(&self.root)?.is_empty())
    }

    /// Apply pending layout migrations; returns whether anything moved
    pub fn upgrade(&self) -> Result<bool> {
        migrate::upgrade(&self.root)
    }

    /// Run everything: upgrade, downloads, refresh, then the delete pass
    pub fn run(&self, options: &RunOptions) -> Result<RunStats> {
        self.run_with_fetcher(options, HttpFetcher::new())
    }

    pub fn run_with_fetcher(&self, options: &RunOptions, fetcher: impl Fetch + 'static) -> Result<RunStats> {
        let mut stats = RunStats {
            migrated: self.upgrade()?,
            ..Default::default()
        };

        let downloader = Downloader::with_fetcher(
            &self.root,
            &self.config.token,
            fetcher,
            DownloaderOptions {
                workers: options.workers,
                no_download: !self.config.download_files,
            },
        )?;

        let body = (|| -> Result<()> {
            if stats.migrated || options.download_everything {
                stats.requeued = self.download_all_files(&downloader)?;
            }
            stats.refresh = self.refresh(&downloader)?;
            Ok(())
        })();

        // Persist unfinished downloads even when the body failed
        stats.downloads = downloader.finish()?;
        body?;

        info!(
            "{}: {} conversations ({} failed), {} new messages, {} downloaded",
            self.config.name,
            stats.refresh.conversations,
            stats.refresh.failed_conversations,
            stats.refresh.inserted,
            stats.downloads.downloaded
        );

        if self.config.delete_old_files.is_some() {
            stats.deleted = self.delete_old_files(options.confirm_delete)?;
        }
        Ok(stats)
    }

    /// Refresh every list and conversation, queueing new attachments on `sink`
    pub fn refresh(&self, sink: &dyn AttachmentSink) -> Result<RefreshStats> {
        let mut stats = RefreshStats::default();
        for kind in EntityKind::ALL {
            match kind {
                EntityKind::Emoji => {
                    let emoji = self.refresh_list(kind, &[], &mut stats)?;
                    for url in emoji_urls(&emoji) {
                        sink.enqueue(url, None);
                    }
                }
                EntityKind::Files => {
                    if !self.config.download_public_data {
                        continue;
                    }
                    info!("{}: refreshing files", self.config.name);
                    stats.files = self.files.refresh(self.api.as_ref(), &self.retry, sink)?;
                }
                EntityKind::Users => {
                    let users = self.refresh_list(kind, &[], &mut stats)?;
                    for user in users.as_array().into_iter().flatten() {
                        sink.enqueue_user(user);
                    }
                }
                EntityKind::Conversations => {
                    let types: &[ConversationType] = if self.config.download_public_data {
                        &ConversationType::ALL
                    } else {
                        &ConversationType::PRIVATE
                    };
                    let conversations = self.refresh_list(kind, types, &mut stats)?;
                    self.sync_conversations(&conversations, sink, &mut stats);
                }
            }
        }
        Ok(stats)
    }

    /// Fetch a list and replace its snapshot when it changed
    fn refresh_list(
        &self,
        kind: EntityKind,
        types: &[ConversationType],
        stats: &mut RefreshStats,
    ) -> Result<Value> {
        info!("{}: refreshing {}", self.config.name, kind);
        let list = self.fetch_list(kind, types)?;
        if self.snapshots.replace_if_changed(kind, &list)? {
            stats.snapshots_changed += 1;
        }
        Ok(list)
    }

    /// Every page of a list endpoint; non-array responses (emoji) are one page
    fn fetch_list(&self, kind: EntityKind, types: &[ConversationType]) -> Result<Value> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .retry
                .call(kind.endpoint(), || self.api.list(kind, types, cursor.as_deref()))
                .with_context(|| format!("Failed to list {}", kind))?;
            match page.items {
                Value::Array(batch) => items.extend(batch),
                other => return Ok(other),
            }
            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(Value::Array(items))
    }

    fn sync_conversations(&self, list: &Value, sink: &dyn AttachmentSink, stats: &mut RefreshStats) {
        let sync = ConversationSync::new(self.api.as_ref(), &self.retry, sink).with_options(SyncOptions {
            trunk_lookback: self.config.trunk_lookback,
        });

        for value in list.as_array().into_iter().flatten() {
            let Some(conversation) = Conversation::from_value(value) else {
                warn!("{}: skipping unreadable conversation {}", self.config.name, value);
                continue;
            };
            stats.conversations += 1;
            let dir = self.conversation_dir(&conversation);
            match sync.sync(&conversation, &dir) {
                Ok(done) => {
                    stats.inserted += done.inserted;
                    stats.updated += done.updated;
                }
                Err(e) => {
                    error!("{}: {:#}", conversation.pretty_name(), e);
                    stats.failed_conversations += 1;
                }
            }
        }
    }

    fn conversation_dir(&self, conversation: &Conversation) -> ConversationDir {
        ConversationDir::new(self.root.join(&conversation.id), conversation.pretty_name())
    }

    /// Queue every attachment the archive references
    ///
    /// Already-downloaded targets are skipped by the sink.
    pub fn download_all_files(&self, sink: &dyn AttachmentSink) -> Result<usize> {
        info!("{}: scanning archive for missing downloads", self.config.name);
        let mut queued = 0;

        if let Some(conversations) = self.snapshots.load(EntityKind::Conversations)? {
            for value in conversations.as_array().into_iter().flatten() {
                let Some(conversation) = Conversation::from_value(value) else {
                    continue;
                };
                let dir = self.conversation_dir(&conversation);
                for message in dir.all_messages()? {
                    if message.has_attachments() {
                        queued += sink.enqueue_message(&message);
                    }
                }
            }
        }

        if let Some(users) = self.snapshots.load(EntityKind::Users)? {
            for user in users.as_array().into_iter().flatten() {
                queued += sink.enqueue_user(user);
            }
        }

        if let Some(emoji) = self.snapshots.load(EntityKind::Emoji)? {
            queued += emoji_urls(&emoji).filter(|url| sink.enqueue(url, None)).count();
        }

        for (_, file) in self.files.records(None)? {
            queued += sink.enqueue_file(&file);
        }

        info!("{}: queued {} missing downloads", self.config.name, queued);
        Ok(queued)
    }

    /// Delete workspace files older than the configured age
    ///
    /// `None` when the archive has no age configured.
    pub fn delete_old_files(&self, confirm: bool) -> Result<Option<DeleteReport>> {
        let Some(age) = self.config.delete_old_files else {
            return Ok(None);
        };
        let cutoff = (Utc::now() - age).date_naive();
        let storage = storage_dir(&self.root);
        let cleanup = FileCleanup::new(self.api.as_ref(), &self.retry, &self.files, &storage);
        cleanup.run(cutoff, confirm).map(Some)
    }
}

/// Custom emoji image URLs (aliases like `alias:thumbsup` are skipped)
fn emoji_urls(emoji: &Value) -> impl Iterator<Item = &str> {
    emoji
        .as_object()
        .into_iter()
        .flat_map(|map| map.values())
        .filter_map(Value::as_str)
        .filter(|url| url.starts_with("http"))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
