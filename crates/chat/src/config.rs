//! Archive configuration
//!
//! Archives are listed in `archives.json` in the Lyra config directory
//! (or a file given on the command line):
//!
//! ```json
//! { "archives": [ { "dir": "~/slack-export", "token": "xoxp-...",
//!                   "delete_old_files": "60 days" } ] }
//! ```
//!
//! `dir` is resolved relative to the config file. A token missing from the
//! file falls back to the `SLACK_TOKEN` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::TimeDelta;
use serde::Deserialize;

use crate::actions::parse_age;

/// Archives filename in the Lyra config directory
pub const ARCHIVES_FILE: &str = "archives.json";

/// Environment variable holding a fallback token
pub const TOKEN_ENV: &str = "SLACK_TOKEN";

#[derive(Deserialize)]
struct ArchivesFile {
    archives: Vec<ArchiveEntry>,
}

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
struct ArchiveEntry {
    dir: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    delete_old_files: Option<String>,
    #[serde(default = "yes")]
    download_files: bool,
    #[serde(default = "yes")]
    download_public_data: bool,
    #[serde(default)]
    trunk_lookback_days: Option<u64>,
}

/// Settings for one archive
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveConfig {
    /// Label used in log lines
    pub name: String,
    pub dir: PathBuf,
    pub token: String,
    /// Delete workspace files older than this (after archiving them)
    pub delete_old_files: Option<TimeDelta>,
    pub download_files: bool,
    /// Archive public channels and the files listing
    pub download_public_data: bool,
    /// Re-walk only this much of a conversation's recent trunk
    pub trunk_lookback: Option<Duration>,
}

impl ArchiveConfig {
    pub fn new(dir: impl Into<PathBuf>, token: impl Into<String>) -> Self {
        let dir = dir.into();
        Self {
            name: dir.display().to_string(),
            dir,
            token: token.into(),
            delete_old_files: None,
            download_files: true,
            download_public_data: true,
            trunk_lookback: None,
        }
    }

    /// `archives.json` in the Lyra config directory, if present
    pub fn default_file() -> Option<PathBuf> {
        if !config::config_exists(ARCHIVES_FILE) {
            return None;
        }
        config::config_path(ARCHIVES_FILE)
    }

    /// Load every archive listed in `path`
    pub fn load_file(path: &Path, env_token: Option<&str>) -> Result<Vec<ArchiveConfig>> {
        let file: ArchivesFile = config::load_json_file(path)?;
        file.archives
            .into_iter()
            .map(|entry| Self::from_entry(path, entry, env_token))
            .collect()
    }

    fn from_entry(config_file: &Path, entry: ArchiveEntry, env_token: Option<&str>) -> Result<Self> {
        let dir = config::resolve_path(config_file, &entry.dir);
        let name = entry.name.unwrap_or_else(|| entry.dir.clone());

        let Some(token) = entry.token.or_else(|| env_token.map(str::to_string)) else {
            bail!(
                "No token for archive {} (set \"token\" in {} or {})",
                name,
                config_file.display(),
                TOKEN_ENV
            );
        };

        let delete_old_files = match entry.delete_old_files.as_deref() {
            None => None,
            Some(age) => Some(
                parse_age(age)
                    .with_context(|| format!("Invalid age for delete_old_files: {:?}", age))?,
            ),
        };

        Ok(Self {
            name,
            dir,
            token,
            delete_old_files,
            download_files: entry.download_files,
            download_public_data: entry.download_public_data,
            trunk_lookback: entry
                .trunk_lookback_days
                .map(|days| Duration::from_secs(days * 24 * 60 * 60)),
        })
    }

    /// Resolve a command-line archive argument, `[token:]dir`
    ///
    /// A directory matching a configured archive selects that archive.
    pub fn from_arg(arg: &str, configured: &[ArchiveConfig], env_token: Option<&str>) -> Result<Self> {
        let (token, path) = match arg.rsplit_once(':') {
            Some((token, path)) => (Some(token).filter(|t| !t.is_empty()), path),
            None => (None, arg),
        };
        let dir = config::expand_home(path);

        let wanted = dir.to_string_lossy();
        let wanted = wanted.trim_end_matches('/');
        if let Some(found) = configured
            .iter()
            .find(|c| c.dir.to_string_lossy().trim_end_matches('/') == wanted)
        {
            return Ok(found.clone());
        }

        let Some(token) = token.or(env_token) else {
            bail!("No token for archive {} (pass it as TOKEN:{} or set {})", path, path, TOKEN_ENV);
        };
        Ok(Self::new(dir, token))
    }
}
