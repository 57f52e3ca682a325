//! Archive layout migrations
//!
//! Each migration moves an older layout into the current one and reports
//! whether it changed anything. The last applied version is kept in
//! `<root>/.layout-version`; migrations are idempotent, so an interrupted
//! upgrade is simply run again.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::download::{Job, PendingQueue, storage_dir};
use crate::storage::{read_json, write_atomic};

pub const LAYOUT_VERSION_FILE: &str = ".layout-version";

/// One layout change
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&Path) -> Result<bool>,
}

/// Every migration, in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "move_loose_downloads",
        apply: move_loose_downloads,
    },
    Migration {
        version: 2,
        name: "hoist_conversation_dirs",
        apply: hoist_conversation_dirs,
    },
    Migration {
        version: 3,
        name: "relocate_pending_queue",
        apply: relocate_pending_queue,
    },
];

/// Layout version written by the newest migration
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Layout version of the archive at `root` (0 when never recorded)
pub fn layout_version(root: &Path) -> Result<u32> {
    let path = root.join(LAYOUT_VERSION_FILE);
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Invalid layout version in {}", path.display()))
}

pub fn set_layout_version(root: &Path, version: u32) -> Result<()> {
    write_atomic(&root.join(LAYOUT_VERSION_FILE), format!("{}\n", version).as_bytes())
}

/// Migrations not yet applied to the archive at `root`
pub fn pending(root: &Path) -> Result<Vec<&'static Migration>> {
    let current = layout_version(root)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).collect())
}

/// Apply pending migrations, recording the version after each
///
/// Returns whether any migration changed the archive.
pub fn upgrade(root: &Path) -> Result<bool> {
    let mut changed = false;
    for migration in pending(root)? {
        let did = (migration.apply)(root)
            .with_context(|| format!("Migration {} failed", migration.name))?;
        if did {
            info!("Applied migration {} ({})", migration.version, migration.name);
        }
        changed |= did;
        set_layout_version(root, migration.version)?;
    }
    Ok(changed)
}

fn entries(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        paths.push(entry?.path());
    }
    paths.sort();
    Ok(paths)
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    info!("moving {} -> {}", from.display(), to.display());
    fs::rename(from, to)
        .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))
}

/// Downloads once lived directly in `_files/`
fn move_loose_downloads(root: &Path) -> Result<bool> {
    let files_dir = root.join("_files");
    let loose: Vec<PathBuf> = entries(&files_dir)?
        .into_iter()
        .filter(|p| p.is_file())
        .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().contains("http")))
        .collect();
    if loose.is_empty() {
        return Ok(false);
    }

    let storage = storage_dir(root);
    fs::create_dir_all(&storage)
        .with_context(|| format!("Failed to create {}", storage.display()))?;
    for path in &loose {
        if let Some(name) = path.file_name() {
            rename(path, &storage.join(name))?;
        }
    }
    Ok(true)
}

/// Conversations once lived under per-type directories
fn hoist_conversation_dirs(root: &Path) -> Result<bool> {
    const LEGACY_PARENTS: [&str; 4] = [
        "_channels",
        "_private/default/_groups",
        "_private/default/_mpims",
        "_private/default/_ims",
    ];

    let mut moves = Vec::new();
    for parent in LEGACY_PARENTS {
        for path in entries(&root.join(parent))? {
            if path.is_dir() {
                if let Some(name) = path.file_name() {
                    moves.push((path.clone(), root.join(name)));
                }
            }
        }
    }
    // Oldest layout: `<root>/_channel-<id>`
    for path in entries(root)? {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(id) = name.as_deref().and_then(|n| n.strip_prefix("_channel-")) {
            if path.is_dir() {
                moves.push((path.clone(), root.join(id)));
            }
        }
    }

    let mut changed = false;
    for (from, to) in moves {
        if to.exists() {
            warn!("Not moving {}: {} already exists", from.display(), to.display());
            continue;
        }
        rename(&from, &to)?;
        changed = true;
    }
    Ok(changed)
}

/// The pending queue once lived next to the downloads
fn relocate_pending_queue(root: &Path) -> Result<bool> {
    let legacy = storage_dir(root).join(PendingQueue::FILE_NAME);
    if !legacy.exists() {
        return Ok(false);
    }

    let queue = PendingQueue::new(root);
    let mut jobs = queue.load()?;
    let legacy_jobs: Vec<Job> = read_json(&legacy)?;
    jobs.extend(legacy_jobs);
    queue.store(&jobs)?;
    fs::remove_file(&legacy).with_context(|| format!("Failed to remove {}", legacy.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_versions_ascend() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(latest_version(), 3);
    }

    #[test]
    fn test_fresh_archive_upgrades_without_changes() {
        let dir = TempDir::new().unwrap();
        assert_eq!(pending(dir.path()).unwrap().len(), 3);
        assert!(!upgrade(dir.path()).unwrap());
        assert_eq!(layout_version(dir.path()).unwrap(), 3);
        assert!(pending(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_move_loose_downloads() {
        let dir = TempDir::new().unwrap();
        let files = dir.path().join("_files");
        fs::create_dir_all(files.join("2020-01-01")).unwrap();
        fs::write(files.join("https%3A%2F%2Fexample.com%2Fa"), b"a").unwrap();
        fs::write(files.join("status.json"), b"{}").unwrap();

        assert!(move_loose_downloads(dir.path()).unwrap());
        assert!(storage_dir(dir.path()).join("https%3A%2F%2Fexample.com%2Fa").exists());
        assert!(files.join("status.json").exists());
        assert!(!move_loose_downloads(dir.path()).unwrap());
    }

    #[test]
    fn test_hoist_conversation_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("_channels/C1")).unwrap();
        fs::write(root.join("_channels/C1/2020-01-01.json"), b"[]").unwrap();
        fs::write(root.join("_channels/channels.json"), b"[]").unwrap();
        fs::create_dir_all(root.join("_private/default/_ims/D1")).unwrap();
        fs::create_dir_all(root.join("_channel-C2")).unwrap();
        fs::create_dir_all(root.join("_private/default/_groups/G1")).unwrap();
        fs::create_dir_all(root.join("G1")).unwrap();

        assert!(hoist_conversation_dirs(root).unwrap());
        assert!(root.join("C1/2020-01-01.json").exists());
        assert!(root.join("D1").is_dir());
        assert!(root.join("C2").is_dir());
        // Existing targets are left alone
        assert!(root.join("_private/default/_groups/G1").is_dir());
        assert!(root.join("_channels/channels.json").exists());
    }

    #[test]
    fn test_relocate_pending_queue() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let storage = storage_dir(root);
        fs::create_dir_all(&storage).unwrap();
        fs::write(
            storage.join("pending.json"),
            br#"[["https://example.com/a", "/nonexistent/a"]]"#,
        )
        .unwrap();

        assert!(upgrade(root).unwrap());
        assert!(!storage.join("pending.json").exists());
        let jobs = PendingQueue::new(root).load().unwrap();
        assert_eq!(jobs, vec![Job::new("https://example.com/a", "/nonexistent/a")]);
    }
}
