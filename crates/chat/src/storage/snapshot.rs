//! Entity list snapshots with append-only history
//!
//! Directory structure:
//! ```text
//! <archive_root>/
//!   users.json                                        # current snapshot
//!   _users-archive/
//!     users-2024-03-01T10:00:00.000000Z.json          # superseded snapshots
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use log::info;
use serde_json::Value;

use super::atomic::write_atomic;
use super::json::{read_json, to_archive_bytes};
use crate::models::EntityKind;

pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The current snapshot, if one was ever saved
    pub fn load(&self, kind: EntityKind) -> Result<Option<Value>> {
        let path = kind.snapshot_path(&self.root);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Save `value` as the new snapshot unless it serializes identically
    ///
    /// The superseded snapshot is moved into the kind's history directory
    /// under a timestamped name. Returns whether anything was written.
    pub fn replace_if_changed(&self, kind: EntityKind, value: &Value) -> Result<bool> {
        let path = kind.snapshot_path(&self.root);
        let fresh = to_archive_bytes(value)?;

        if path.exists() {
            let current =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            if current == fresh {
                return Ok(false);
            }

            let history = kind.history_dir(&self.root);
            fs::create_dir_all(&history)
                .with_context(|| format!("Failed to create {}", history.display()))?;
            let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ");
            let retired = history.join(format!("{}-{}.json", kind.name(), stamp));
            fs::rename(&path, &retired).with_context(|| {
                format!("Failed to archive {} to {}", path.display(), retired.display())
            })?;
            info!("{}: list changed, previous snapshot kept at {}", kind, retired.display());
        }

        fs::create_dir_all(&self.root)?;
        write_atomic(&path, &fresh)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_first_snapshot_written() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        assert!(store.load(EntityKind::Users).unwrap().is_none());
        assert!(store.replace_if_changed(EntityKind::Users, &json!([{"id": "U1"}])).unwrap());
        assert_eq!(store.load(EntityKind::Users).unwrap(), Some(json!([{"id": "U1"}])));
        assert!(!EntityKind::Users.history_dir(dir.path()).exists());
    }

    #[test]
    fn test_unchanged_snapshot_is_noop() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let list = json!([{"id": "C1", "name": "general"}]);

        store.replace_if_changed(EntityKind::Conversations, &list).unwrap();
        assert!(!store.replace_if_changed(EntityKind::Conversations, &list).unwrap());
        assert!(!EntityKind::Conversations.history_dir(dir.path()).exists());
    }

    #[test]
    fn test_changed_snapshot_archives_previous() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.replace_if_changed(EntityKind::Emoji, &json!({"party": "https://e/1.gif"})).unwrap();
        assert!(store
            .replace_if_changed(EntityKind::Emoji, &json!({"party": "https://e/2.gif"}))
            .unwrap());

        let history: Vec<_> = fs::read_dir(EntityKind::Emoji.history_dir(dir.path()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(history.len(), 1);
        assert!(history[0].starts_with("emoji-"));

        let retired: Value = read_json(&EntityKind::Emoji.history_dir(dir.path()).join(&history[0])).unwrap();
        assert_eq!(retired, json!({"party": "https://e/1.gif"}));
        assert_eq!(
            store.load(EntityKind::Emoji).unwrap(),
            Some(json!({"party": "https://e/2.gif"}))
        );
    }
}
