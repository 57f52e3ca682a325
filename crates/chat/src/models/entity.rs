//! Entity kinds mirrored as list snapshots

use std::path::{Path, PathBuf};

/// A workspace-level list the archive mirrors
///
/// Each kind carries its endpoint, the response field holding the list and
/// its on-disk location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Conversations,
    Users,
    Emoji,
    Files,
}

impl EntityKind {
    /// Refresh order used by the archive
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Emoji,
        EntityKind::Files,
        EntityKind::Users,
        EntityKind::Conversations,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Conversations => "conversations",
            EntityKind::Users => "users",
            EntityKind::Emoji => "emoji",
            EntityKind::Files => "files",
        }
    }

    /// Web API method listing this kind
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityKind::Conversations => "conversations.list",
            EntityKind::Users => "users.list",
            EntityKind::Emoji => "emoji.list",
            EntityKind::Files => "files.list",
        }
    }

    /// Response field that holds the listed entities
    pub fn response_field(&self) -> &'static str {
        match self {
            EntityKind::Conversations => "channels",
            EntityKind::Users => "members",
            EntityKind::Emoji => "emoji",
            EntityKind::Files => "files",
        }
    }

    /// Whether the endpoint pages with `response_metadata.next_cursor`
    pub fn is_cursor_paginated(&self) -> bool {
        matches!(self, EntityKind::Conversations | EntityKind::Users)
    }

    /// `<root>/<name>.json`
    pub fn snapshot_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}.json", self.name()))
    }

    /// `<root>/_<name>-archive/`
    pub fn history_dir(&self, root: &Path) -> PathBuf {
        root.join(format!("_{}-archive", self.name()))
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
