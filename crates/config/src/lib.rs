//! Lyra configuration directory
//!
//! Archives are described in JSON files kept under the per-user config
//! directory (`~/.config/lyra/` on Linux). Paths inside those files may
//! use `~` and may be relative to the file itself.
//!
//! [`init`] creates the directory; the CLI calls it on startup.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Create the config directory if needed and return it
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lyra"))
}

/// `<config_dir>/<filename>`
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Read and deserialize a JSON file
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.is_file())
}

pub fn ensure_config_dir() -> Result<PathBuf> {
    let Some(dir) = config_dir() else {
        anyhow::bail!("No config directory on this platform");
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}

/// Resolve a path found inside a config file.
///
/// `~` is expanded first; a path that is still relative is taken relative
/// to the directory containing the config file.
pub fn resolve_path(config_file: &Path, path: &str) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        return expanded;
    }
    match config_file.parent() {
        Some(parent) => parent.join(expanded),
        None => expanded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let path = config_path("archives.json").unwrap();
        assert!(path.ends_with("lyra/archives.json"));
        assert_eq!(path.parent(), config_dir().as_deref());
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"archives": []}"#).unwrap();
        let value: serde_json::Value = load_json_file(&good).unwrap();
        assert_eq!(value["archives"], serde_json::json!([]));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{").unwrap();
        let err = load_json_file::<serde_json::Value>(&bad).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
        assert!(load_json_file::<serde_json::Value>(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home("~/export"), home.join("export"));
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("~other/x"), PathBuf::from("~other/x"));
    }

    #[test]
    fn test_resolve_path() {
        let cfg = Path::new("/etc/lyra/archives.json");
        assert_eq!(resolve_path(cfg, "export"), PathBuf::from("/etc/lyra/export"));
        assert_eq!(resolve_path(cfg, "/data/export"), PathBuf::from("/data/export"));
    }
}
