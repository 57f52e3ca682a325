//! JSON encoding shared by every archive file
//!
//! Four-space indentation and sorted keys keep the files diff-friendly.
//! Keys come out sorted because `serde_json::Map` is a `BTreeMap`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::ser::{PrettyFormatter, Serializer};

use super::atomic::write_atomic;

/// Serialize `value` with the archive's pretty format
pub fn to_archive_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut ser).context("Failed to serialize JSON")?;
    Ok(out)
}

/// Atomically write `value` to `path` in the archive's pretty format
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = to_archive_bytes(value)?;
    write_atomic(path, &bytes)
}

/// Read and parse a JSON file
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
