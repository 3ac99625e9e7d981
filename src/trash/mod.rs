//! Reversible removal of consumed archives.
//!
//! Instead of deleting an archive after it extracted successfully, it is
//! moved into an app-level trash directory: `{trash_root}/{uuid}/` holding
//! the file plus a `metadata.json` with the original path, name, deletion
//! timestamp and size. Nothing in the CLI restores entries automatically,
//! but the metadata makes restoring by hand trivial, and an app-level
//! trash behaves identically on headless machines where no desktop
//! recycle bin exists.
//!
//! `fs::rename` is tried first; across filesystems it falls back to
//! copy-then-delete.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Default trash location: `<data dir>/burrow/trash`.
pub fn default_trash_root() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("burrow").join("trash"))
}

/// Restore information stored beside each trashed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashMetadata {
    /// Unique id, doubles as the entry directory name
    pub id: String,
    /// Absolute path the file was removed from
    pub original_path: String,
    pub original_name: String,
    /// ISO 8601 deletion timestamp
    pub deleted_at: String,
    pub size_bytes: u64,
}

/// Move one file into the trash. Returns the entry metadata.
pub fn move_to_trash(source: &Path, trash_root: &Path) -> Result<TrashMetadata> {
    if !source.exists() {
        bail!("Source does not exist: {}", source.display());
    }
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Invalid file name: {}", source.display()))?;

    let id = Uuid::new_v4().to_string();
    let entry_dir = trash_root.join(&id);
    fs::create_dir_all(&entry_dir)
        .with_context(|| format!("Failed to create trash entry {}", entry_dir.display()))?;

    let size_bytes = fs::metadata(source).map(|m| m.len()).unwrap_or(0);
    let metadata = TrashMetadata {
        id: id.clone(),
        original_path: source.to_string_lossy().into_owned(),
        original_name: name.clone(),
        deleted_at: Utc::now().to_rfc3339(),
        size_bytes,
    };

    // Metadata goes in first so a crash mid-move still leaves a
    // self-describing entry.
    let json = serde_json::to_string_pretty(&metadata)
        .context("Failed to serialize trash metadata")?;
    fs::write(entry_dir.join("metadata.json"), json)
        .with_context(|| format!("Failed to write metadata in {}", entry_dir.display()))?;

    let dest = entry_dir.join(&name);
    if let Err(rename_err) = fs::rename(source, &dest) {
        // Cross-device move: copy, then delete the original.
        warn!(
            "rename into trash failed ({rename_err}), copying {} instead",
            source.display()
        );
        fs::copy(source, &dest)
            .with_context(|| format!("Failed to copy {} into trash", source.display()))?;
        fs::remove_file(source)
            .with_context(|| format!("Failed to remove {} after copy", source.display()))?;
    }

    info!("Trashed {} (id {})", name, id);
    Ok(metadata)
}

/// List every entry in the trash, newest first. Entries with unreadable
/// metadata are skipped.
pub fn list_trash(trash_root: &Path) -> Result<Vec<TrashMetadata>> {
    if !trash_root.exists() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    for entry in fs::read_dir(trash_root)
        .with_context(|| format!("Failed to read trash dir {}", trash_root.display()))?
        .flatten()
    {
        let meta_path = entry.path().join("metadata.json");
        if !meta_path.exists() {
            continue;
        }
        match fs::read_to_string(&meta_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<TrashMetadata>(&raw).ok())
        {
            Some(meta) => items.push(meta),
            None => warn!("Skipping unreadable trash entry {}", meta_path.display()),
        }
    }

    items.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
    Ok(items)
}

/// Move a trashed file back to where it came from. Refuses when the
/// original path is occupied again.
pub fn restore_from_trash(id: &str, trash_root: &Path) -> Result<PathBuf> {
    let entry_dir = trash_root.join(id);
    let meta_path = entry_dir.join("metadata.json");
    let raw = fs::read_to_string(&meta_path)
        .with_context(|| format!("Trash entry not found: {id}"))?;
    let metadata: TrashMetadata =
        serde_json::from_str(&raw).with_context(|| format!("Invalid trash metadata for {id}"))?;

    let original = PathBuf::from(&metadata.original_path);
    if original.exists() {
        bail!("Original path already exists: {}", original.display());
    }

    let content = entry_dir.join(&metadata.original_name);
    if !content.exists() {
        bail!("Trash content missing for {id}");
    }

    if let Some(parent) = original.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to recreate {}", parent.display()))?;
    }
    fs::rename(&content, &original)
        .with_context(|| format!("Failed to restore {}", original.display()))?;
    fs::remove_dir_all(&entry_dir)
        .with_context(|| format!("Failed to clean up trash entry {id}"))?;

    info!("Restored {} from trash", metadata.original_name);
    Ok(original)
}
