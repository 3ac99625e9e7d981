//! Sanitized-path fallback extraction.
//!
//! When a direct extraction fails with a path-classified error (name too
//! long, characters the filesystem refuses), the archive is extracted into
//! a throwaway staging directory instead, and the staged tree is copied
//! into the real destination with every path component sanitized:
//! illegal characters replaced, over-length names truncated, collisions
//! de-duplicated with a numeric suffix. File and directory collisions map
//! deterministically because the staged tree is walked in sorted order.
//!
//! This is strictly a fallback - it runs only after the fast path already
//! failed with a path error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::backend::{ArchiveBackend, BackendOutcome};

/// Byte budget per sanitized path component.
const MAX_COMPONENT_BYTES: usize = 200;

/// Extract via a staging directory, sanitizing every path on the way to
/// `output_dir`. Returns the backend outcome of the staged extraction;
/// the copy only happens on success.
pub fn extract_sanitized(
    backend: &dyn ArchiveBackend,
    archive: &Path,
    output_dir: &Path,
    password: Option<&str>,
    overwrite: bool,
) -> Result<BackendOutcome> {
    let staging = tempfile::tempdir().context("Failed to create staging directory")?;
    debug!(
        "Path fallback: staging {} in {}",
        archive.display(),
        staging.path().display()
    );

    let outcome = backend.extract(archive, staging.path(), password, overwrite, None)?;
    if outcome != BackendOutcome::Success {
        return Ok(outcome);
    }

    copy_sanitized(staging.path(), output_dir)?;
    info!(
        "Recovered {} via sanitized-path fallback",
        archive.display()
    );
    Ok(BackendOutcome::Success)
}

/// Copy a tree, sanitizing every path component. Children of a renamed
/// directory follow it.
pub fn copy_sanitized(src_root: &Path, dest_root: &Path) -> Result<()> {
    fs::create_dir_all(dest_root)
        .with_context(|| format!("Failed to create {}", dest_root.display()))?;

    // original relative dir -> mapped relative dir
    let mut dir_map: HashMap<PathBuf, PathBuf> = HashMap::new();
    dir_map.insert(PathBuf::new(), PathBuf::new());

    for entry in WalkDir::new(src_root).sort_by_file_name() {
        let entry = entry.context("Failed to walk staging directory")?;
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .context("Staged path outside staging root")?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let parent_rel = rel.parent().unwrap_or_else(|| Path::new(""));
        let mapped_parent = dir_map
            .get(parent_rel)
            .cloned()
            .unwrap_or_else(|| parent_rel.to_path_buf());

        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let clean = sanitize_component(&name);
        let target_parent = dest_root.join(&mapped_parent);
        let unique = unique_in(&target_parent, &clean);
        let mapped_rel = mapped_parent.join(&unique);
        let target = dest_root.join(&mapped_rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            dir_map.insert(rel.to_path_buf(), mapped_rel);
        } else {
            fs::create_dir_all(&target_parent)
                .with_context(|| format!("Failed to create {}", target_parent.display()))?;
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy into {}", target.display()))?;
        }
    }
    Ok(())
}

/// Map one path component to a filesystem-safe name within the byte
/// budget. Never returns an empty string.
pub fn sanitize_component(name: &str) -> String {
    let mut clean = sanitize_filename::sanitize(name);
    if clean.is_empty() {
        clean = "_".to_string();
    }
    truncate_bytes(&clean, MAX_COMPONENT_BYTES)
}

fn truncate_bytes(s: &str, budget: usize) -> String {
    if s.len() <= budget {
        return s.to_string();
    }
    // Keep the extension visible when one fits.
    let (stem, ext) = match s.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() + 1 < budget => (stem, Some(ext)),
        _ => (s, None),
    };
    let stem_budget = budget - ext.map(|e| e.len() + 1).unwrap_or(0);
    let mut cut = stem_budget.min(stem.len());
    while cut > 0 && !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    match ext {
        Some(ext) => format!("{}.{}", &stem[..cut], ext),
        None => stem[..cut].to_string(),
    }
}

/// First free name in `dir` for `name`, numbering collisions `name-1`,
/// `name-2`, ... before the extension.
fn unique_in(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 1.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    unreachable!()
}
