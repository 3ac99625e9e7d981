//! Known-password registry.
//!
//! Passwords come from two places: the user's persisted store (one file
//! under the config dir) and a drop-local `passwords.txt` sitting next to
//! the input. Both are line-oriented UTF-8, one password per line, blank
//! lines ignored, deduplicated on load preserving first-seen order.
//!
//! Passwords discovered interactively during a run are appended to the
//! in-memory list immediately (so later archives in the same run benefit)
//! and written back once at the end. Persistence appends only the new
//! entries instead of rewriting the whole file, so a crash mid-run cannot
//! lose the existing store.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Default store location: `<config dir>/burrow/passwords.txt`.
pub fn default_store_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("burrow").join("passwords.txt"))
}

/// Deduplicated, insertion-ordered set of known passwords.
pub struct PasswordRegistry {
    passwords: Vec<String>,
    seen: HashSet<String>,
    /// Entries not yet in the persisted store, in discovery order
    unsaved: Vec<String>,
    store_path: Option<PathBuf>,
    dirty: bool,
}

impl PasswordRegistry {
    /// Empty registry with no backing store.
    pub fn new() -> Self {
        Self {
            passwords: Vec::new(),
            seen: HashSet::new(),
            unsaved: Vec::new(),
            store_path: None,
            dirty: false,
        }
    }

    /// Load the persisted store. A missing file is an empty registry, not
    /// an error; the path is remembered for [`persist`](Self::persist).
    pub fn load(store_path: PathBuf) -> Result<Self> {
        let mut registry = Self::new();
        if store_path.exists() {
            let count = registry.merge_file(&store_path)?;
            debug!("Loaded {} passwords from {}", count, store_path.display());
        }
        registry.store_path = Some(store_path);
        registry.dirty = false;
        registry.unsaved.clear();
        Ok(registry)
    }

    /// Merge a drop-local password file (e.g. `passwords.txt` beside the
    /// input) into the registry. Entries from here are treated as already
    /// persisted: they belong to the drop, not to the user store.
    pub fn merge_local(&mut self, path: &Path) -> Result<usize> {
        let added = self.merge_file(path)?;
        // Local merges are not discoveries.
        for _ in 0..added {
            self.unsaved.pop();
        }
        self.dirty = !self.unsaved.is_empty();
        if added > 0 {
            info!("Merged {} passwords from {}", added, path.display());
        }
        Ok(added)
    }

    fn merge_file(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open password store {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut added = 0;
        for line in reader.lines() {
            let line = line
                .with_context(|| format!("Failed to read password store {}", path.display()))?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            if self.add(line) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Add a password. Returns `true` when it was new; a new entry marks
    /// the registry dirty.
    pub fn add(&mut self, password: &str) -> bool {
        if password.is_empty() || !self.seen.insert(password.to_string()) {
            return false;
        }
        self.passwords.push(password.to_string());
        self.unsaved.push(password.to_string());
        self.dirty = true;
        true
    }

    /// Remove a password from the in-memory set. The persisted store is
    /// append-only; removal takes effect for this run only.
    pub fn remove(&mut self, password: &str) -> bool {
        if !self.seen.remove(password) {
            return false;
        }
        self.passwords.retain(|p| p != password);
        self.unsaved.retain(|p| p != password);
        self.dirty = true;
        true
    }

    pub fn contains(&self, password: &str) -> bool {
        self.seen.contains(password)
    }

    /// All known passwords in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.passwords.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Append newly discovered passwords to the persisted store. A no-op
    /// unless dirty (or `force`), and a no-op without a store path.
    /// Returns how many entries were written.
    pub fn persist(&mut self, force: bool) -> Result<usize> {
        if (!self.dirty && !force) || self.unsaved.is_empty() {
            return Ok(0);
        }
        let Some(path) = self.store_path.clone() else {
            return Ok(0);
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open password store {}", path.display()))?;

        let count = self.unsaved.len();
        for password in &self.unsaved {
            writeln!(file, "{}", password)
                .with_context(|| format!("Failed to write password store {}", path.display()))?;
        }

        info!("Saved {} new passwords to {}", count, path.display());
        self.unsaved.clear();
        self.dirty = false;
        Ok(count)
    }
}

impl Default for PasswordRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn load_dedups_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("passwords.txt");
        fs::write(&store, "alpha\n\nbeta\nalpha\ngamma\n").unwrap();

        let registry = PasswordRegistry::load(store).unwrap();
        let all: Vec<&str> = registry.iter().collect();
        assert_eq!(all, vec!["alpha", "beta", "gamma"]);
        assert!(!registry.is_dirty());
    }

    #[test]
    fn add_marks_dirty_and_dedups() {
        let mut registry = PasswordRegistry::new();
        assert!(registry.add("secret"));
        assert!(!registry.add("secret"));
        assert!(!registry.add(""));
        assert!(registry.is_dirty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn persist_appends_only_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("passwords.txt");
        fs::write(&store, "existing\n").unwrap();

        let mut registry = PasswordRegistry::load(store.clone()).unwrap();
        registry.add("fresh");
        let written = registry.persist(false).unwrap();
        assert_eq!(written, 1);

        let content = fs::read_to_string(&store).unwrap();
        assert_eq!(content, "existing\nfresh\n");

        // Second persist with nothing new is a no-op.
        assert_eq!(registry.persist(false).unwrap(), 0);
    }

    #[test]
    fn persist_is_noop_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("passwords.txt");
        fs::write(&store, "one\ntwo\n").unwrap();

        let mut registry = PasswordRegistry::load(store.clone()).unwrap();
        assert_eq!(registry.persist(false).unwrap(), 0);
        assert_eq!(fs::read_to_string(&store).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn merge_local_does_not_queue_for_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store.txt");
        let local = dir.path().join("passwords.txt");
        fs::write(&local, "droplocal\n").unwrap();

        let mut registry = PasswordRegistry::load(store.clone()).unwrap();
        assert_eq!(registry.merge_local(&local).unwrap(), 1);
        assert!(registry.contains("droplocal"));

        registry.persist(true).unwrap();
        assert!(!store.exists() || fs::read_to_string(&store).unwrap().is_empty());
    }

    #[test]
    fn remove_affects_memory_only() {
        let mut registry = PasswordRegistry::new();
        registry.add("keep");
        registry.add("drop");
        assert!(registry.remove("drop"));
        assert!(!registry.remove("drop"));
        let all: Vec<&str> = registry.iter().collect();
        assert_eq!(all, vec!["keep"]);
    }

    #[test]
    fn persist_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("nested").join("dir").join("passwords.txt");

        let mut registry = PasswordRegistry::load(store.clone()).unwrap();
        registry.add("made-up");
        registry.persist(false).unwrap();
        assert_eq!(fs::read_to_string(&store).unwrap(), "made-up\n");
    }
}
