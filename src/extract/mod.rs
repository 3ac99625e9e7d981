//! Recursive extraction orchestrator.
//!
//! Takes a root archive (or a whole drop directory), drives the password
//! trial engine per archive, inspects each extraction's output for newly
//! revealed nested archives, and feeds those back into the same loop up to
//! a depth bound. Consumed archives can be moved to the trash - but only
//! ever after their own successful extraction. A branch that fails leaves
//! every input byte where it was.
//!
//! The walk is an explicit work queue of `(archive, output dir, depth)`
//! items processed depth-first, with a set of canonicalized paths guarding
//! against reprocessing when several branches surface the same file.
//! Failures are branch-local: an error in one branch is recorded and the
//! remaining branches continue.

pub mod config;
pub mod sanitize;
pub mod trial;

pub use config::{ConfigError, ExtractConfig};
pub use trial::{NoPrompt, PromptPort, PromptReply, StdinPrompt, TrialOutcome};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backend::ArchiveBackend;
use crate::classify::{self, cloak};
use crate::grouping;
use crate::multipart::{self, MultiPartArchive};
use crate::passwords::PasswordRegistry;
use crate::trash;

use trial::TrialEngine;

/// Progress events for whoever is watching (the CLI wires these to a
/// progress bar). Extraction logic itself never touches presentation.
#[derive(Debug, Clone)]
pub enum ExtractEvent {
    ArchiveStarted {
        archive: PathBuf,
        depth: usize,
    },
    AttemptingPassword {
        archive: PathBuf,
        attempt: usize,
        total: usize,
    },
    Extracted {
        archive: PathBuf,
        password: Option<String>,
    },
    ExtractionFailed {
        archive: PathBuf,
        reason: String,
    },
    NestedFound {
        parent: PathBuf,
        count: usize,
    },
    Uncloaked {
        from: PathBuf,
        to: PathBuf,
    },
    /// An interactive prompt is about to block on stdin; progress
    /// displays must pause before it shows.
    PromptPending {
        archive: PathBuf,
    },
    PromptFinished,
    CleanedUp {
        archive: PathBuf,
    },
}

pub type EventCallback = Arc<dyn Fn(ExtractEvent) + Send + Sync>;

pub(crate) fn emit(callback: Option<&EventCallback>, event: ExtractEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

/// Aggregate report of one extraction run. Built incrementally across the
/// whole recursive walk; immutable once returned.
#[derive(Debug, Default, Clone)]
pub struct ExtractionResult {
    /// No fatal errors, and something useful was produced
    pub success: bool,
    /// Every archive that extracted successfully, in processing order
    pub extracted_archives: Vec<PathBuf>,
    /// Non-archive files revealed by the run
    pub final_files: Vec<PathBuf>,
    /// Fatal, branch-aborting problems
    pub errors: Vec<String>,
    /// Expected non-fatal outcomes (exhausted passwords, user skips)
    pub notes: Vec<String>,
    /// Which password opened which archive
    pub password_used: HashMap<PathBuf, String>,
    /// Passwords the user typed that worked, in discovery order
    pub user_provided_passwords: Vec<String>,
}

struct WorkItem {
    archive: PathBuf,
    output_dir: PathBuf,
    depth: usize,
}

/// The orchestrator. One instance drives one run.
pub struct Extractor<'a> {
    backend: &'a dyn ArchiveBackend,
    config: ExtractConfig,
    passwords: &'a mut PasswordRegistry,
    prompt: Box<dyn PromptPort + 'a>,
    callback: Option<EventCallback>,
}

impl<'a> Extractor<'a> {
    pub fn new(
        backend: &'a dyn ArchiveBackend,
        config: ExtractConfig,
        passwords: &'a mut PasswordRegistry,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            passwords,
            prompt: Box::new(NoPrompt),
            callback: None,
        })
    }

    /// Wire an interactive prompt port. Without one, encrypted archives
    /// whose password is unknown are skipped.
    pub fn set_prompt(&mut self, prompt: Box<dyn PromptPort + 'a>) {
        self.prompt = prompt;
    }

    pub fn set_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    /// Extract one root archive into the configured output directory,
    /// recursing into whatever it reveals.
    pub fn run(&mut self, root_archive: &Path) -> Result<ExtractionResult> {
        if !root_archive.exists() {
            bail!("Archive not found: {}", root_archive.display());
        }
        if !self.backend.probe(root_archive) {
            bail!("Not a valid archive: {}", root_archive.display());
        }
        fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create {}", self.config.output_dir.display())
        })?;

        let mut result = ExtractionResult::default();
        let mut processed = HashSet::new();
        self.run_queue(
            vec![WorkItem {
                archive: root_archive.to_path_buf(),
                output_dir: self.config.output_dir.clone(),
                depth: 0,
            }],
            &mut result,
            &mut processed,
        );
        self.finish(&mut result);
        Ok(result)
    }

    /// Bulk mode: take a whole drop directory, repair cloaked names,
    /// group the files, and extract every group. One failed group is
    /// reported in the result, not escalated to a run failure.
    pub fn run_drop(&mut self, drop_dir: &Path) -> Result<ExtractionResult> {
        if !drop_dir.is_dir() {
            bail!("Drop directory not found: {}", drop_dir.display());
        }
        fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!("Failed to create {}", self.config.output_dir.display())
        })?;

        let mut result = ExtractionResult::default();
        let files = self.uncloak_pass(drop_dir, &mut result);

        let groups = grouping::group(&files, drop_dir);
        info!(
            "Drop {}: {} files in {} groups",
            drop_dir.display(),
            files.len(),
            groups.len()
        );

        let mut processed = HashSet::new();
        for (name, group) in &groups {
            let sets = multipart::analyze(group.files());
            let order = multipart::extraction_order(&sets, group.files());
            let out_dir = self
                .config
                .output_dir
                .join(sanitize::sanitize_component(name));

            for entry in order {
                // Drop folders are full of non-archives; only queue files
                // that classify or probe as archives.
                if classify::classify(&entry).is_none() && !self.backend.probe(&entry) {
                    continue;
                }

                // An incomplete set's head: before committing to it, try
                // sibling containers that might hold the missing parts
                // (they may sit in other groups), then pull whatever they
                // revealed next to the set.
                if let Some(set) = sets.iter().find(|s| s.first_part() == Some(&entry)) {
                    if !set.is_complete() || set.possibly_incomplete {
                        let dir_files = entry
                            .parent()
                            .map(|dir| list_files(dir, 1))
                            .unwrap_or_default();
                        for candidate in multipart::find_missing_parts(set, &dir_files) {
                            if classify::classify(&candidate).is_none()
                                && !self.backend.probe(&candidate)
                            {
                                continue;
                            }
                            self.run_queue(
                                vec![WorkItem {
                                    archive: candidate,
                                    output_dir: out_dir.clone(),
                                    depth: 0,
                                }],
                                &mut result,
                                &mut processed,
                            );
                        }
                        self.recover_missing_parts(set, &out_dir, &mut result);
                    }
                }

                self.run_queue(
                    vec![WorkItem {
                        archive: entry,
                        output_dir: out_dir.clone(),
                        depth: 0,
                    }],
                    &mut result,
                    &mut processed,
                );
            }
        }

        self.finish(&mut result);
        Ok(result)
    }

    /// Repair cloaked filenames in the drop before grouping. Returns the
    /// (possibly renamed) file listing.
    fn uncloak_pass(&self, drop_dir: &Path, result: &mut ExtractionResult) -> Vec<PathBuf> {
        let rules = cloak::RuleSet::load_or_default(self.config.cloak_rules.as_deref());

        let mut files = list_files(drop_dir, 2);
        for file in &mut files {
            match cloak::uncloak_rename(file, &rules) {
                Ok(Some(renamed)) => {
                    emit(
                        self.callback.as_ref(),
                        ExtractEvent::Uncloaked {
                            from: file.clone(),
                            to: renamed.clone(),
                        },
                    );
                    *file = renamed;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("Uncloak rename failed for {}: {err:#}", file.display());
                    result
                        .notes
                        .push(format!("Could not rename cloaked file {}", file.display()));
                }
            }
        }
        files
    }

    fn run_queue(
        &mut self,
        initial: Vec<WorkItem>,
        result: &mut ExtractionResult,
        processed: &mut HashSet<PathBuf>,
    ) {
        let mut stack = initial;
        stack.reverse();
        while let Some(item) = stack.pop() {
            match self.process_item(&item, result, processed) {
                Ok(children) => {
                    for child in children.into_iter().rev() {
                        stack.push(child);
                    }
                }
                // Branch-local: the error is recorded, siblings continue.
                Err(err) => result
                    .errors
                    .push(format!("{}: {err:#}", item.archive.display())),
            }
        }
    }

    /// One node of the walk. Returns the nested archives to queue.
    fn process_item(
        &mut self,
        item: &WorkItem,
        result: &mut ExtractionResult,
        processed: &mut HashSet<PathBuf>,
    ) -> Result<Vec<WorkItem>> {
        let archive = &item.archive;

        if item.depth > self.config.max_depth {
            result.errors.push(format!(
                "Max depth {} exceeded at {}",
                self.config.max_depth,
                archive.display()
            ));
            return Ok(Vec::new());
        }

        if !archive.exists() {
            if item.depth == 0 {
                result
                    .errors
                    .push(format!("Archive not found: {}", archive.display()));
            } else {
                // Consumed by an earlier step of the same walk.
                debug!("{} vanished before processing, skipping", archive.display());
            }
            return Ok(Vec::new());
        }

        let canonical = archive.canonicalize().unwrap_or_else(|_| archive.clone());
        if !processed.insert(canonical) {
            debug!("{} already processed, skipping", archive.display());
            return Ok(Vec::new());
        }

        if !self.backend.probe(archive) {
            if item.depth == 0 {
                result
                    .errors
                    .push(format!("Not a valid archive: {}", archive.display()));
            } else {
                // Signature scanning produces false positives; deeper in
                // the tree they are silently dropped.
                debug!("{} failed the archive probe, skipping", archive.display());
            }
            return Ok(Vec::new());
        }

        emit(
            self.callback.as_ref(),
            ExtractEvent::ArchiveStarted {
                archive: archive.clone(),
                depth: item.depth,
            },
        );

        let snapshot = snapshot_tree(&item.output_dir);
        let engine = TrialEngine::new(
            self.backend,
            self.config.overwrite,
            self.config.interactive,
            self.callback.as_ref(),
        );
        let outcome = engine.run(archive, &item.output_dir, self.passwords, self.prompt.as_mut())?;

        match outcome {
            TrialOutcome::Extracted {
                password,
                user_provided,
            } => {
                result.extracted_archives.push(archive.clone());
                if let Some(pw) = &password {
                    result.password_used.insert(archive.clone(), pw.clone());
                    if user_provided {
                        result.user_provided_passwords.push(pw.clone());
                    }
                }
                emit(
                    self.callback.as_ref(),
                    ExtractEvent::Extracted {
                        archive: archive.clone(),
                        password,
                    },
                );
            }
            TrialOutcome::ExhaustedPasswords => {
                // Expected outcome, not a system fault.
                result.notes.push(format!(
                    "Could not extract {}: no known password worked",
                    archive.display()
                ));
                emit(
                    self.callback.as_ref(),
                    ExtractEvent::ExtractionFailed {
                        archive: archive.clone(),
                        reason: "no known password worked".to_string(),
                    },
                );
                return Ok(Vec::new());
            }
            TrialOutcome::Skipped => {
                result
                    .notes
                    .push(format!("Skipped {} at the user's request", archive.display()));
                return Ok(Vec::new());
            }
            TrialOutcome::Failed(outcome) => {
                result.errors.push(format!(
                    "Failed to extract {}: {:?}",
                    archive.display(),
                    outcome
                ));
                emit(
                    self.callback.as_ref(),
                    ExtractEvent::ExtractionFailed {
                        archive: archive.clone(),
                        reason: format!("{outcome:?}"),
                    },
                );
                return Ok(Vec::new());
            }
        }

        let new_files = diff_tree(&item.output_dir, &snapshot);
        let sets = analyze_by_directory(&new_files);

        // Continuation parts are consumed through their set's first part;
        // extracting them in isolation would be wrong even when they look
        // archive-like on their own. Continuation-suffixed names are
        // skipped even without a detected set, unless the file heads one.
        let mut nested = Vec::new();
        for file in &new_files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let heads_a_set = sets.iter().any(|s| s.first_part() == Some(file));
            if !heads_a_set
                && (multipart::is_continuation_part(file, &sets)
                    || multipart::is_continuation_name(&name))
            {
                continue;
            }
            if classify::classify(file).is_some() {
                nested.push(file.clone());
            } else {
                result.final_files.push(file.clone());
            }
        }

        // The consumed archive goes to the trash only after its own
        // successful extraction, and never when it was the original input.
        if self.config.cleanup && item.depth > 0 {
            self.cleanup_archive(archive, result);
        }

        if !nested.is_empty() {
            emit(
                self.callback.as_ref(),
                ExtractEvent::NestedFound {
                    parent: archive.clone(),
                    count: nested.len(),
                },
            );
        }

        Ok(nested
            .into_iter()
            .map(|archive| {
                let output_dir = nested_output_dir(&archive);
                WorkItem {
                    archive,
                    output_dir,
                    depth: item.depth + 1,
                }
            })
            .collect())
    }

    /// Move a consumed archive (and the continuation parts of its set)
    /// to the trash.
    fn cleanup_archive(&self, archive: &Path, result: &mut ExtractionResult) {
        let Some(trash_root) = self
            .config
            .trash_root
            .clone()
            .or_else(trash::default_trash_root)
        else {
            warn!(
                "No trash location available, leaving {} in place",
                archive.display()
            );
            return;
        };

        let mut victims = vec![archive.to_path_buf()];
        if let Some(dir) = archive.parent() {
            let siblings = list_files(dir, 1);
            for set in multipart::analyze(&siblings) {
                if set.found_parts.values().any(|p| p == archive) {
                    victims.extend(set.found_parts.values().filter(|p| *p != archive).cloned());
                }
            }
        }

        for victim in victims {
            match trash::move_to_trash(&victim, &trash_root) {
                Ok(_) => emit(
                    self.callback.as_ref(),
                    ExtractEvent::CleanedUp {
                        archive: victim.clone(),
                    },
                ),
                Err(err) => {
                    warn!("Failed to trash {}: {err:#}", victim.display());
                    result
                        .notes
                        .push(format!("Could not clean up {}", victim.display()));
                }
            }
        }
    }

    /// After candidate containers were extracted, look for an incomplete
    /// set's missing parts in the output tree and move them next to the
    /// set's first part, so the backend can find the whole family.
    fn recover_missing_parts(
        &self,
        set: &MultiPartArchive,
        search_root: &Path,
        result: &mut ExtractionResult,
    ) {
        let missing = set.missing_parts();
        if missing.is_empty() {
            return;
        }
        let Some(dest_dir) = set.first_part().and_then(|p| p.parent()) else {
            return;
        };

        for candidate in list_files(search_root, usize::MAX) {
            let Some(name) = candidate
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            let Some((base, num)) = multipart::part_info(&name) else {
                continue;
            };
            if !base.eq_ignore_ascii_case(&set.base_name) || !missing.contains(&num) {
                continue;
            }

            let dest = dest_dir.join(&name);
            if dest.exists() {
                continue;
            }
            match fs::rename(&candidate, &dest) {
                Ok(()) => {
                    info!("Recovered missing part {} -> {}", name, dest.display());
                    result
                        .notes
                        .push(format!("Recovered missing part {name} from a container"));
                    // The part is input now, not output.
                    result.final_files.retain(|f| f != &candidate);
                }
                Err(err) => warn!("Could not move recovered part {name}: {err}"),
            }
        }
    }

    /// Post-walk sweep: drop empty directories and settle the verdict.
    /// A run that produced nothing is not a success, even when no error
    /// fired - exhausting every password counts for nothing.
    fn finish(&self, result: &mut ExtractionResult) {
        remove_empty_dirs(&self.config.output_dir);
        result.success = result.errors.is_empty()
            && (!result.extracted_archives.is_empty() || !result.final_files.is_empty());
    }
}

/// Files under `root`, up to `max_depth` levels, in sorted order.
fn list_files(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn snapshot_tree(root: &Path) -> HashSet<PathBuf> {
    list_files(root, usize::MAX).into_iter().collect()
}

/// Files present now that were not in the snapshot.
fn diff_tree(root: &Path, snapshot: &HashSet<PathBuf>) -> Vec<PathBuf> {
    list_files(root, usize::MAX)
        .into_iter()
        .filter(|p| !snapshot.contains(p))
        .collect()
}

/// Group new files by parent directory and analyze each directory's
/// multi-part sets. Sets never span directories.
fn analyze_by_directory(files: &[PathBuf]) -> Vec<MultiPartArchive> {
    let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        let dir = file.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
        by_dir.entry(dir).or_default().push(file.clone());
    }
    by_dir
        .values()
        .flat_map(|files| multipart::analyze(files))
        .collect()
}

/// Fresh output directory for a nested archive, next to the archive,
/// named by stripping the known archive/part suffixes. Collisions get a
/// numeric suffix.
fn nested_output_dir(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "extracted".to_string());

    let mut base = classify::strip_archive_suffixes(&name);
    if base == name {
        // Sniffed archives with a non-archive extension keep their stem.
        base = Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
    }
    if base.is_empty() {
        base = "extracted".to_string();
    }

    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    let mut candidate = parent.join(&base);
    let mut n = 1;
    while candidate.exists() {
        n += 1;
        candidate = parent.join(format!("{base}-{n}"));
    }
    candidate
}

/// Remove empty directories bottom-up, leaving `root` itself alone.
fn remove_empty_dirs(root: &Path) {
    if !root.exists() {
        return;
    }
    for entry in WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() && entry.path() != root {
            // Fails on non-empty directories, which is the point.
            let _ = fs::remove_dir(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Script, ScriptedBackend};
    use crate::backend::BackendOutcome;

    fn config(out: &Path) -> ExtractConfig {
        ExtractConfig::new(out.to_path_buf())
    }

    #[test]
    fn end_to_end_password_chain() {
        // Password-protected ZIP holding an unencrypted 7z holding a
        // text file; list = [wrong1, correct].
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let outer = dir.path().join("outer.zip");
        fs::write(&outer, b"zipbytes").unwrap();

        let backend = ScriptedBackend::new()
            .script(
                "outer.zip",
                Script::encrypted("correct", &[("nested.7z", b"sevenz")]),
            )
            .script("nested.7z", Script::plain(&[("note.txt", b"hello")]));

        let mut passwords = PasswordRegistry::new();
        passwords.add("wrong1");
        passwords.add("correct");

        let mut extractor = Extractor::new(&backend, config(&out), &mut passwords).unwrap();
        let result = extractor.run(&outer).unwrap();

        // Attempt order on the outer zip: no password, wrong1, correct.
        {
            let attempts = backend.attempts.lock().unwrap();
            let outer_attempts: Vec<Option<String>> = attempts
                .iter()
                .filter(|(name, _)| name == "outer.zip")
                .map(|(_, pw)| pw.clone())
                .collect();
            assert_eq!(
                outer_attempts,
                vec![
                    None,
                    Some("wrong1".to_string()),
                    Some("correct".to_string())
                ]
            );
        }

        assert!(result.success);
        assert_eq!(result.extracted_archives.len(), 2);
        assert_eq!(result.extracted_archives[0], outer);
        assert_eq!(
            result.extracted_archives[1].file_name().unwrap(),
            "nested.7z"
        );
        assert_eq!(result.final_files.len(), 1);
        assert_eq!(result.final_files[0].file_name().unwrap(), "note.txt");
        assert_eq!(result.password_used[&outer], "correct");
        assert!(!result.password_used.contains_key(&result.extracted_archives[1]));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn depth_bound_stops_one_branch_only() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let root = dir.path().join("a.zip");
        fs::write(&root, b"x").unwrap();

        // a -> b -> c -> d, plus a shallow sibling file in a.
        let backend = ScriptedBackend::new()
            .script(
                "a.zip",
                Script::plain(&[("b.zip", b"b"), ("shallow.txt", b"s")]),
            )
            .script("b.zip", Script::plain(&[("c.zip", b"c")]))
            .script("c.zip", Script::plain(&[("d.zip", b"d")]))
            .script("d.zip", Script::plain(&[("leaf.txt", b"leaf")]));

        let mut passwords = PasswordRegistry::new();
        let mut cfg = config(&out);
        cfg.max_depth = 2;
        let mut extractor = Extractor::new(&backend, cfg, &mut passwords).unwrap();
        let result = extractor.run(&root).unwrap();

        // a (0), b (1), c (2) extract; d (3) exceeds the bound.
        assert_eq!(result.extracted_archives.len(), 3);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Max depth"));
        assert!(result.errors[0].contains("d.zip"));
        assert_eq!(backend.attempt_count("d.zip"), 0);

        // The sibling branch completed normally.
        assert!(result
            .final_files
            .iter()
            .any(|f| f.file_name().unwrap() == "shallow.txt"));
        assert!(!result.success);
    }

    #[test]
    fn cleanup_trashes_consumed_nested_archives_only() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let trash_root = dir.path().join("trash");
        let root = dir.path().join("x.zip");
        fs::write(&root, b"x").unwrap();

        let backend = ScriptedBackend::new()
            .script("x.zip", Script::plain(&[("inner.rar", b"r")]))
            .script("inner.rar", Script::plain(&[("doc.txt", b"d")]));

        let mut passwords = PasswordRegistry::new();
        let mut cfg = config(&out);
        cfg.cleanup = true;
        cfg.trash_root = Some(trash_root.clone());
        let mut extractor = Extractor::new(&backend, cfg, &mut passwords).unwrap();
        let result = extractor.run(&root).unwrap();

        assert!(result.success);
        // The root input is never removed.
        assert!(root.exists());
        // The consumed nested archive went to the trash.
        assert!(!out.join("inner.rar").exists());
        assert_eq!(trash::list_trash(&trash_root).unwrap().len(), 1);
    }

    #[test]
    fn failed_archives_are_never_removed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let trash_root = dir.path().join("trash");
        let root = dir.path().join("x.zip");
        fs::write(&root, b"x").unwrap();

        let backend = ScriptedBackend::new()
            .script("x.zip", Script::plain(&[("inner.rar", b"r")]))
            .script("inner.rar", Script::failing(BackendOutcome::Corrupted));

        let mut passwords = PasswordRegistry::new();
        let mut cfg = config(&out);
        cfg.cleanup = true;
        cfg.trash_root = Some(trash_root.clone());
        let mut extractor = Extractor::new(&backend, cfg, &mut passwords).unwrap();
        let result = extractor.run(&root).unwrap();

        // The corrupted nested archive stays exactly where it was.
        assert!(out.join("inner.rar").exists());
        assert!(trash::list_trash(&trash_root).unwrap().is_empty());
        assert!(result.errors.iter().any(|e| e.contains("inner.rar")));
        assert!(!result.success);
    }

    #[test]
    fn incomplete_set_failure_is_non_destructive() {
        // set.zip is the head of a split set whose .z01 is gone; the
        // simulated extraction failure must leave it untouched.
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let trash_root = dir.path().join("trash");
        let head = dir.path().join("set.zip");
        fs::write(&head, b"zip-head").unwrap();

        let backend = ScriptedBackend::new()
            .script("set.zip", Script::failing(BackendOutcome::Corrupted));

        let mut passwords = PasswordRegistry::new();
        let mut cfg = config(&out);
        cfg.cleanup = true;
        cfg.trash_root = Some(trash_root.clone());
        let mut extractor = Extractor::new(&backend, cfg, &mut passwords).unwrap();
        let result = extractor.run_drop(dir.path()).unwrap();

        assert!(head.exists());
        assert_eq!(fs::read(&head).unwrap(), b"zip-head");
        assert!(trash::list_trash(&trash_root).unwrap().is_empty());
        assert!(!result.success);
    }

    #[test]
    fn exhausted_passwords_is_a_note_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let root = dir.path().join("locked.zip");
        fs::write(&root, b"x").unwrap();

        let backend =
            ScriptedBackend::new().script("locked.zip", Script::encrypted("unknown", &[]));
        let mut passwords = PasswordRegistry::new();
        passwords.add("guess");

        let mut extractor = Extractor::new(&backend, config(&out), &mut passwords).unwrap();
        let result = extractor.run(&root).unwrap();

        assert!(result.errors.is_empty());
        assert_eq!(result.notes.len(), 1);
        assert!(result.notes[0].contains("no known password"));
        // Nothing was produced, so the run still is not a success.
        assert!(!result.success);
        assert!(root.exists());
    }

    #[test]
    fn drop_mode_extracts_groups_and_skips_continuations() {
        let dir = tempfile::tempdir().unwrap();
        let drop = dir.path().join("drop");
        let out = dir.path().join("out");
        fs::create_dir_all(&drop).unwrap();
        for name in ["data.7z.001", "data.7z.002", "single.zip", "readme.txt"] {
            fs::write(drop.join(name), b"x").unwrap();
        }

        let backend = ScriptedBackend::new()
            .script("data.7z.001", Script::plain(&[("payload.bin", b"p")]))
            .script("single.zip", Script::plain(&[("doc.txt", b"d")]));

        let mut passwords = PasswordRegistry::new();
        let mut extractor = Extractor::new(&backend, config(&out), &mut passwords).unwrap();
        let result = extractor.run_drop(&drop).unwrap();

        assert!(result.success);
        assert_eq!(result.extracted_archives.len(), 2);
        assert_eq!(result.final_files.len(), 2);
        // The continuation part is never attempted on its own.
        assert_eq!(backend.attempt_count("data.7z.002"), 0);
        // Non-archives in the drop are not errors.
        assert!(result.errors.is_empty());
    }

    #[test]
    fn drop_mode_uncloaks_before_grouping() {
        let dir = tempfile::tempdir().unwrap();
        let drop = dir.path().join("drop");
        let out = dir.path().join("out");
        fs::create_dir_all(&drop).unwrap();
        fs::write(drop.join("secret.7!z"), b"x").unwrap();

        let backend =
            ScriptedBackend::new().script("secret.7z", Script::plain(&[("inner.txt", b"i")]));

        let mut passwords = PasswordRegistry::new();
        let mut extractor = Extractor::new(&backend, config(&out), &mut passwords).unwrap();
        let result = extractor.run_drop(&drop).unwrap();

        assert!(drop.join("secret.7z").exists());
        assert!(!drop.join("secret.7!z").exists());
        assert!(result.success);
        assert_eq!(result.final_files.len(), 1);
    }

    #[test]
    fn missing_parts_recovered_from_candidate_containers() {
        let dir = tempfile::tempdir().unwrap();
        let drop = dir.path().join("drop");
        let out = dir.path().join("out");
        fs::create_dir_all(&drop).unwrap();
        for name in ["base.001", "base.002", "base.004"] {
            fs::write(drop.join(name), b"x").unwrap();
        }
        // A container whose payload is the missing part.
        fs::write(drop.join("base_extra.zip"), b"x").unwrap();

        let backend = ScriptedBackend::new()
            .script("base_extra.zip", Script::plain(&[("base.003", b"part3")]))
            .script("base.001", Script::plain(&[("restored.txt", b"r")]));

        let mut passwords = PasswordRegistry::new();
        let mut extractor = Extractor::new(&backend, config(&out), &mut passwords).unwrap();
        let result = extractor.run_drop(&drop).unwrap();

        // The recovered part was moved next to the set before the head
        // was extracted.
        assert!(drop.join("base.003").exists());
        assert!(result
            .notes
            .iter()
            .any(|n| n.contains("Recovered missing part")));
        assert!(result
            .extracted_archives
            .iter()
            .any(|a| a.file_name().unwrap() == "base.001"));
    }

    #[test]
    fn duplicate_paths_are_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let root = dir.path().join("a.zip");
        fs::write(&root, b"x").unwrap();

        let backend =
            ScriptedBackend::new().script("a.zip", Script::plain(&[("f.txt", b"f")]));
        let mut passwords = PasswordRegistry::new();
        let mut extractor = Extractor::new(&backend, config(&out), &mut passwords).unwrap();

        let mut processed = HashSet::new();
        let mut result = ExtractionResult::default();
        fs::create_dir_all(&out).unwrap();
        extractor.run_queue(
            vec![
                WorkItem {
                    archive: root.clone(),
                    output_dir: out.clone(),
                    depth: 0,
                },
                WorkItem {
                    archive: root.clone(),
                    output_dir: out.clone(),
                    depth: 0,
                },
            ],
            &mut result,
            &mut processed,
        );

        assert_eq!(backend.attempt_count("a.zip"), 1);
        assert_eq!(result.extracted_archives.len(), 1);
    }

    #[test]
    fn empty_directories_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("a/b/c")).unwrap();
        fs::create_dir_all(out.join("kept")).unwrap();
        fs::write(out.join("kept/file.txt"), b"x").unwrap();

        remove_empty_dirs(&out);
        assert!(!out.join("a").exists());
        assert!(out.join("kept/file.txt").exists());
        assert!(out.exists());
    }

    #[test]
    fn nested_output_dirs_avoid_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("data.7z.001");
        fs::write(&archive, b"x").unwrap();

        let first = nested_output_dir(&archive);
        assert_eq!(first.file_name().unwrap(), "data");

        fs::create_dir(dir.path().join("data")).unwrap();
        let second = nested_output_dir(&archive);
        assert_eq!(second.file_name().unwrap(), "data-2");
    }
}
