//! Drop-directory grouping: partition a flat file listing into archive
//! groups by directory locality and filename similarity.
//!
//! Files directly under the drop root are grouped apart from files in its
//! immediate subfolders, and a subfolder is never assumed to be one group -
//! its contents go through the same analysis, with the subfolder name
//! prefixed onto the resulting group names.
//!
//! Within one location, multi-part-looking names are pulled out first and
//! grouped by shared base name. Whatever remains is grouped transitively by
//! normalized-name similarity: each unclaimed file seeds a group and pulls
//! in every other unclaimed file scoring at or above the threshold. Seeds
//! are taken in input order, so group membership is deterministic for a
//! fixed input ordering.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use strsim::normalized_levenshtein;
use tracing::debug;

use crate::multipart;

/// Similarity ratio at or above which two normalized names are considered
/// the same logical archive.
const SIMILARITY_THRESHOLD: f64 = 0.9;

/// One detected group of related files.
#[derive(Debug, Clone)]
pub struct ArchiveGroup {
    pub name: String,
    files: Vec<PathBuf>,
    main_archive: Option<PathBuf>,
    is_multi_part: bool,
}

impl ArchiveGroup {
    pub fn new(name: String) -> Self {
        Self {
            name,
            files: Vec::new(),
            main_archive: None,
            is_multi_part: false,
        }
    }

    /// Append a file. The first file becomes the main archive; a later
    /// file takes over only when it is a better extraction entry point
    /// (part 1 of a split set). The multi-part flag latches: once any
    /// member looks split, the group stays multi-part.
    pub fn push(&mut self, file: PathBuf) {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if multipart::is_multi_part_like(&name) {
            self.is_multi_part = true;
        }

        match &self.main_archive {
            None => self.main_archive = Some(file.clone()),
            Some(current) => {
                let current_name = current
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if is_first_part(&name) && !is_first_part(&current_name) {
                    self.main_archive = Some(file.clone());
                }
            }
        }

        self.files.push(file);
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Entry-point file for extraction. Always a member of `files` once
    /// any file has been pushed.
    pub fn main_archive(&self) -> Option<&PathBuf> {
        self.main_archive.as_ref()
    }

    pub fn is_multi_part(&self) -> bool {
        self.is_multi_part
    }
}

fn is_first_part(name: &str) -> bool {
    crate::classify::classify_name(name)
        .map(|c| c.part_number == Some(1) || c.part_number.is_none())
        .unwrap_or(false)
}

/// Normalize a filename for similarity comparison: lowercase, extension
/// and part suffixes stripped, separator runs collapsed to one space.
fn normalize(name: &str) -> String {
    let base = multipart::part_base_name(name);
    let stem = base.rsplit_once('.').map(|(s, _)| s).unwrap_or(&base);

    let mut out = String::with_capacity(stem.len());
    let mut last_was_sep = true;
    for c in stem.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push(' ');
            last_was_sep = true;
        }
    }
    out.trim_end().to_string()
}

/// Partition `files` into named groups. `root` is the drop directory the
/// listing came from; files outside it are treated as root-level.
pub fn group(files: &[PathBuf], root: &Path) -> BTreeMap<String, ArchiveGroup> {
    // Location split: root-level files vs one bucket per immediate
    // subfolder, preserving input order within each bucket.
    let mut root_level: Vec<PathBuf> = Vec::new();
    let mut by_subfolder: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    for file in files {
        match immediate_subfolder(file, root) {
            Some(sub) => by_subfolder.entry(sub).or_default().push(file.clone()),
            None => root_level.push(file.clone()),
        }
    }

    let mut groups = BTreeMap::new();
    insert_groups(&mut groups, group_one_location(&root_level), None);
    for (subfolder, sub_files) in by_subfolder {
        // Subfolder contents get the same analysis, not a blanket group;
        // deeper levels recurse the same way.
        let sub_groups = group(&sub_files, &root.join(&subfolder));
        insert_groups(
            &mut groups,
            sub_groups.into_values().collect(),
            Some(&subfolder),
        );
    }

    debug!("Grouped {} files into {} groups", files.len(), groups.len());
    groups
}

fn immediate_subfolder(file: &Path, root: &Path) -> Option<String> {
    let rel = file.strip_prefix(root).ok()?;
    let mut components = rel.components();
    let first = components.next()?;
    // Only a directory component counts; a bare filename is root-level.
    components.next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

fn insert_groups(
    into: &mut BTreeMap<String, ArchiveGroup>,
    groups: Vec<ArchiveGroup>,
    prefix: Option<&str>,
) {
    for mut group in groups {
        let mut name = match prefix {
            Some(p) => format!("{p}/{}", group.name),
            None => group.name.clone(),
        };
        // Collisions across locations keep both groups.
        let mut n = 1;
        while into.contains_key(&name) {
            n += 1;
            name = match prefix {
                Some(p) => format!("{p}/{}-{n}", group.name),
                None => format!("{}-{n}", group.name),
            };
        }
        group.name = name.clone();
        into.insert(name, group);
    }
}

/// Group the files of a single location (the root, or one subfolder).
fn group_one_location(files: &[PathBuf]) -> Vec<ArchiveGroup> {
    let mut groups: Vec<ArchiveGroup> = Vec::new();
    let mut claimed = vec![false; files.len()];

    // Pass 1: multi-part candidates, grouped by shared base name.
    let mut part_groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, file) in files.iter().enumerate() {
        let name = file_name(file);
        if multipart::is_multi_part_like(&name) {
            let base = normalize(&name);
            part_groups.entry(base).or_default().push(i);
        }
    }
    for (base, indices) in part_groups {
        if base.is_empty() {
            continue;
        }
        let mut group = ArchiveGroup::new(base);
        for &i in &indices {
            claimed[i] = true;
            group.push(files[i].clone());
        }
        groups.push(group);
    }

    // Pass 2: transitive similarity grouping of the rest. Seeds iterate in
    // input order; a claimed file never seeds or joins again.
    for seed in 0..files.len() {
        if claimed[seed] {
            continue;
        }
        claimed[seed] = true;
        let seed_norm = normalize(&file_name(&files[seed]));

        let mut group = ArchiveGroup::new(if seed_norm.is_empty() {
            file_name(&files[seed])
        } else {
            seed_norm.clone()
        });
        group.push(files[seed].clone());

        if !seed_norm.is_empty() {
            for other in (seed + 1)..files.len() {
                if claimed[other] {
                    continue;
                }
                let other_norm = normalize(&file_name(&files[other]));
                if normalized_levenshtein(&seed_norm, &other_norm) >= SIMILARITY_THRESHOLD {
                    claimed[other] = true;
                    group.push(files[other].clone());
                }
            }
        }
        groups.push(group);
    }

    groups
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
