//! Multi-part archive set analysis.
//!
//! Groups files in one directory into split-archive sets by part-suffix
//! pattern, works out which numbered parts are present versus missing, and
//! hunts for sibling containers that might hold the missing pieces.
//!
//! The expected part range is inferred as `[min(found), max(found)]` - the
//! numbering is trusted, not verified against file content. Sets with two
//! or fewer members are the exception: a `{.001, .002}` pair says nothing
//! about whether a `.003` once existed, so those sets are flagged possibly
//! incomplete regardless of contiguity. Completeness is only ever asserted
//! after a candidate container has actually been extracted and the
//! directory re-analyzed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

/// One detected split-archive set.
///
/// Constructed per analysis pass and never patched afterward; re-run
/// [`analyze`] instead of mutating a stale instance.
#[derive(Debug, Clone)]
pub struct MultiPartArchive {
    /// Shared base name of the set (suffixes stripped)
    pub base_name: String,
    /// Contiguous range inferred from the found part numbers
    pub expected_parts: BTreeSet<u32>,
    /// Part number -> file, for the parts actually on disk
    pub found_parts: BTreeMap<u32, PathBuf>,
    /// Fewer than three members: contiguity proves nothing, treat the set
    /// as possibly incomplete and search for more parts anyway.
    pub possibly_incomplete: bool,
}

impl MultiPartArchive {
    pub fn missing_parts(&self) -> BTreeSet<u32> {
        self.expected_parts
            .difference(&self.found_parts.keys().copied().collect())
            .copied()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_parts().is_empty()
    }

    /// The lowest-numbered part on disk. Extraction always starts here;
    /// the backend auto-discovers the sibling parts.
    pub fn first_part(&self) -> Option<&PathBuf> {
        self.found_parts.values().next()
    }

    /// Every part except the first. These are consumed implicitly when
    /// the first part extracts and must never be extracted on their own.
    pub fn continuation_parts(&self) -> impl Iterator<Item = &PathBuf> {
        self.found_parts.values().skip(1)
    }
}

/// One part-suffix pattern family. Each regex captures the stem as `base`
/// and the part digits as `num`.
struct PartPattern {
    family: &'static str,
    re: Regex,
}

/// Ordered pattern list; each file is assigned to the first family that
/// matches, so a name can never land in two groups.
static PART_PATTERNS: Lazy<Vec<PartPattern>> = Lazy::new(|| {
    let pat = |family, s: &str| PartPattern {
        family,
        re: Regex::new(s).unwrap(),
    };
    vec![
        // data.7z.001, data.zip.002, data.rar.003, data.tar.0001
        pat(
            "ext-numeric",
            r"(?i)^(?P<base>.+)\.(?:7z|zip|rar|tar)\.(?P<num>\d{3,4})$",
        ),
        // movie.part1.rar, movie.part02.rar
        pat("part-rar", r"(?i)^(?P<base>.+)\.part(?P<num>\d{1,3})\.rar$"),
        // generic .partN without a trailing extension
        pat("part-bare", r"(?i)^(?P<base>.+)\.part(?P<num>\d{1,3})$"),
        // set.z01, set.z02 (the .zip head of the set is part of the same
        // family; see `analyze`)
        pat("zip-split", r"(?i)^(?P<base>.+)\.z(?P<num>\d{2})$"),
        // vol.r00, vol.r01
        pat("rar-old", r"(?i)^(?P<base>.+)\.r(?P<num>\d{2})$"),
        // backup.vol001, backup.vol1+2
        pat("vol", r"(?i)^(?P<base>.+)\.vol(?P<num>\d{1,4})(?:\+\d+)?$"),
        // bare numeric suffix: chunk.001
        pat("bare-numeric", r"^(?P<base>.+)\.(?P<num>\d{3})$"),
    ]
});

/// Keywords hinting that an unrelated-looking sibling might be a container
/// for missing parts.
const CONTAINER_HINTS: &[&str] = &["part", "vol", "disk", "disc", "cd", "split"];

fn match_part(name: &str) -> Option<(&'static str, String, u32)> {
    for pattern in PART_PATTERNS.iter() {
        if let Some(caps) = pattern.re.captures(name) {
            let base = caps.name("base")?.as_str().to_string();
            let num = caps.name("num")?.as_str().parse::<u32>().ok()?;
            return Some((pattern.family, base, num));
        }
    }
    None
}

/// Group a directory's files into multi-part sets.
///
/// Files whose names match no part pattern are ignored. Groups with fewer
/// than two members are not sets at all - a lone `.001` is handed back to
/// the caller as an ordinary file by [`extraction_order`].
pub fn analyze(files: &[PathBuf]) -> Vec<MultiPartArchive> {
    // (family, lowercased base) -> (display base, num -> path)
    let mut groups: BTreeMap<(String, String), (String, BTreeMap<u32, PathBuf>)> = BTreeMap::new();

    for file in files {
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some((family, base, num)) = match_part(&name) else {
            continue;
        };
        let key = (family.to_string(), base.to_lowercase());
        let entry = groups.entry(key).or_insert_with(|| (base, BTreeMap::new()));
        // First occurrence of a part number wins.
        entry.1.entry(num).or_insert_with(|| file.clone());
    }

    // The .zip head of a legacy split set (set.zip + set.z01 + set.z02)
    // lives outside the zip-split pattern; pull it into its set so the
    // completeness check sees the whole family.
    for ((family, base_key), (_, parts)) in groups.iter_mut() {
        if family != "zip-split" {
            continue;
        }
        for file in files {
            let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
                continue;
            };
            if name == format!("{base_key}.zip") {
                // The .zip is the last volume in 7z's numbering; store it
                // under the next free index so first_part stays .z01.
                let next = parts.keys().max().copied().unwrap_or(0) + 1;
                parts.insert(next, file.clone());
            }
        }
    }

    groups
        .into_values()
        .filter(|(_, parts)| parts.len() >= 2)
        .map(|(base_name, found_parts)| {
            let min = *found_parts.keys().next().unwrap();
            let max = *found_parts.keys().last().unwrap();
            let possibly_incomplete = found_parts.len() <= 2;
            MultiPartArchive {
                base_name,
                expected_parts: (min..=max).collect(),
                found_parts,
                possibly_incomplete,
            }
        })
        .collect()
}

/// Find sibling files that might be containers holding an incomplete
/// set's missing parts.
///
/// A candidate must live in the pool, not already belong to the set, and
/// carry either a keyword hint or a numeric hint overlapping the missing
/// indices. This returns candidates to try extracting - completeness is
/// re-verified afterwards, never assumed from the naming.
pub fn find_missing_parts(archive: &MultiPartArchive, pool: &[PathBuf]) -> Vec<PathBuf> {
    let missing = archive.missing_parts();
    if missing.is_empty() && !archive.possibly_incomplete {
        return Vec::new();
    }

    let claimed: BTreeSet<&PathBuf> = archive.found_parts.values().collect();
    let base_lower = archive.base_name.to_lowercase();

    let mut candidates = Vec::new();
    for file in pool {
        if claimed.contains(file) {
            continue;
        }
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
            continue;
        };

        let keyword_hint = name.contains(&base_lower)
            || CONTAINER_HINTS.iter().any(|hint| name.contains(hint));
        let numeric_hint = extract_numbers(&name)
            .into_iter()
            .any(|n| missing.contains(&n));

        if keyword_hint || numeric_hint {
            candidates.push(file.clone());
        }
    }
    candidates
}

fn extract_numbers(name: &str) -> Vec<u32> {
    static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{1,4}").unwrap());
    NUMBERS
        .find_iter(name)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// Priority ordering for a directory's extraction pass.
///
/// 1. Candidate containers for missing parts of incomplete sets - their
///    payload may complete a set, so they go first.
/// 2. The first part of each multi-part set.
/// 3. Everything else, minus continuation parts: extracting `.002` on its
///    own is at best redundant and at worst wrong.
pub fn extraction_order(archives: &[MultiPartArchive], other_files: &[PathBuf]) -> Vec<PathBuf> {
    let mut ordered = Vec::new();
    let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
    let mut push = |path: &PathBuf, ordered: &mut Vec<PathBuf>| {
        if seen.insert(path.clone()) {
            ordered.push(path.clone());
        }
    };

    let continuation: BTreeSet<&PathBuf> = archives
        .iter()
        .flat_map(|a| a.continuation_parts())
        .collect();

    let name_of = |path: &PathBuf| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    for archive in archives {
        if archive.possibly_incomplete || !archive.is_complete() {
            for candidate in find_missing_parts(archive, other_files) {
                if !continuation.contains(&candidate) && !is_continuation_name(&name_of(&candidate))
                {
                    push(&candidate, &mut ordered);
                }
            }
        }
    }

    for archive in archives {
        if let Some(first) = archive.first_part() {
            push(first, &mut ordered);
        }
    }

    for file in other_files {
        if !continuation.contains(file) && !is_continuation_name(&name_of(file)) {
            push(file, &mut ordered);
        }
    }

    ordered
}

/// Broad "looks like a piece of a split set" predicate, for use by the
/// grouping engine. Wider than the strict pattern table: any short
/// trailing numeric component or part/vol keyword counts.
pub fn is_multi_part_like(name: &str) -> bool {
    if match_part(name).is_some() {
        return true;
    }
    static LOOSE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(\.\d{1,4}$|part[\s._-]?\d|vol[\s._-]?\d)").unwrap());
    LOOSE.is_match(name)
}

/// Strip the part suffix from a name, yielding the set's base name.
/// Names without a part suffix come back unchanged.
pub fn part_base_name(name: &str) -> String {
    match match_part(name) {
        Some((_, base, _)) => base,
        None => name.to_string(),
    }
}

/// Base name and part number for a part-suffixed name.
pub fn part_info(name: &str) -> Option<(String, u32)> {
    match_part(name).map(|(_, base, num)| (base, num))
}

/// Whether this file is a non-first continuation part of any analyzed set.
pub fn is_continuation_part(path: &Path, archives: &[MultiPartArchive]) -> bool {
    archives
        .iter()
        .any(|a| a.continuation_parts().any(|p| p == path))
}

/// Whether a name is a non-first continuation part, judged by the name
/// alone. Extracting such a file in isolation is at best redundant, so
/// these are skipped even when the rest of their set is nowhere in sight.
/// `.zNN`/`.rNN` legacy volumes always count: their set's head is the
/// `.zip`/`.rar` file.
pub fn is_continuation_name(name: &str) -> bool {
    static LEGACY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.[zr]\d{2}$").unwrap());
    if LEGACY.is_match(name) {
        return true;
    }
    match match_part(name) {
        Some((_, _, num)) => num != 1,
        None => false,
    }
}
