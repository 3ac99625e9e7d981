//! Cloaked-filename detection and repair.
//!
//! Drops frequently contain archives whose names were mangled on purpose:
//! junk characters injected next to the extension token (`backup.7z£.001`),
//! doubled dots, digits padded with noise. The structural classifier cannot
//! see through that, so this module reconstructs the most plausible clean
//! name and lets the structural table re-judge it.
//!
//! Detection is rule-driven: a declarative rule set (JSON) is loaded once
//! at startup, validated as a whole, sorted by descending priority, and
//! applied first-match-wins. A missing or unreadable rule store degrades to
//! the built-in rules - never to a hard failure. Behind the rules sit two
//! generic strategies: plain noise stripping, and a loose
//! character-interleaved token matcher as the last resort.
//!
//! Every reconstructed name is verified against the structural table before
//! it is reported, so an uncloak can never produce a name the classifier
//! would not accept.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{classify_name, ArchiveKind};

/// Which of the two patterns a rule requires to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchingType {
    Both,
    Filename,
    Ext,
}

/// One rule record as stored in the JSON rule file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloakRuleRecord {
    pub name: String,
    #[serde(default)]
    pub filename_pattern: Option<String>,
    #[serde(default)]
    pub ext_pattern: Option<String>,
    #[serde(default)]
    pub priority: i32,
    pub matching_type: MatchingType,
    pub archive_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A validated, compiled rule.
struct CloakRule {
    name: String,
    filename_re: Option<Regex>,
    ext_re: Option<Regex>,
    priority: i32,
    matching_type: MatchingType,
    kind: ArchiveKind,
    enabled: bool,
}

/// A rule set ready for matching: validated records, sorted by descending
/// priority, ties broken by load order.
pub struct RuleSet {
    rules: Vec<CloakRule>,
}

/// Validation problem for one rule record.
#[derive(Debug)]
pub struct RuleError {
    pub rule: String,
    pub message: String,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule '{}': {}", self.rule, self.message)
    }
}

impl RuleSet {
    /// Compile a record list. Invalid records are rejected and reported in
    /// the error list; the remaining rules still form a usable set.
    pub fn from_records(records: Vec<CloakRuleRecord>) -> (Self, Vec<RuleError>) {
        let mut rules = Vec::new();
        let mut errors = Vec::new();

        for (index, record) in records.into_iter().enumerate() {
            match compile_rule(&record) {
                Ok(rule) => rules.push((index, rule)),
                Err(message) => errors.push(RuleError {
                    rule: if record.name.is_empty() {
                        format!("#{index}")
                    } else {
                        record.name.clone()
                    },
                    message,
                }),
            }
        }

        rules.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        (
            Self {
                rules: rules.into_iter().map(|(_, r)| r).collect(),
            },
            errors,
        )
    }

    /// Load a rule set from a JSON file.
    pub fn load(path: &Path) -> Result<(Self, Vec<RuleError>)> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule store {}", path.display()))?;
        let records: Vec<CloakRuleRecord> = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse rule store {}", path.display()))?;
        Ok(Self::from_records(records))
    }

    /// Load the rule store, degrading to the built-in rules on any
    /// problem. Validation errors are logged, not fatal.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };
        match Self::load(path) {
            Ok((set, errors)) => {
                for err in &errors {
                    warn!("Invalid cloak rule: {err}");
                }
                if set.rules.is_empty() {
                    warn!(
                        "Rule store {} contains no usable rules, using built-ins",
                        path.display()
                    );
                    Self::builtin()
                } else {
                    set
                }
            }
            Err(err) => {
                warn!("Cloak rule store unusable ({err:#}), using built-ins");
                Self::builtin()
            }
        }
    }

    /// The compiled-in default rules.
    pub fn builtin() -> Self {
        let (set, errors) = Self::from_records(builtin_records());
        debug_assert!(errors.is_empty(), "built-in rules must validate");
        set
    }

    /// Derive a clean name for a cloaked file, or `None` when the name is
    /// already clean or nothing plausible can be reconstructed.
    pub fn uncloak(&self, name: &str) -> Option<String> {
        // Already classifiable means not cloaked.
        if classify_name(name).is_some() {
            return None;
        }

        for rule in self.rules.iter().filter(|r| r.enabled) {
            if let Some(candidate) = apply_rule(rule, name) {
                debug!("Rule '{}' uncloaked {} -> {}", rule.name, name, candidate);
                return Some(candidate);
            }
        }

        if let Some(candidate) = strip_noise(name) {
            return Some(candidate);
        }

        loose_match(name)
    }
}

fn compile_rule(record: &CloakRuleRecord) -> Result<CloakRule, String> {
    if record.name.trim().is_empty() {
        return Err("missing name".to_string());
    }
    let kind = ArchiveKind::from_label(&record.archive_type)
        .ok_or_else(|| format!("unknown archive type '{}'", record.archive_type))?;

    let compile = |pattern: &Option<String>, which: &str| -> Result<Option<Regex>, String> {
        match pattern {
            Some(p) => Regex::new(p)
                .map(Some)
                .map_err(|e| format!("bad {which} pattern: {e}")),
            None => Ok(None),
        }
    };
    let filename_re = compile(&record.filename_pattern, "filename")?;
    let ext_re = compile(&record.ext_pattern, "ext")?;

    match record.matching_type {
        MatchingType::Filename if filename_re.is_none() => {
            return Err("matching type 'filename' requires filename_pattern".to_string());
        }
        MatchingType::Ext if ext_re.is_none() => {
            return Err("matching type 'ext' requires ext_pattern".to_string());
        }
        MatchingType::Both if filename_re.is_none() || ext_re.is_none() => {
            return Err("matching type 'both' requires both patterns".to_string());
        }
        _ => {}
    }

    Ok(CloakRule {
        name: record.name.clone(),
        filename_re,
        ext_re,
        priority: record.priority,
        matching_type: record.matching_type,
        kind,
        enabled: record.enabled,
    })
}

/// Apply one rule. The filename pattern may capture `base` and `num`;
/// candidates are rebuilt from those captures and only accepted when the
/// structural table classifies them.
fn apply_rule(rule: &CloakRule, name: &str) -> Option<String> {
    let ext = name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");

    let filename_caps = match (&rule.filename_re, rule.matching_type) {
        (Some(re), MatchingType::Filename | MatchingType::Both) => {
            let caps = re.captures(name)?;
            Some(caps)
        }
        _ => None,
    };
    if matches!(rule.matching_type, MatchingType::Ext | MatchingType::Both) {
        let re = rule.ext_re.as_ref()?;
        if !re.is_match(ext) {
            return None;
        }
    }

    let (base, num) = match &filename_caps {
        Some(caps) => {
            let base = caps.name("base").map(|m| m.as_str())?;
            let num = caps.name("num").map(|m| m.as_str().to_string());
            (trim_junk(base)?, num)
        }
        // Ext-only rules carry no captures; fall back to noise stripping
        // of the stem.
        None => {
            let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
            (trim_junk(stem)?, None)
        }
    };

    rebuild(&base, rule.kind, num.as_deref())
}

/// Candidate clean names for (base, kind, part digits), first one the
/// structural table accepts.
fn rebuild(base: &str, kind: ArchiveKind, num: Option<&str>) -> Option<String> {
    let label = kind.label();
    let mut candidates = Vec::new();
    match num {
        Some(num) => {
            candidates.push(format!("{base}.{label}.{num}"));
            match kind {
                ArchiveKind::Zip if num.len() == 2 => candidates.push(format!("{base}.z{num}")),
                ArchiveKind::Rar => candidates.push(format!("{base}.part{num}.rar")),
                _ => {}
            }
        }
        None => candidates.push(format!("{base}.{label}")),
    }
    candidates.into_iter().find(|c| classify_name(c).is_some())
}

fn trim_junk(base: &str) -> Option<String> {
    let trimmed = base
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric() && c != ')' && c != ']')
        .to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Characters that survive generic noise stripping.
fn is_clean_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ' | '(' | ')' | '[' | ']' | '+')
}

static MULTI_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{2,}").unwrap());

/// Remove injected non-filename characters and collapse repeated dots,
/// then let the structural table re-judge.
fn strip_noise(name: &str) -> Option<String> {
    let stripped: String = name.chars().filter(|c| is_clean_char(*c)).collect();
    let collapsed = MULTI_DOT.replace_all(&stripped, ".").into_owned();
    if collapsed == name {
        return None;
    }
    if classify_name(&collapsed).is_some() {
        Some(collapsed)
    } else {
        None
    }
}

/// Tokens the loose matcher recognizes. The short compression suffixes
/// (`gz`, `xz`, `bz2`) are deliberately excluded: two-letter subsequence
/// matching on those flags far too many ordinary files.
const LOOSE_TOKENS: &[(ArchiveKind, &str)] = &[
    (ArchiveKind::SevenZ, "7z"),
    (ArchiveKind::Zip, "zip"),
    (ArchiveKind::Rar, "rar"),
    (ArchiveKind::Tar, "tar"),
];

/// Last resort: match the archive token as a character subsequence inside
/// a dot-separated component, tolerating up to two interleaved junk
/// characters, and salvage part digits the same way.
fn loose_match(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return None;
    }

    let last = parts[parts.len() - 1];
    let last_alnum = alnum_lower(last);

    // `base.<token-with-junk>`
    if let Some(kind) = token_kind(&last_alnum) {
        let base = trim_junk(&parts[..parts.len() - 1].join("."))?;
        return rebuild(&base, kind, None);
    }

    // `base.<token-with-junk>.<digits-with-junk>`
    let digits: String = last.chars().filter(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() && digits.len() <= 4 && parts.len() >= 3 {
        let token = alnum_lower(parts[parts.len() - 2]);
        if let Some(kind) = token_kind(&token) {
            let base = trim_junk(&parts[..parts.len() - 2].join("."))?;
            return rebuild(&base, kind, Some(&digits));
        }
    }

    None
}

fn alnum_lower(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

fn token_kind(component: &str) -> Option<ArchiveKind> {
    for (kind, token) in LOOSE_TOKENS {
        if component.len() <= token.len() + 2 && is_subsequence(token, component) {
            return Some(*kind);
        }
    }
    None
}

fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut chars = haystack.chars();
    needle.chars().all(|n| chars.any(|h| h == n))
}

/// Built-in cloak rules: junk injected adjacent to the archive token or
/// the part digits, per family.
fn builtin_records() -> Vec<CloakRuleRecord> {
    let part_rule = |name: &str, ty: &str, priority: i32| CloakRuleRecord {
        name: name.to_string(),
        filename_pattern: Some(format!(
            r"(?i)^(?P<base>.+?)[^0-9a-z]*\.[^0-9a-z.]*{ty}[^0-9a-z.]*\.[^0-9a-z.]*(?P<num>\d{{1,4}})[^0-9a-z]*$"
        )),
        ext_pattern: None,
        priority,
        matching_type: MatchingType::Filename,
        archive_type: ty.to_string(),
        enabled: true,
    };
    let single_rule = |name: &str, ty: &str, priority: i32| CloakRuleRecord {
        name: name.to_string(),
        filename_pattern: Some(format!(
            r"(?i)^(?P<base>.+?)[^0-9a-z]*\.[^0-9a-z.]*{ty}[^0-9a-z.]*$"
        )),
        ext_pattern: None,
        priority,
        matching_type: MatchingType::Filename,
        archive_type: ty.to_string(),
        enabled: true,
    };

    vec![
        part_rule("7z-part-noise", "7z", 100),
        part_rule("zip-part-noise", "zip", 90),
        part_rule("rar-part-noise", "rar", 90),
        part_rule("tar-part-noise", "tar", 80),
        CloakRuleRecord {
            name: "zip-split-noise".to_string(),
            filename_pattern: Some(
                r"(?i)^(?P<base>.+?)[^0-9a-z]*\.[^0-9a-z.]*z[^0-9a-z.]*(?P<num>\d{2})[^0-9a-z]*$"
                    .to_string(),
            ),
            ext_pattern: None,
            priority: 70,
            matching_type: MatchingType::Filename,
            archive_type: "zip".to_string(),
            enabled: true,
        },
        single_rule("7z-single-noise", "7z", 60),
        single_rule("zip-single-noise", "zip", 50),
        single_rule("rar-single-noise", "rar", 50),
    ]
}

static BUILTIN: Lazy<RuleSet> = Lazy::new(RuleSet::builtin);

/// Uncloak with the built-in rule set.
pub fn uncloak_name(name: &str) -> Option<String> {
    BUILTIN.uncloak(name)
}

/// Rename a cloaked file to its reconstructed clean name.
///
/// The rename is skipped when the target already exists - never overwrite
/// on an ambiguous situation. Returns the new path when a rename happened.
pub fn uncloak_rename(path: &Path, rules: &RuleSet) -> Result<Option<PathBuf>> {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(None);
    };
    let Some(clean) = rules.uncloak(&name) else {
        return Ok(None);
    };

    let target = path.with_file_name(&clean);
    if target.exists() {
        warn!(
            "Not renaming {} -> {}: target already exists",
            path.display(),
            clean
        );
        return Ok(None);
    }

    fs::rename(path, &target)
        .with_context(|| format!("Failed to rename {} -> {}", path.display(), clean))?;
    info!("Uncloaked {} -> {}", path.display(), clean);
    Ok(Some(target))
}
