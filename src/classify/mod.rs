//! Archive classification: decide whether a file is plausibly an archive,
//! which family it belongs to, and which part of a split set it is.
//!
//! Classification runs three passes, first success wins:
//!
//! 1. Structural name patterns (`.7z`, `.7z.001`, `.part3.rar`, `.z02`, ...)
//! 2. Magic-byte sniffing, including a bounded scan of self-extracting
//!    executables for embedded container signatures
//! 3. Cloaked-name uncloaking (see [`cloak`]): strip injected junk and
//!    retry the structural pass on the cleaned name
//!
//! Classification never fails - a file that matches nothing is simply not
//! an archive. Magic-byte detection exists because extension matching alone
//! misses mislabeled archives (a `.zip` that is really RAR, a `.dat` that is
//! really 7z).

pub mod cloak;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Archive family labels. These match the type names used in the cloak
/// rule store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    SevenZ,
    Zip,
    Rar,
    Tar,
    Gzip,
    Bzip2,
    Xz,
}

impl ArchiveKind {
    pub fn label(&self) -> &'static str {
        match self {
            ArchiveKind::SevenZ => "7z",
            ArchiveKind::Zip => "zip",
            ArchiveKind::Rar => "rar",
            ArchiveKind::Tar => "tar",
            ArchiveKind::Gzip => "gz",
            ArchiveKind::Bzip2 => "bz2",
            ArchiveKind::Xz => "xz",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_lowercase().as_str() {
            "7z" | "sevenz" => Some(ArchiveKind::SevenZ),
            "zip" => Some(ArchiveKind::Zip),
            "rar" => Some(ArchiveKind::Rar),
            "tar" => Some(ArchiveKind::Tar),
            "gz" | "gzip" => Some(ArchiveKind::Gzip),
            "bz2" | "bzip2" => Some(ArchiveKind::Bzip2),
            "xz" => Some(ArchiveKind::Xz),
            _ => None,
        }
    }
}

/// Result of a successful classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: ArchiveKind,
    pub is_multi_part: bool,
    /// Part index parsed from the name, for split sets
    pub part_number: Option<u32>,
}

struct StructuralPattern {
    kind: ArchiveKind,
    single: Regex,
    /// Multi-part suffixes; each regex captures the part digits as `num`
    multi: Vec<Regex>,
}

/// Fixed table of name patterns per archive family. Order matters: the
/// compound tar suffixes must win over the bare `.gz`/`.bz2`/`.xz` ones.
static STRUCTURAL: Lazy<Vec<StructuralPattern>> = Lazy::new(|| {
    let re = |s: &str| Regex::new(s).unwrap();
    vec![
        StructuralPattern {
            kind: ArchiveKind::Tar,
            single: re(r"(?i)\.(tar\.gz|tar\.bz2|tar\.xz|tar|tgz|tbz2?|txz)$"),
            multi: vec![re(r"(?i)\.tar\.(?P<num>\d{3,4})$")],
        },
        StructuralPattern {
            kind: ArchiveKind::SevenZ,
            single: re(r"(?i)\.7z$"),
            multi: vec![
                re(r"(?i)\.7z\.(?P<num>\d{1,4})$"),
                re(r"(?i)\.7z\.part(?P<num>\d{1,3})$"),
            ],
        },
        StructuralPattern {
            kind: ArchiveKind::Zip,
            single: re(r"(?i)\.zip$"),
            multi: vec![
                re(r"(?i)\.zip\.(?P<num>\d{1,4})$"),
                // Legacy split sets: archive.z01, archive.z02, ...
                re(r"(?i)\.z(?P<num>\d{2})$"),
            ],
        },
        StructuralPattern {
            kind: ArchiveKind::Rar,
            single: re(r"(?i)\.rar$"),
            multi: vec![
                re(r"(?i)\.part(?P<num>\d{1,3})\.rar$"),
                re(r"(?i)\.rar\.(?P<num>\d{1,4})$"),
                // Legacy continuation volumes: archive.r00, archive.r01, ...
                re(r"(?i)\.r(?P<num>\d{2})$"),
            ],
        },
        StructuralPattern {
            kind: ArchiveKind::Gzip,
            single: re(r"(?i)\.gz$"),
            multi: vec![],
        },
        StructuralPattern {
            kind: ArchiveKind::Bzip2,
            single: re(r"(?i)\.bz2$"),
            multi: vec![],
        },
        StructuralPattern {
            kind: ArchiveKind::Xz,
            single: re(r"(?i)\.xz$"),
            multi: vec![],
        },
    ]
});

/// Suffixes stripped when deriving an output directory name from an
/// archive name: part suffixes first, then the archive extension itself.
static STRIP_SUFFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    let re = |s: &str| Regex::new(s).unwrap();
    vec![
        re(r"(?i)\.(7z|zip|rar|tar)\.\d{1,4}$"),
        re(r"(?i)\.part\d{1,3}(\.rar)?$"),
        re(r"(?i)\.[zr]\d{2}$"),
        re(r"(?i)\.vol\d{1,4}$"),
        re(r"(?i)\.(tar\.gz|tar\.bz2|tar\.xz|7z|zip|rar|tar|tgz|tbz2?|txz|gz|bz2|xz)$"),
        re(r"\.\d{3}$"),
    ]
});

/// Classify by filename alone. Multi-part patterns are tried before the
/// single-file extension so `a.7z.001` parses as part 1 rather than as a
/// name that happens to end in digits.
pub fn classify_name(name: &str) -> Option<Classification> {
    for pattern in STRUCTURAL.iter() {
        for multi in &pattern.multi {
            if let Some(caps) = multi.captures(name) {
                let part = caps
                    .name("num")
                    .and_then(|m| m.as_str().parse::<u32>().ok());
                return Some(Classification {
                    kind: pattern.kind,
                    is_multi_part: true,
                    part_number: part,
                });
            }
        }
        if pattern.single.is_match(name) {
            return Some(Classification {
                kind: pattern.kind,
                is_multi_part: false,
                part_number: None,
            });
        }
    }
    None
}

/// Full classification of a file on disk: structural pattern, then magic
/// bytes, then uncloaking. Never errors; unreadable files are simply not
/// classified.
pub fn classify(path: &Path) -> Option<Classification> {
    let name = path.file_name()?.to_string_lossy();

    if let Some(c) = classify_name(&name) {
        return Some(c);
    }

    if let Some(kind) = sniff(path) {
        debug!("{} classified as {} by signature", path.display(), kind.label());
        return Some(Classification {
            kind,
            is_multi_part: false,
            part_number: None,
        });
    }

    let cleaned = cloak::uncloak_name(&name)?;
    classify_name(&cleaned)
}

/// Strip known archive and part suffixes from a filename, for deriving
/// output directory names. `data.7z.001` and `data.part1.rar` both map to
/// `data`.
pub fn strip_archive_suffixes(name: &str) -> String {
    let mut current = name.to_string();
    loop {
        let mut stripped = false;
        for re in STRIP_SUFFIXES.iter() {
            if let Some(m) = re.find(&current) {
                if m.end() == current.len() && m.start() > 0 {
                    current.truncate(m.start());
                    stripped = true;
                    break;
                }
            }
        }
        if !stripped {
            break;
        }
    }
    current
}

// Magic signatures. Offsets are 0 unless noted.
const SIG_ZIP_LOCAL: &[u8] = b"PK\x03\x04";
const SIG_ZIP_CENTRAL: &[u8] = b"PK\x01\x02";
const SIG_ZIP_EOCD: &[u8] = b"PK\x05\x06";
const SIG_RAR: &[u8] = b"Rar!\x1A\x07";
const SIG_7Z: &[u8] = b"7z\xBC\xAF\x27\x1C";
const SIG_GZIP: &[u8] = b"\x1F\x8B";
const SIG_BZIP2: &[u8] = b"BZh";
const SIG_XZ: &[u8] = b"\xFD7zXZ\x00";
const SIG_PE: &[u8] = b"MZ";

/// Window scanned past a PE header for embedded container signatures.
const SFX_SCAN_WINDOW: usize = 1024 * 1024;

/// Detect archive family by magic bytes.
///
/// Self-extracting executables (PE header) get a bounded scan for embedded
/// container signatures; the most frequently observed family wins. A ZIP
/// verdict additionally requires a central-directory or end-of-central-
/// directory record somewhere in the window, because the 4-byte local
/// header signature alone shows up in too many unrelated binaries.
pub fn sniff(path: &Path) -> Option<ArchiveKind> {
    let mut file = File::open(path).ok()?;
    let mut header = [0u8; 512];
    let read = file.read(&mut header).ok()?;
    let header = &header[..read];

    if header.len() < 4 {
        return None;
    }

    if header.starts_with(SIG_ZIP_LOCAL) || header.starts_with(SIG_ZIP_EOCD) {
        return Some(ArchiveKind::Zip);
    }
    if header.starts_with(SIG_RAR) {
        return Some(ArchiveKind::Rar);
    }
    if header.len() >= 6 && header.starts_with(SIG_7Z) {
        return Some(ArchiveKind::SevenZ);
    }
    if header.starts_with(SIG_GZIP) {
        return Some(ArchiveKind::Gzip);
    }
    if header.starts_with(SIG_BZIP2) {
        return Some(ArchiveKind::Bzip2);
    }
    if header.starts_with(SIG_XZ) {
        return Some(ArchiveKind::Xz);
    }
    // ustar magic sits at offset 257
    if read >= 262 && &header[257..262] == b"ustar" {
        return Some(ArchiveKind::Tar);
    }
    if header.starts_with(SIG_PE) {
        return sniff_sfx(&mut file);
    }

    None
}

/// Scan a PE file for embedded container signatures.
fn sniff_sfx(file: &mut File) -> Option<ArchiveKind> {
    file.seek(SeekFrom::Start(0)).ok()?;
    let mut window = vec![0u8; SFX_SCAN_WINDOW];
    let mut filled = 0;
    while filled < window.len() {
        match file.read(&mut window[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    let window = &window[..filled];

    let zip_local = count_occurrences(window, SIG_ZIP_LOCAL);
    let rar = count_occurrences(window, SIG_RAR);
    let sevenz = count_occurrences(window, SIG_7Z);

    let mut best = None;
    let mut best_count = 0usize;
    for (kind, count) in [
        (ArchiveKind::Zip, zip_local),
        (ArchiveKind::Rar, rar),
        (ArchiveKind::SevenZ, sevenz),
    ] {
        if count > best_count {
            best = Some(kind);
            best_count = count;
        }
    }

    match best {
        Some(ArchiveKind::Zip) => {
            let corroborated = count_occurrences(window, SIG_ZIP_CENTRAL) > 0
                || count_occurrences(window, SIG_ZIP_EOCD) > 0;
            if corroborated {
                Some(ArchiveKind::Zip)
            } else {
                None
            }
        }
        other => other,
    }
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| w == &needle).count()
}
