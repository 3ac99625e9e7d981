//! 7z binary integration for archive extraction.
//!
//! All decompression goes through the external 7z binary. The binary is a
//! black box: it returns an exit code and diagnostic text, and this module
//! classifies that pair into a [`BackendOutcome`] the rest of the crate can
//! pattern-match on. Using one binary for every format (ZIP, RAR, 7z, tar,
//! legacy split sets) gives consistent behavior for mislabeled archives and
//! multi-part sets, where per-format crates diverge.
//!
//! # Commands
//!
//! - List contents: `7z l -slt -p... archive`
//!   - `-slt`: technical listing (key = value blocks, one per entry,
//!     delimited from the header by a dashed separator line)
//! - Extract: `7z x -y -bd -aoa -o{dir} -p... archive`
//!   - `-y`: yes to all prompts
//!   - `-bd`: disable the binary's own progress display
//!   - `-aoa`/`-aos`: overwrite / skip existing files
//!
//! A password argument is *always* passed (`-p` alone means the empty
//! password). Without it, 7z prompts on encrypted archives and the child
//! process hangs forever waiting on a terminal we never gave it.
//!
//! # Supervision
//!
//! Every invocation runs under a watcher thread with a hard wall-clock
//! timeout. On timeout the child gets SIGTERM, then SIGKILL after a grace
//! period. A timeout is reported as [`BackendOutcome::Timeout`], never as a
//! wrong password.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, warn};

/// How long a SIGTERM'd child gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one backend invocation, classified from exit code and
/// diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutcome {
    /// Extraction or listing completed.
    Success,
    /// The archive is encrypted and the supplied password was wrong
    /// (or missing).
    WrongPassword,
    /// CRC/data errors independent of any password.
    Corrupted,
    /// The backend does not recognize the file as an archive.
    Unsupported,
    /// Archive file or backend binary missing.
    NotFound,
    /// Filesystem path problem (too long, invalid characters). Triggers
    /// the sanitized-path fallback.
    PathError,
    /// The invocation exceeded its wall-clock timeout.
    Timeout,
    /// Uncategorized non-zero exit; carries the first diagnostic line.
    Other(String),
}

impl BackendOutcome {
    /// Errors that are independent of the password. Retrying these with a
    /// different password is pointless.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            BackendOutcome::Corrupted | BackendOutcome::Unsupported | BackendOutcome::NotFound
        )
    }
}

/// One entry from a `-slt` technical listing.
#[derive(Debug, Clone, Default)]
pub struct ArchiveEntry {
    /// Path within the archive (as reported, forward slashes on Linux)
    pub path: String,
    /// Uncompressed size in bytes
    pub size: u64,
    /// Compressed size, when the backend reports one
    pub packed_size: Option<u64>,
    /// Whether this entry is a directory
    pub is_dir: bool,
    /// Modification timestamp, verbatim from the listing
    pub modified: Option<String>,
    /// Attribute string (e.g. `D....` for directories)
    pub attributes: Option<String>,
    /// CRC as reported, verbatim
    pub crc: Option<String>,
    /// Compression method
    pub method: Option<String>,
}

/// The seam between orchestration and the decompression tool.
///
/// The production implementation shells out to 7z; tests script outcomes
/// without spawning anything.
pub trait ArchiveBackend {
    /// Extract `archive` into `output_dir`. `password: None` means the
    /// explicit empty password. Extra paths in `specific_files` restrict
    /// extraction to those members.
    fn extract(
        &self,
        archive: &Path,
        output_dir: &Path,
        password: Option<&str>,
        overwrite: bool,
        specific_files: Option<&[String]>,
    ) -> Result<BackendOutcome>;

    /// List archive contents without extracting.
    fn list(&self, archive: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntry>>;

    /// Cheap validity check. `true` means "worth attempting a real
    /// extraction" — an encrypted archive we cannot list yet still counts.
    fn probe(&self, archive: &Path) -> bool;
}

/// Locate the 7z binary.
///
/// Looks next to the executable first (`bin/7zz`, `bin/7z.exe`, sibling
/// `7zz`), then falls back to `7zz`/`7z`/`7za` on PATH.
pub fn find_sevenzip() -> Result<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            for candidate in ["bin/7zz", "bin/7z.exe", "7zz"] {
                let path = exe_dir.join(candidate);
                if path.exists() {
                    return Ok(path);
                }
            }
        }
    }

    for name in ["7zz", "7z", "7za"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    bail!("7z binary not found. Install p7zip or place 7zz in the bin/ directory.")
}

/// Production backend: spawns the 7z binary per invocation.
pub struct SevenZipBackend {
    binary: PathBuf,
    timeout: Duration,
}

/// Raw result of a supervised child process.
struct RawOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
    timed_out: bool,
}

impl SevenZipBackend {
    /// Create a backend, locating the binary automatically.
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            binary: find_sevenzip()?,
            timeout,
        })
    }

    /// Create a backend around a known binary path.
    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Password switch. `-p` alone is the explicit empty password, which
    /// stops 7z from prompting interactively on encrypted input.
    fn password_arg(password: Option<&str>) -> String {
        match password {
            Some(pw) => format!("-p{pw}"),
            None => "-p".to_string(),
        }
    }

    /// Run a 7z command under the watcher thread with the configured
    /// timeout. Never blocks longer than timeout + grace.
    fn run_supervised(&self, mut cmd: Command) -> Result<RawOutput> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))?;
        let pid = child.id();

        let (tx, rx) = bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(wait_for_child(child));
        });

        let mut timed_out = false;
        let waited = match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("7z invocation exceeded {:?}, terminating", self.timeout);
                timed_out = true;
                signal(pid, libc::SIGTERM);
                match rx.recv_timeout(KILL_GRACE) {
                    Ok(result) => result,
                    Err(_) => {
                        signal(pid, libc::SIGKILL);
                        rx.recv().context("7z watcher thread vanished")?
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => bail!("7z watcher thread vanished"),
        };

        let (code, stdout, stderr) = waited?;
        Ok(RawOutput {
            code,
            stdout,
            stderr,
            timed_out,
        })
    }

    fn run_list(&self, archive: &Path, password: Option<&str>) -> Result<RawOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("l")
            .arg("-slt")
            .arg("-scsUTF-8")
            .arg(Self::password_arg(password))
            .arg(archive);
        self.run_supervised(cmd)
    }
}

impl ArchiveBackend for SevenZipBackend {
    fn extract(
        &self,
        archive: &Path,
        output_dir: &Path,
        password: Option<&str>,
        overwrite: bool,
        specific_files: Option<&[String]>,
    ) -> Result<BackendOutcome> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("x")
            .arg("-y")
            .arg("-bd")
            .arg(if overwrite { "-aoa" } else { "-aos" })
            .arg("-scsUTF-8")
            .arg(format!("-o{}", output_dir.display()))
            .arg(Self::password_arg(password))
            .arg(archive);
        if let Some(files) = specific_files {
            for f in files {
                cmd.arg(f);
            }
        }

        let raw = self.run_supervised(cmd)?;
        let outcome = classify_output(raw.code, &raw.stdout, &raw.stderr, raw.timed_out);
        debug!(
            "7z x {} -> {:?} (exit {:?})",
            archive.display(),
            outcome,
            raw.code
        );
        Ok(outcome)
    }

    fn list(&self, archive: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntry>> {
        let raw = self.run_list(archive, password)?;
        match classify_output(raw.code, &raw.stdout, &raw.stderr, raw.timed_out) {
            BackendOutcome::Success => parse_slt_listing(&raw.stdout),
            BackendOutcome::WrongPassword => bail!(
                "Archive {} is encrypted; listing needs a password",
                archive.display()
            ),
            other => bail!("7z list failed for {}: {:?}", archive.display(), other),
        }
    }

    fn probe(&self, archive: &Path) -> bool {
        let raw = match self.run_list(archive, None) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        matches!(
            classify_output(raw.code, &raw.stdout, &raw.stderr, raw.timed_out),
            // Encrypted headers fail the bare listing but the file is
            // still very much an archive.
            BackendOutcome::Success | BackendOutcome::WrongPassword
        )
    }
}

fn wait_for_child(child: Child) -> Result<(Option<i32>, String, String)> {
    let output = child.wait_with_output().context("Failed to wait on 7z")?;
    Ok((
        output.status.code(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

/// Classify `(exit code, diagnostic text)` into a [`BackendOutcome`].
///
/// 7z exposes no structured error codes, so this is case-insensitive
/// substring matching on stderr/stdout. Encrypted-file markers are checked
/// before the generic data-error markers: a wrong password surfaces as
/// "Data Error in encrypted file", which must not be read as corruption.
pub fn classify_output(
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
    timed_out: bool,
) -> BackendOutcome {
    if timed_out {
        return BackendOutcome::Timeout;
    }
    if code == Some(0) {
        return BackendOutcome::Success;
    }

    let text = format!("{}\n{}", stderr, stdout).to_lowercase();

    const WRONG_PASSWORD: &[&str] = &[
        "wrong password",
        "can not open encrypted archive",
        "cannot open encrypted archive",
        "data error in encrypted file",
        "crc failed in encrypted file",
        "enter password",
    ];
    const NOT_FOUND: &[&str] = &[
        "no such file",
        "cannot find archive",
        "the system cannot find",
        "file not found",
    ];
    const PATH_ERROR: &[&str] = &[
        "file name too long",
        "path too long",
        "cannot create folder",
        "cannot open output file",
        "invalid file name",
        "illegal characters",
    ];
    const UNSUPPORTED: &[&str] = &[
        "can not open the file as archive",
        "cannot open the file as archive",
        "unsupported method",
        "unsupported archive",
        "is not archive",
    ];
    const CORRUPTED: &[&str] = &[
        "data error",
        "crc failed",
        "checksum error",
        "headers error",
        "unexpected end of archive",
        "unconfirmed start of archive",
        "corrupt",
    ];

    let matches_any = |markers: &[&str]| markers.iter().any(|m| text.contains(m));

    if matches_any(WRONG_PASSWORD) {
        BackendOutcome::WrongPassword
    } else if matches_any(NOT_FOUND) {
        BackendOutcome::NotFound
    } else if matches_any(PATH_ERROR) {
        BackendOutcome::PathError
    } else if matches_any(UNSUPPORTED) {
        BackendOutcome::Unsupported
    } else if matches_any(CORRUPTED) {
        BackendOutcome::Corrupted
    } else {
        let first_line = stderr
            .lines()
            .chain(stdout.lines())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("unknown error")
            .to_string();
        BackendOutcome::Other(format!("exit {:?}: {}", code, first_line))
    }
}

/// Parse `-slt` technical listing output.
///
/// The listing is a sequence of `Key = Value` blocks separated by blank
/// lines; entry blocks start after a dashed separator line. Output produced
/// with `-ba` has no separator, so blocks are also accepted from the top
/// when no separator is present.
pub fn parse_slt_listing(output: &str) -> Result<Vec<ArchiveEntry>> {
    let has_separator = output
        .lines()
        .any(|l| l.len() >= 4 && l.chars().all(|c| c == '-'));

    let mut entries = Vec::new();
    let mut current: Option<ArchiveEntry> = None;
    let mut in_entries = !has_separator;

    for line in output.lines() {
        let line = line.trim_end();

        if !in_entries {
            if line.len() >= 4 && line.chars().all(|c| c == '-') {
                in_entries = true;
            }
            continue;
        }

        if line.is_empty() {
            if let Some(entry) = current.take() {
                if !entry.path.is_empty() {
                    entries.push(entry);
                }
            }
            continue;
        }

        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        let entry = current.get_or_insert_with(ArchiveEntry::default);
        match key {
            "Path" => entry.path = value.to_string(),
            "Size" => entry.size = value.parse().unwrap_or(0),
            "Packed Size" => entry.packed_size = value.parse().ok(),
            "Folder" => entry.is_dir = value == "+",
            "Modified" => entry.modified = non_empty(value),
            "Attributes" => {
                if value.starts_with('D') {
                    entry.is_dir = true;
                }
                entry.attributes = non_empty(value);
            }
            "CRC" => entry.crc = non_empty(value),
            "Method" => entry.method = non_empty(value),
            _ => {}
        }
    }

    if let Some(entry) = current.take() {
        if !entry.path.is_empty() {
            entries.push(entry);
        }
    }

    Ok(entries)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Scripted in-process backend for exercising the trial and orchestration
/// state machines without spawning anything.
#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::{bail, Result};

    use super::{ArchiveBackend, ArchiveEntry, BackendOutcome};

    /// Behavior of one scripted archive, keyed by file name.
    pub struct Script {
        /// Password required for extraction; `None` means unencrypted
        pub required_password: Option<String>,
        /// Forced outcome, overriding the password check
        pub forced: Option<BackendOutcome>,
        /// Relative paths (and contents) written on successful extraction
        pub produces: Vec<(String, Vec<u8>)>,
    }

    impl Script {
        pub fn plain(produces: &[(&str, &[u8])]) -> Self {
            Self {
                required_password: None,
                forced: None,
                produces: to_owned(produces),
            }
        }

        pub fn encrypted(password: &str, produces: &[(&str, &[u8])]) -> Self {
            Self {
                required_password: Some(password.to_string()),
                forced: None,
                produces: to_owned(produces),
            }
        }

        pub fn failing(outcome: BackendOutcome) -> Self {
            Self {
                required_password: None,
                forced: Some(outcome),
                produces: Vec::new(),
            }
        }
    }

    fn to_owned(produces: &[(&str, &[u8])]) -> Vec<(String, Vec<u8>)> {
        produces
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
            .collect()
    }

    #[derive(Default)]
    pub struct ScriptedBackend {
        scripts: HashMap<String, Script>,
        /// (archive name, password) per extract call, in order
        pub attempts: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(mut self, archive_name: &str, script: Script) -> Self {
            self.scripts.insert(archive_name.to_string(), script);
            self
        }

        pub fn attempt_count(&self, archive_name: &str) -> usize {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == archive_name)
                .count()
        }
    }

    fn name_of(archive: &Path) -> String {
        archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    impl ArchiveBackend for ScriptedBackend {
        fn extract(
            &self,
            archive: &Path,
            output_dir: &Path,
            password: Option<&str>,
            _overwrite: bool,
            _specific_files: Option<&[String]>,
        ) -> Result<BackendOutcome> {
            let name = name_of(archive);
            self.attempts
                .lock()
                .unwrap()
                .push((name.clone(), password.map(String::from)));

            let Some(script) = self.scripts.get(&name) else {
                return Ok(BackendOutcome::Unsupported);
            };
            if let Some(forced) = &script.forced {
                return Ok(forced.clone());
            }
            if let Some(required) = &script.required_password {
                if password != Some(required.as_str()) {
                    return Ok(BackendOutcome::WrongPassword);
                }
            }

            std::fs::create_dir_all(output_dir)?;
            for (rel, bytes) in &script.produces {
                let path = output_dir.join(rel);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, bytes)?;
            }
            Ok(BackendOutcome::Success)
        }

        fn list(&self, archive: &Path, _password: Option<&str>) -> Result<Vec<ArchiveEntry>> {
            let name = name_of(archive);
            let Some(script) = self.scripts.get(&name) else {
                bail!("not an archive: {name}");
            };
            Ok(script
                .produces
                .iter()
                .map(|(rel, bytes)| ArchiveEntry {
                    path: rel.clone(),
                    size: bytes.len() as u64,
                    ..Default::default()
                })
                .collect())
        }

        fn probe(&self, archive: &Path) -> bool {
            self.scripts.contains_key(&name_of(archive))
        }
    }
}
