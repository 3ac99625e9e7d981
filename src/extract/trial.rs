//! Password trial state machine.
//!
//! Per archive the sequence is fixed: no password first, then every known
//! password in list order, then (when interactive) the user. The
//! no-password attempt always happens even for archives that look
//! encrypted, because an explicit empty password is also what keeps the
//! backend from hanging on an interactive prompt of its own.
//!
//! Outcomes are variants, not exceptions: the loop's branching is pattern
//! matching on [`TrialOutcome`]. A structural error (corrupted,
//! unsupported, missing) short-circuits the whole loop - the failure is
//! independent of the password, so trying more passwords is pointless. A
//! path-classified error triggers the sanitized-path fallback before the
//! attempt is counted as failed.

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::backend::{ArchiveBackend, BackendOutcome};
use crate::passwords::PasswordRegistry;

use super::{emit, sanitize, EventCallback, ExtractEvent};

/// Terminal state of one archive's trial sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    /// Extraction succeeded. `password: None` means no password was
    /// needed; `user_provided` marks passwords typed at the prompt.
    Extracted {
        password: Option<String>,
        user_provided: bool,
    },
    /// Every password (including the prompt, when wired) was wrong.
    /// An expected outcome, not a system fault.
    ExhaustedPasswords,
    /// A password-independent failure ended the sequence.
    Failed(BackendOutcome),
    /// The user chose to skip this archive.
    Skipped,
}

/// What the user answered at a password prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptReply {
    Password(String),
    Skip,
    /// Skip and stop prompting for the rest of the run
    SkipAll,
}

/// Seam between the trial loop and the terminal.
///
/// The trial engine only ever calls these two methods; swapping in
/// [`NoPrompt`] makes the whole retry machine deterministic under test.
pub trait PromptPort {
    fn ask_password(&mut self, archive_name: &str) -> PromptReply;
    fn confirm_retry(&mut self, archive_name: &str) -> bool;
}

/// Non-interactive port: always skips.
pub struct NoPrompt;

impl PromptPort for NoPrompt {
    fn ask_password(&mut self, _archive_name: &str) -> PromptReply {
        PromptReply::Skip
    }

    fn confirm_retry(&mut self, _archive_name: &str) -> bool {
        false
    }
}

/// Interactive port reading from stdin. EOF or a read error maps to Skip,
/// so a Ctrl-D mid-prompt abandons the archive rather than the run.
pub struct StdinPrompt {
    skip_all: bool,
}

impl StdinPrompt {
    pub fn new() -> Self {
        Self { skip_all: false }
    }
}

impl Default for StdinPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptPort for StdinPrompt {
    fn ask_password(&mut self, archive_name: &str) -> PromptReply {
        if self.skip_all {
            return PromptReply::Skip;
        }

        println!("\nArchive appears to be password protected: {archive_name}");
        print!("Password (empty to skip, '!' to skip all): ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        match io::stdin().lock().read_line(&mut input) {
            Ok(0) | Err(_) => {
                self.skip_all = true;
                PromptReply::Skip
            }
            Ok(_) => {
                let line = input.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    PromptReply::Skip
                } else if line == "!" {
                    self.skip_all = true;
                    PromptReply::SkipAll
                } else {
                    PromptReply::Password(line.to_string())
                }
            }
        }
    }

    fn confirm_retry(&mut self, archive_name: &str) -> bool {
        if self.skip_all {
            return false;
        }
        print!("Wrong password for {archive_name}. Try another? [y/N] ");
        let _ = io::stdout().flush();

        let mut input = String::new();
        match io::stdin().lock().read_line(&mut input) {
            Ok(0) | Err(_) => false,
            Ok(_) => input.trim().eq_ignore_ascii_case("y"),
        }
    }
}

/// Drives the attempt sequence for single archives.
pub struct TrialEngine<'a> {
    backend: &'a dyn ArchiveBackend,
    overwrite: bool,
    interactive: bool,
    callback: Option<&'a EventCallback>,
}

impl<'a> TrialEngine<'a> {
    pub fn new(
        backend: &'a dyn ArchiveBackend,
        overwrite: bool,
        interactive: bool,
        callback: Option<&'a EventCallback>,
    ) -> Self {
        Self {
            backend,
            overwrite,
            interactive,
            callback,
        }
    }

    /// Run the full trial sequence for one archive.
    ///
    /// A password the user typed successfully is appended to `passwords`
    /// so later archives in the same run get it for free.
    pub fn run(
        &self,
        archive: &Path,
        output_dir: &Path,
        passwords: &mut PasswordRegistry,
        prompt: &mut dyn PromptPort,
    ) -> Result<TrialOutcome> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());

        // No password, then known passwords in list order.
        let attempts: Vec<Option<String>> = std::iter::once(None)
            .chain(passwords.iter().map(|p| Some(p.to_string())))
            .collect();
        let total = attempts.len();

        let mut saw_encrypted = false;
        for (index, password) in attempts.iter().enumerate() {
            emit(
                self.callback,
                ExtractEvent::AttemptingPassword {
                    archive: archive.to_path_buf(),
                    attempt: index + 1,
                    total,
                },
            );
            match self.attempt(archive, output_dir, password.as_deref())? {
                BackendOutcome::Success => {
                    return Ok(TrialOutcome::Extracted {
                        password: password.clone(),
                        user_provided: false,
                    });
                }
                BackendOutcome::WrongPassword => {
                    saw_encrypted = true;
                    debug!("Wrong password #{} for {}", index + 1, name);
                }
                outcome => return Ok(TrialOutcome::Failed(outcome)),
            }
        }

        if !self.interactive || !saw_encrypted {
            return Ok(TrialOutcome::ExhaustedPasswords);
        }

        // The archive genuinely wants a password; ask the user. Progress
        // displays are suspended around the prompt via the events.
        loop {
            emit(
                self.callback,
                ExtractEvent::PromptPending {
                    archive: archive.to_path_buf(),
                },
            );
            let reply = prompt.ask_password(&name);
            emit(self.callback, ExtractEvent::PromptFinished);

            let password = match reply {
                PromptReply::Skip | PromptReply::SkipAll => return Ok(TrialOutcome::Skipped),
                PromptReply::Password(password) => password,
            };

            match self.attempt(archive, output_dir, Some(&password))? {
                BackendOutcome::Success => {
                    passwords.add(&password);
                    return Ok(TrialOutcome::Extracted {
                        password: Some(password),
                        user_provided: true,
                    });
                }
                BackendOutcome::WrongPassword => {
                    if !prompt.confirm_retry(&name) {
                        return Ok(TrialOutcome::Skipped);
                    }
                }
                outcome => return Ok(TrialOutcome::Failed(outcome)),
            }
        }
    }

    /// One backend invocation, with the sanitized-path fallback wired in
    /// behind path-classified failures.
    fn attempt(
        &self,
        archive: &Path,
        output_dir: &Path,
        password: Option<&str>,
    ) -> Result<BackendOutcome> {
        let outcome = self
            .backend
            .extract(archive, output_dir, password, self.overwrite, None)?;
        if outcome == BackendOutcome::PathError {
            debug!(
                "Path error extracting {}, retrying via staging",
                archive.display()
            );
            return sanitize::extract_sanitized(
                self.backend,
                archive,
                output_dir,
                password,
                self.overwrite,
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Script, ScriptedBackend};
    use crate::backend::ArchiveEntry;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct ScriptedPrompt {
        replies: Vec<PromptReply>,
        retry: bool,
        prompts: usize,
    }

    impl ScriptedPrompt {
        fn new(replies: Vec<PromptReply>, retry: bool) -> Self {
            Self {
                replies,
                retry,
                prompts: 0,
            }
        }
    }

    impl PromptPort for ScriptedPrompt {
        fn ask_password(&mut self, _archive_name: &str) -> PromptReply {
            self.prompts += 1;
            if self.replies.is_empty() {
                PromptReply::Skip
            } else {
                self.replies.remove(0)
            }
        }

        fn confirm_retry(&mut self, _archive_name: &str) -> bool {
            self.retry
        }
    }

    fn registry_with(passwords: &[&str]) -> PasswordRegistry {
        let mut registry = PasswordRegistry::new();
        for p in passwords {
            registry.add(p);
        }
        registry
    }

    #[test]
    fn unencrypted_archive_needs_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("plain.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend =
            ScriptedBackend::new().script("plain.zip", Script::plain(&[("file.txt", b"hi")]));
        let mut passwords = registry_with(&["unused1", "unused2"]);

        let engine = TrialEngine::new(&backend, false, false, None);
        let outcome = engine
            .run(&archive, dir.path(), &mut passwords, &mut NoPrompt)
            .unwrap();

        assert_eq!(
            outcome,
            TrialOutcome::Extracted {
                password: None,
                user_provided: false
            }
        );
        assert_eq!(backend.attempt_count("plain.zip"), 1);
        assert_eq!(backend.attempts.lock().unwrap()[0].1, None);
    }

    #[test]
    fn wrong_passwords_terminate_after_n_plus_one_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend =
            ScriptedBackend::new().script("locked.zip", Script::encrypted("right", &[]));
        let mut passwords = registry_with(&["wrong1", "wrong2", "wrong3"]);

        let engine = TrialEngine::new(&backend, false, false, None);
        let outcome = engine
            .run(&archive, dir.path(), &mut passwords, &mut NoPrompt)
            .unwrap();

        assert_eq!(outcome, TrialOutcome::ExhaustedPasswords);
        // 3 known passwords + the initial no-password attempt.
        assert_eq!(backend.attempt_count("locked.zip"), 4);
    }

    #[test]
    fn known_password_wins_in_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend = ScriptedBackend::new()
            .script("locked.zip", Script::encrypted("correct", &[("a.txt", b"a")]));
        let mut passwords = registry_with(&["wrong1", "correct", "never-reached"]);

        let engine = TrialEngine::new(&backend, false, false, None);
        let outcome = engine
            .run(&archive, dir.path(), &mut passwords, &mut NoPrompt)
            .unwrap();

        assert_eq!(
            outcome,
            TrialOutcome::Extracted {
                password: Some("correct".to_string()),
                user_provided: false
            }
        );
        // no-password, wrong1, correct - and not never-reached.
        assert_eq!(backend.attempt_count("locked.zip"), 3);
    }

    #[test]
    fn structural_error_short_circuits_password_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend = ScriptedBackend::new()
            .script("broken.zip", Script::failing(BackendOutcome::Corrupted));
        let mut passwords = registry_with(&["a", "b", "c", "d"]);

        let engine = TrialEngine::new(&backend, false, false, None);
        let outcome = engine
            .run(&archive, dir.path(), &mut passwords, &mut NoPrompt)
            .unwrap();

        assert_eq!(outcome, TrialOutcome::Failed(BackendOutcome::Corrupted));
        assert_eq!(backend.attempt_count("broken.zip"), 1);
    }

    #[test]
    fn prompt_password_is_used_and_remembered() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend = ScriptedBackend::new()
            .script("locked.zip", Script::encrypted("sesame", &[("f.txt", b"f")]));
        let mut passwords = registry_with(&["wrong"]);
        let mut prompt =
            ScriptedPrompt::new(vec![PromptReply::Password("sesame".to_string())], false);

        let engine = TrialEngine::new(&backend, false, true, None);
        let outcome = engine
            .run(&archive, dir.path(), &mut passwords, &mut prompt)
            .unwrap();

        assert_eq!(
            outcome,
            TrialOutcome::Extracted {
                password: Some("sesame".to_string()),
                user_provided: true
            }
        );
        // Later archives in the run benefit immediately.
        assert!(passwords.contains("sesame"));
    }

    #[test]
    fn prompt_retry_loop_respects_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend = ScriptedBackend::new()
            .script("locked.zip", Script::encrypted("real", &[("f.txt", b"f")]));
        let mut passwords = PasswordRegistry::new();

        // Retries allowed: second guess lands.
        let mut prompt = ScriptedPrompt::new(
            vec![
                PromptReply::Password("guess1".to_string()),
                PromptReply::Password("real".to_string()),
            ],
            true,
        );
        let engine = TrialEngine::new(&backend, false, true, None);
        let outcome = engine
            .run(&archive, dir.path(), &mut passwords, &mut prompt)
            .unwrap();
        assert!(matches!(outcome, TrialOutcome::Extracted { .. }));
        assert_eq!(prompt.prompts, 2);

        // Retries declined: one wrong guess ends it. Fresh registry, so
        // the password learned above is not in the known list.
        let backend = ScriptedBackend::new().script("locked.zip", Script::encrypted("real", &[]));
        let mut passwords = PasswordRegistry::new();
        let mut prompt =
            ScriptedPrompt::new(vec![PromptReply::Password("guess1".to_string())], false);
        let outcome = TrialEngine::new(&backend, false, true, None)
            .run(&archive, dir.path(), &mut passwords, &mut prompt)
            .unwrap();
        assert_eq!(outcome, TrialOutcome::Skipped);
    }

    #[test]
    fn non_interactive_mode_never_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.zip");
        std::fs::write(&archive, b"x").unwrap();
        let backend = ScriptedBackend::new().script("locked.zip", Script::encrypted("pw", &[]));
        let mut passwords = PasswordRegistry::new();
        let mut prompt = ScriptedPrompt::new(vec![], false);

        let outcome = TrialEngine::new(&backend, false, false, None)
            .run(&archive, dir.path(), &mut passwords, &mut prompt)
            .unwrap();

        assert_eq!(outcome, TrialOutcome::ExhaustedPasswords);
        assert_eq!(prompt.prompts, 0);
    }

    #[test]
    fn unencrypted_failure_skips_prompt_even_when_interactive() {
        // Unsupported means the file is not an archive; prompting for a
        // password would be nonsense.
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("junk.bin");
        std::fs::write(&archive, b"x").unwrap();
        let backend = ScriptedBackend::new();
        let mut passwords = PasswordRegistry::new();
        let mut prompt = ScriptedPrompt::new(vec![], false);

        let outcome = TrialEngine::new(&backend, false, true, None)
            .run(&archive, dir.path(), &mut passwords, &mut prompt)
            .unwrap();

        assert_eq!(outcome, TrialOutcome::Failed(BackendOutcome::Unsupported));
        assert_eq!(prompt.prompts, 0);
    }

    /// Backend whose direct extraction always hits a path error, but whose
    /// staged extraction (different output dir) succeeds.
    struct PathErrorBackend {
        real_output: PathBuf,
        calls: Mutex<usize>,
    }

    impl ArchiveBackend for PathErrorBackend {
        fn extract(
            &self,
            _archive: &Path,
            output_dir: &Path,
            _password: Option<&str>,
            _overwrite: bool,
            _specific_files: Option<&[String]>,
        ) -> Result<BackendOutcome> {
            *self.calls.lock().unwrap() += 1;
            if output_dir == self.real_output {
                return Ok(BackendOutcome::PathError);
            }
            std::fs::create_dir_all(output_dir)?;
            std::fs::write(output_dir.join("rescued?.txt"), b"ok")?;
            Ok(BackendOutcome::Success)
        }

        fn list(&self, _archive: &Path, _password: Option<&str>) -> Result<Vec<ArchiveEntry>> {
            Ok(Vec::new())
        }

        fn probe(&self, _archive: &Path) -> bool {
            true
        }
    }

    #[test]
    fn path_error_recovers_via_sanitized_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let archive = dir.path().join("deep.zip");
        std::fs::write(&archive, b"x").unwrap();

        let backend = PathErrorBackend {
            real_output: out.clone(),
            calls: Mutex::new(0),
        };
        let mut passwords = PasswordRegistry::new();

        let outcome = TrialEngine::new(&backend, false, false, None)
            .run(&archive, &out, &mut passwords, &mut NoPrompt)
            .unwrap();

        assert!(matches!(outcome, TrialOutcome::Extracted { .. }));
        // Direct attempt + staged attempt.
        assert_eq!(*backend.calls.lock().unwrap(), 2);
        // The staged file landed in the real output, sanitized.
        let names: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("rescued"));
        assert!(!names[0].contains('?'));
    }
}
