//! burrow - recursive extractor for messy archive drops
//!
//! Digs through nested, split, password-protected, and cloaked archives
//! until nothing extractable is left.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing_subscriber::EnvFilter;

use burrow::backend::{ArchiveBackend, SevenZipBackend};
use burrow::classify::{self, cloak};
use burrow::extract::{ExtractConfig, ExtractEvent, Extractor, StdinPrompt};
use burrow::passwords::{default_store_path, PasswordRegistry};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(version)]
#[command(about = "Recursive extractor for nested, split, and cloaked archive drops")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract an archive, or a whole drop directory, recursively
    Extract {
        /// A single archive file or a directory full of them
        input: PathBuf,

        /// Where extracted content goes
        #[arg(short, long)]
        output: PathBuf,

        /// Password list file (one per line); defaults to the user store
        #[arg(long)]
        password_list: Option<PathBuf>,

        /// Recursion bound for nested archives
        #[arg(long, default_value = "5")]
        max_depth: usize,

        /// Move consumed archives to the trash after extraction
        #[arg(long)]
        cleanup: bool,

        /// Never prompt for passwords; skip what the list cannot open
        #[arg(long)]
        non_interactive: bool,

        /// Per-invocation backend timeout, in seconds
        #[arg(long, default_value = "3600", env = "BURROW_TIMEOUT")]
        timeout: u64,

        /// Overwrite existing files in the output tree
        #[arg(long)]
        overwrite: bool,

        /// Cloak rule store overriding the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// List the contents of an archive
    List {
        archive: PathBuf,

        #[arg(long)]
        password: Option<String>,
    },

    /// Report how files classify (archive type, part number, cloaking)
    Classify {
        paths: Vec<PathBuf>,

        /// Rename cloaked files to their reconstructed clean names
        #[arg(long)]
        rename: bool,

        /// Cloak rule store overriding the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Maintain the known-password store
    Passwords {
        #[command(subcommand)]
        action: PasswordCommands,
    },
}

#[derive(Subcommand)]
enum PasswordCommands {
    /// Add a password to the store
    Add { password: String },

    /// Print every stored password
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(if cli.verbose {
                "burrow=debug".parse()?
            } else {
                "burrow=warn".parse()?
            }))
            .init();
    }

    match cli.command {
        Commands::Extract {
            input,
            output,
            password_list,
            max_depth,
            cleanup,
            non_interactive,
            timeout,
            overwrite,
            rules,
        } => {
            let backend = SevenZipBackend::new(Duration::from_secs(timeout))?;

            let mut passwords = match password_list.or_else(default_store_path) {
                Some(store) => PasswordRegistry::load(store)?,
                None => PasswordRegistry::new(),
            };
            // A drop can carry its own password list.
            let local_list = if input.is_dir() {
                input.join("passwords.txt")
            } else {
                input.with_file_name("passwords.txt")
            };
            if local_list.is_file() {
                passwords.merge_local(&local_list)?;
            }

            println!("burrow - recursive archive extractor");
            println!("Input:  {}", input.display());
            println!("Output: {}", output.display());
            println!("Known passwords: {}\n", passwords.len());

            let mut config = ExtractConfig::new(output);
            config.max_depth = max_depth;
            config.cleanup = cleanup;
            config.interactive = !non_interactive;
            config.timeout = Duration::from_secs(timeout);
            config.overwrite = overwrite;
            config.cloak_rules = rules;

            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")?,
            );
            pb.enable_steady_tick(Duration::from_millis(100));

            let callback = {
                let pb = pb.clone();
                Arc::new(move |event: ExtractEvent| match event {
                    ExtractEvent::ArchiveStarted { archive, depth } => {
                        pb.set_message(format!(
                            "Extracting {} (depth {})",
                            display_name(&archive),
                            depth
                        ));
                    }
                    ExtractEvent::AttemptingPassword {
                        archive,
                        attempt,
                        total,
                    } => {
                        pb.set_message(format!(
                            "Trying password {}/{} on {}",
                            attempt,
                            total,
                            display_name(&archive)
                        ));
                    }
                    ExtractEvent::Extracted { archive, .. } => {
                        pb.println(format!("Extracted {}", display_name(&archive)));
                    }
                    ExtractEvent::ExtractionFailed { archive, reason } => {
                        pb.println(format!(
                            "Could not extract {}: {}",
                            display_name(&archive),
                            reason
                        ));
                    }
                    ExtractEvent::NestedFound { parent, count } => {
                        pb.println(format!(
                            "Found {} nested archive(s) in {}",
                            count,
                            display_name(&parent)
                        ));
                    }
                    ExtractEvent::Uncloaked { from, to } => {
                        pb.println(format!(
                            "Uncloaked {} -> {}",
                            display_name(&from),
                            display_name(&to)
                        ));
                    }
                    // The prompt reads stdin; the spinner must not draw
                    // over it.
                    ExtractEvent::PromptPending { .. } => {
                        pb.set_draw_target(ProgressDrawTarget::hidden());
                    }
                    ExtractEvent::PromptFinished => {
                        pb.set_draw_target(ProgressDrawTarget::stderr());
                    }
                    ExtractEvent::CleanedUp { archive } => {
                        pb.set_message(format!("Trashed {}", display_name(&archive)));
                    }
                })
            };

            let result = {
                let mut extractor = Extractor::new(&backend, config, &mut passwords)?;
                if !non_interactive {
                    extractor.set_prompt(Box::new(StdinPrompt::new()));
                }
                extractor.set_callback(callback);
                if input.is_dir() {
                    extractor.run_drop(&input)?
                } else {
                    extractor.run(&input)?
                }
            };
            pb.finish_and_clear();

            // New passwords the user typed survive into the next run.
            passwords.persist(false)?;

            println!("\n=== Extraction Summary ===");
            println!("Archives extracted: {}", result.extracted_archives.len());
            println!("Files produced:     {}", result.final_files.len());
            if !result.user_provided_passwords.is_empty() {
                println!(
                    "New passwords:      {} (saved)",
                    result.user_provided_passwords.len()
                );
            }
            for note in &result.notes {
                println!("note: {}", note);
            }
            for error in &result.errors {
                println!("error: {}", error);
            }

            if result.success {
                println!("\nExtraction complete!");
            } else if result.errors.is_empty() {
                println!("\nNothing could be extracted.");
                std::process::exit(1);
            } else {
                println!("\nExtraction finished with errors.");
                std::process::exit(1);
            }
        }

        Commands::List { archive, password } => {
            let backend = SevenZipBackend::new(Duration::from_secs(300))?;
            let entries = backend.list(&archive, password.as_deref())?;
            for entry in &entries {
                let marker = if entry.is_dir { "/" } else { "" };
                println!("{:>12}  {}{}", entry.size, entry.path, marker);
            }
            eprintln!("\nTotal: {} entries", entries.len());
        }

        Commands::Classify {
            paths,
            rename,
            rules,
        } => {
            if paths.is_empty() {
                bail!("No paths given");
            }
            let rule_set = cloak::RuleSet::load_or_default(rules.as_deref());

            for path in &paths {
                match classify::classify(path) {
                    Some(c) => {
                        let part = match c.part_number {
                            Some(n) => format!(", part {}", n),
                            None => String::new(),
                        };
                        println!(
                            "{}: {}{}{}",
                            path.display(),
                            c.kind.label(),
                            if c.is_multi_part { " (multi-part)" } else { "" },
                            part
                        );
                    }
                    None => println!("{}: not an archive", path.display()),
                }

                if rename {
                    if let Some(renamed) = cloak::uncloak_rename(path, &rule_set)? {
                        println!("  renamed -> {}", renamed.display());
                    }
                }
            }
        }

        Commands::Passwords { action } => {
            let Some(store) = default_store_path() else {
                bail!("No user config directory available for the password store");
            };
            match action {
                PasswordCommands::Add { password } => {
                    let mut registry = PasswordRegistry::load(store)?;
                    if registry.add(&password) {
                        registry.persist(false)?;
                        println!("Added.");
                    } else {
                        println!("Already stored.");
                    }
                }
                PasswordCommands::List => {
                    let registry = PasswordRegistry::load(store)?;
                    for password in registry.iter() {
                        println!("{}", password);
                    }
                    eprintln!("\nTotal: {} passwords", registry.len());
                }
            }
        }
    }

    Ok(())
}

fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
