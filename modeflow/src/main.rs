//! Command-line entry point for modeflow.
//!
//! Every command prints pretty JSON on stdout and exits with one of the
//! codes in [`modeflow::exit_codes`]. Diagnostics go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};

use modeflow::apply::{ApplyRequest, PipelineState, run_safe_apply};
use modeflow::compile::{PolicySources, compile_mode, simulate_document, validate_document};
use modeflow::core::patch::parse_patch_stats;
use modeflow::core::safety::validate_patch_safety;
use modeflow::core::types::ValidationError;
use modeflow::exit_codes;
use modeflow::io::command::ProcessCommandRunner;
use modeflow::io::config::{Config, config_path, load_config, write_config};
use modeflow::io::git::GitPatchApplier;
use modeflow::io::mode::{ModeCatalog, check_workspace_root, load_mode_document};
use modeflow::io::prompt::load_task;
use modeflow::logging;

#[derive(Parser)]
#[command(
    name = "modeflow",
    version,
    about = "Compile declarative agent flows and apply patches safely"
)]
struct Cli {
    /// Workspace root: config, backups, and patch targets live here.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a mode file's flow and print its dependency levels.
    Validate {
        /// Mode file (.json or .toml).
        mode: PathBuf,
    },
    /// Print which steps could run together and what blocks the rest.
    Simulate {
        /// Mode file (.json or .toml).
        mode: PathBuf,
    },
    /// Compile a mode into jobs with resolved runtime policy and prompts.
    Jobs {
        /// Mode file, or a mode name when `--catalog` is given.
        mode: String,
        /// Task file substituted into prompts as `{{task}}`.
        #[arg(long)]
        task: Option<PathBuf>,
        /// Mode catalog directory (with optional pack.toml).
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// List the modes in a catalog directory with their descriptions.
    Modes {
        /// Mode catalog directory (with optional pack.toml).
        catalog: PathBuf,
    },
    /// Report diff statistics and safety violations without applying.
    CheckPatch {
        /// Unified diff file.
        patch: PathBuf,
    },
    /// Back up, apply, verify, and roll back on failure.
    Apply {
        /// Unified diff file.
        patch: PathBuf,
        /// Verification command, run in order after apply. Repeatable.
        #[arg(long = "verify", value_name = "CMD")]
        verify: Vec<String>,
        /// Only check that the patch applies.
        #[arg(long)]
        dry_run: bool,
        /// Run identifier; generated when omitted.
        #[arg(long)]
        run_id: Option<String>,
        /// Per-command timeout; defaults to the configured value.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Create `.modeflow/config.toml` with default settings.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Validate { mode } => cmd_validate(&mode),
        Command::Simulate { mode } => cmd_simulate(&mode),
        Command::Jobs {
            mode,
            task,
            catalog,
        } => cmd_jobs(&cli.root, &mode, task.as_deref(), catalog.as_deref()),
        Command::Modes { catalog } => cmd_modes(&catalog),
        Command::CheckPatch { patch } => cmd_check_patch(&cli.root, &patch),
        Command::Apply {
            patch,
            verify,
            dry_run,
            run_id,
            timeout_secs,
        } => cmd_apply(&cli.root, &patch, verify, dry_run, run_id, timeout_secs),
        Command::Init { force } => cmd_init(&cli.root, force),
    }
}

fn cmd_validate(mode: &Path) -> Result<i32> {
    let document = match load_mode_document(mode) {
        Ok(document) => document,
        Err(err) => return print_errors(vec![err]),
    };
    let report = validate_document(&document);
    print_json(&report)?;
    Ok(if report.ok {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_simulate(mode: &Path) -> Result<i32> {
    let document = match load_mode_document(mode) {
        Ok(document) => document,
        Err(err) => return print_errors(vec![err]),
    };
    match simulate_document(&document) {
        Ok(report) => {
            print_json(&report)?;
            Ok(if report.ok {
                exit_codes::OK
            } else {
                exit_codes::INVALID
            })
        }
        Err(errors) => print_errors(errors),
    }
}

fn cmd_jobs(root: &Path, mode: &str, task: Option<&Path>, catalog: Option<&Path>) -> Result<i32> {
    let config = load_config(&config_path(root))?;
    let task = match task {
        Some(path) => load_task(path)?,
        None => Value::Null,
    };

    let catalog = match catalog.map(ModeCatalog::open).transpose() {
        Ok(catalog) => catalog,
        Err(err) => return print_errors(vec![err]),
    };
    let loaded = match &catalog {
        Some(catalog) => catalog.load(mode),
        None => load_mode_document(Path::new(mode)),
    };
    let document = match loaded {
        Ok(document) => document,
        Err(err) => return print_errors(vec![err]),
    };

    let sources = PolicySources {
        pack: catalog.as_ref().and_then(ModeCatalog::runtime_policy),
        defaults: config.runtime_policy.as_ref(),
    };
    match compile_mode(&document, &sources, &task) {
        Ok(compiled) => {
            print_json(&compiled)?;
            Ok(exit_codes::OK)
        }
        Err(errors) => print_errors(errors),
    }
}

fn cmd_modes(catalog: &Path) -> Result<i32> {
    let listing = match ModeCatalog::open(catalog).and_then(|catalog| catalog.list()) {
        Ok(listing) => listing,
        Err(err) => return print_errors(vec![err]),
    };
    print_json(&listing)?;
    Ok(if listing.modes.iter().all(|mode| mode.errors.is_empty()) {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn cmd_check_patch(root: &Path, patch: &Path) -> Result<i32> {
    let config = load_config(&config_path(root))?;
    let diff = read_patch(patch)?;
    let stats = parse_patch_stats(&diff);
    let safety = validate_patch_safety(&diff, root, &config.policy.safety_options());
    print_json(&json!({ "stats": stats, "safety": safety }))?;
    Ok(if !safety.safe {
        exit_codes::UNSAFE
    } else if !stats.valid {
        exit_codes::INVALID
    } else {
        exit_codes::OK
    })
}

fn cmd_apply(
    root: &Path,
    patch: &Path,
    verify: Vec<String>,
    dry_run: bool,
    run_id: Option<String>,
    timeout_secs: Option<u64>,
) -> Result<i32> {
    let root = match check_workspace_root(root) {
        Ok(root) => root,
        Err(err) => return print_errors(vec![err]),
    };
    let config = load_config(&config_path(&root))?;
    let policy = config.policy.clone().with_workspace_root(&root);
    let request = ApplyRequest {
        patch: read_patch(patch)?,
        commands: verify,
        run_id,
        dry_run,
        timeout: Duration::from_secs(timeout_secs.unwrap_or(config.pipeline.command_timeout_secs)),
    };
    let runner = ProcessCommandRunner {
        output_limit_bytes: config.pipeline.output_limit_bytes,
    };

    match run_safe_apply(&policy, &config.pipeline, &request, &GitPatchApplier, &runner) {
        Ok(result) => {
            print_json(&result)?;
            Ok(match result.state {
                PipelineState::Done => exit_codes::OK,
                PipelineState::Blocked => exit_codes::UNSAFE,
                PipelineState::Failed | PipelineState::RolledBack => exit_codes::FAILED,
            })
        }
        Err(err) => {
            print_json(&json!({ "error": err.code(), "message": err.to_string() }))?;
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let root = match check_workspace_root(root) {
        Ok(root) => root,
        Err(err) => return print_errors(vec![err]),
    };
    let path = config_path(&root);
    let written = force || !path.exists();
    if written {
        write_config(&path, &Config::default())?;
    }
    print_json(&json!({ "config": path, "written": written }))?;
    Ok(exit_codes::OK)
}

fn read_patch(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read patch {}", path.display()))
}

fn print_errors(errors: Vec<ValidationError>) -> Result<i32> {
    print_json(&json!({ "ok": false, "errors": errors }))?;
    Ok(exit_codes::INVALID)
}

/// Print `value` as pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
