//! `quill` command line: pipeline lifecycle, credential pool and mutation engine.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;

use quill::core::pool::Slot;
use quill::core::types::{Task, TaskStatus};
use quill::exit_codes;
use quill::io::config::load_config;
use quill::io::layout::{InitOptions, QuillPaths, init_quill};
use quill::io::mutation::{MutationEngine, MutationError};
use quill::logging;
use quill::pipeline::{ControlOutcome, Pipeline, TaskStatusReport};
use quill::pool::PoolManager;

#[derive(Parser)]
#[command(
    name = "quill",
    version,
    about = "Resumable multi-step content pipelines over generative backends"
)]
struct Cli {
    /// Project root containing `.quill/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.quill/` with a default config and an example workflow.
    Init {
        /// Rewrite the config and example workflow.
        #[arg(short, long)]
        force: bool,
    },
    /// Inspect or change the credential pool.
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
    /// Create a queued task from a workflow and print its id.
    Create {
        workflow: String,
        /// Initial request text; `-` reads stdin.
        #[arg(long, conflicts_with = "prompt_file")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_file: Option<PathBuf>,
        /// Existing working directory (default: `.quill/workspaces/<id>`).
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Run the task right away.
        #[arg(long)]
        run: bool,
    },
    /// Run a queued task until it completes, fails or is stopped.
    Run { task_id: String },
    /// Continue a paused, failed or interrupted task from its checkpoint.
    Resume { task_id: String },
    /// Ask a running task to pause at the next step boundary.
    Pause { task_id: String },
    /// Cancel a task (running tasks stop at the next step boundary).
    Cancel { task_id: String },
    /// Show one task, or every task when no id is given.
    Status {
        task_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Apply a saved backend output to a directory and print the report.
    Apply {
        output: PathBuf,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum PoolCommand {
    /// Print the pool with masked credential ids.
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Add a credential, or overwrite a named slot.
    Add {
        /// The secret itself. Prefer `--env` to keep it out of shell history.
        #[arg(conflicts_with = "env", required_unless_present = "env")]
        secret: Option<String>,
        /// Read the secret from this environment variable.
        #[arg(long)]
        env: Option<String>,
        /// primary, secondary or tertiary; appended when omitted.
        #[arg(long)]
        slot: Option<Slot>,
    },
    /// Clear every exhaustion flag.
    Reset,
    /// Move to the next usable credential.
    Rotate,
    /// Print recent rotation events.
    Log {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => {
            let paths = init_quill(root, &InitOptions { force })?;
            println!("initialized {}", paths.quill_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Pool { command } => cmd_pool(root, command),
        Command::Create {
            workflow,
            prompt,
            prompt_file,
            workdir,
            run,
        } => {
            let request = read_request(prompt, prompt_file)?;
            let pipeline = Pipeline::open(root)?;
            let id = pipeline.create_with_workdir(&workflow, &request, workdir)?;
            println!("{id}");
            if run {
                return Ok(finish(&pipeline.run(&id)?));
            }
            Ok(exit_codes::OK)
        }
        Command::Run { task_id } => Ok(finish(&Pipeline::open(root)?.run(&task_id)?)),
        Command::Resume { task_id } => Ok(finish(&Pipeline::open(root)?.resume(&task_id)?)),
        Command::Pause { task_id } => {
            print_control(&task_id, Pipeline::open(root)?.pause(&task_id)?, "pause");
            Ok(exit_codes::OK)
        }
        Command::Cancel { task_id } => {
            print_control(&task_id, Pipeline::open(root)?.cancel(&task_id)?, "cancel");
            Ok(exit_codes::OK)
        }
        Command::Status { task_id, json } => {
            let pipeline = Pipeline::open(root)?;
            let reports = match task_id {
                Some(id) => vec![pipeline.status(&id)?],
                None => pipeline.list()?,
            };
            if json {
                print_json(&reports)?;
            } else {
                for report in &reports {
                    print_report(report);
                }
            }
            Ok(exit_codes::OK)
        }
        Command::Apply { output, dir } => cmd_apply(root, &output, &dir),
    }
}

fn cmd_pool(root: &Path, command: PoolCommand) -> Result<i32> {
    let paths = QuillPaths::new(root);
    let pool = PoolManager::open(&paths)?;
    match command {
        PoolCommand::Show { json } => {
            let snapshot = pool.snapshot();
            if json {
                print_json(&snapshot)?;
                return Ok(exit_codes::OK);
            }
            println!(
                "{} credentials, {} usable, current: {}",
                snapshot.credentials.len(),
                snapshot.usable(),
                snapshot.current.as_deref().unwrap_or("none")
            );
            for credential in &snapshot.credentials {
                let marker = if credential.slot == snapshot.current_index { "*" } else { " " };
                let state = match (&credential.exhausted_reason, credential.exhausted_at) {
                    (Some(reason), Some(at)) => format!("exhausted {} ({reason})", at.to_rfc3339()),
                    _ if credential.exhausted => "exhausted".to_string(),
                    _ => "ok".to_string(),
                };
                println!("{marker} [{}] {}  {state}", credential.slot, credential.masked_id);
            }
        }
        PoolCommand::Add { secret, env, slot } => {
            let secret = match (secret, env) {
                (Some(secret), _) => secret,
                (None, Some(var)) => std::env::var(&var)
                    .with_context(|| format!("read credential from ${var}"))?,
                (None, None) => return Err(anyhow!("pass a secret or --env VAR")),
            };
            let secret = secret.trim();
            if secret.is_empty() {
                return Err(anyhow!("credential must not be empty"));
            }
            println!("{}", pool.add(secret, slot)?.reason);
        }
        PoolCommand::Reset => println!("{}", pool.reset_exhausted()?.reason),
        PoolCommand::Rotate => {
            let event = pool.rotate_manually()?;
            println!(
                "{} -> {}",
                event.from.as_deref().unwrap_or("none"),
                event.to.as_deref().unwrap_or("none")
            );
        }
        PoolCommand::Log { limit } => {
            for event in pool.recent_rotations(limit)? {
                println!(
                    "{}  {} -> {}  {}",
                    event.at.to_rfc3339(),
                    event.from.as_deref().unwrap_or("-"),
                    event.to.as_deref().unwrap_or("-"),
                    event.reason
                );
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_apply(root: &Path, output: &Path, dir: &Path) -> Result<i32> {
    let raw = fs::read_to_string(output).with_context(|| format!("read {}", output.display()))?;
    let paths = QuillPaths::new(root);
    let config = load_config(&paths.config_path)?;
    match MutationEngine::new(config.resolve).apply(dir, &raw) {
        Ok(report) => {
            print_json(&report)?;
            if report.failed.is_empty() {
                Ok(exit_codes::OK)
            } else {
                Ok(exit_codes::FAILED)
            }
        }
        Err(err @ MutationError::UnparseableOutput) => {
            eprintln!("{err}");
            Ok(exit_codes::INVALID)
        }
        Err(err) => Err(err.into()),
    }
}

fn read_request(prompt: Option<String>, prompt_file: Option<PathBuf>) -> Result<String> {
    let request = match (prompt, prompt_file) {
        (Some(text), _) if text == "-" => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read request from stdin")?;
            buf
        }
        (Some(text), _) => text,
        (None, Some(path)) => {
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
        }
        (None, None) => return Err(anyhow!("pass --prompt or --prompt-file")),
    };
    if request.trim().is_empty() {
        return Err(anyhow!("request must not be empty"));
    }
    Ok(request)
}

/// Print the outcome of a run and map it to an exit code.
fn finish(task: &Task) -> i32 {
    println!(
        "task {} {} at step {}/{}",
        task.id,
        task.status,
        task.current_step_index,
        task.total_steps()
    );
    if let Some(err) = &task.last_error {
        println!("last error: {err}");
    }
    match task.status {
        TaskStatus::Completed => exit_codes::OK,
        TaskStatus::Failed => exit_codes::FAILED,
        TaskStatus::Paused | TaskStatus::Cancelled => exit_codes::STOPPED,
        TaskStatus::Queued | TaskStatus::Running => exit_codes::INVALID,
    }
}

fn print_control(task_id: &str, outcome: ControlOutcome, verb: &str) {
    match outcome {
        ControlOutcome::Requested => {
            println!("{verb} requested for {task_id}; honored at the next step boundary");
        }
        ControlOutcome::Applied(status) => println!("task {task_id} {status}"),
    }
}

fn print_report(report: &TaskStatusReport) {
    println!(
        "{}  {}  {}  step {}/{}{}",
        report.id,
        report.workflow,
        report.status,
        report.current_step,
        report.total_steps,
        report
            .current_role
            .as_deref()
            .map(|role| format!(" ({role})"))
            .unwrap_or_default()
    );
    if !report.documents.is_empty() {
        println!("  documents: {}", report.documents.join(", "));
    }
    if let Some(request) = report.pending_request {
        println!("  pending: {request:?}");
    }
    if let Some(err) = &report.last_error {
        println!("  last error: {err}");
    }
    for failure in &report.recent_failures {
        println!("  failed op #{} [{}]: {}", failure.index, failure.kind, failure.error);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}
