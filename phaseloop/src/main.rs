//! Phase-driven development loop.
//!
//! Works through the checklist in `@fix_plan.md`, one task at a time, running
//! Study, Implement, Test and Update phases against a local model.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phaseloop::core::status::StatusSnapshot;
use phaseloop::core::types::{Control, HaltReason, RunMode};
use phaseloop::engine::LoopHandle;
use phaseloop::exit_codes;
use phaseloop::io::init::{InitOptions, PhaseloopPaths, init_project};
use phaseloop::io::plan_store::PlanStore;
use phaseloop::io::status_sink::read_latest_status;
use phaseloop::launch::{Project, RunOverrides, launch};
use phaseloop::logging;
use phaseloop::plan::TaskStatus;

#[derive(Parser)]
#[command(name = "phaseloop", version, about = "Phase-driven development loop")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` wins.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Project root.
    #[arg(long, global = true, default_value = ".")]
    project_path: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.phaseloop/config.toml` and the plan template.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
        /// First task in a new plan.
        #[arg(long)]
        task: Option<String>,
    },
    /// Run the loop until the plan is exhausted, the cycle ceiling is reached
    /// or it is stopped.
    Run {
        /// What to work on. Seeds the plan when it has no pending task.
        #[arg(short, long)]
        prompt: Option<String>,
        #[arg(long)]
        min_cycles: Option<u32>,
        #[arg(long)]
        max_cycles: Option<u32>,
        /// Model name passed to the generation backend.
        #[arg(long)]
        model: Option<String>,
        /// non_stop or phase_by_phase.
        #[arg(long, value_parser = parse_mode)]
        mode: Option<RunMode>,
    },
    /// Append a task to the plan.
    Add { task: String },
    /// List plan tasks.
    Plan,
    /// Print the last status written by a session.
    Status {
        /// Print the raw JSON snapshot.
        #[arg(long)]
        json: bool,
    },
}

fn parse_mode(raw: &str) -> Result<RunMode, String> {
    raw.parse().map_err(|err: anyhow::Error| err.to_string())
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.project_path.as_path();
    match cli.command {
        Command::Init { force, task } => cmd_init(root, force, task),
        Command::Run {
            prompt,
            min_cycles,
            max_cycles,
            model,
            mode,
        } => cmd_run(
            root,
            RunOverrides {
                prompt,
                min_cycles,
                max_cycles,
                model,
                mode,
            },
        ),
        Command::Add { task } => cmd_add(root, &task),
        Command::Plan => cmd_plan(root),
        Command::Status { json } => cmd_status(root, json),
    }
}

fn cmd_init(root: &Path, force: bool, task: Option<String>) -> Result<i32> {
    let paths = init_project(
        root,
        &InitOptions {
            force,
            initial_task: task,
        },
    )?;
    println!("initialized {}", paths.tool_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, overrides: RunOverrides) -> Result<i32> {
    let handle = launch(root, &overrides, None)?;
    let mode = handle.get_status().mode;
    if mode == RunMode::PhaseByPhase {
        drive_interactive(&handle)?;
    }
    let last = handle.join()?;
    println!("{}", last.headline());
    Ok(exit_code(last.halt.as_ref()))
}

fn cmd_add(root: &Path, task: &str) -> Result<i32> {
    let project = Project::open(root)?;
    project.plan_store().append_task(task)?;
    println!("added: {}", task.trim());
    Ok(exit_codes::OK)
}

fn cmd_plan(root: &Path) -> Result<i32> {
    let project = Project::open(root)?;
    let plan = project.plan_store().load()?;
    for task in plan.tasks() {
        let mark = match task.status {
            TaskStatus::Pending => ' ',
            TaskStatus::Done => 'x',
        };
        println!("[{mark}] {}", task.description);
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, json: bool) -> Result<i32> {
    let paths = PhaseloopPaths::new(root);
    let Some(snapshot) = read_latest_status(&paths.status_path)? else {
        println!("no status recorded yet");
        return Ok(exit_codes::OK);
    };
    if json {
        let text = serde_json::to_string_pretty(&snapshot).context("serialize status")?;
        println!("{text}");
    } else {
        print_snapshot(&snapshot);
    }
    Ok(exit_codes::OK)
}

/// Prompt on stdin at every pause until the session ends.
///
/// enter = next phase, `c` = continue non-stop, `f <text>` = feedback and next
/// phase, `q` = stop. End of input stops the session.
fn drive_interactive(handle: &LoopHandle) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        if handle.is_finished() {
            return Ok(());
        }
        let status = handle.get_status();
        if status.control != Control::Paused {
            handle.wait_for_update(status.seq, Duration::from_millis(250));
            continue;
        }

        print_snapshot(&status);
        print!("[enter] next  [c] continue  [f <text>] feedback  [q] quit > ");
        io::stdout().flush().context("flush stdout")?;
        let Some(line) = lines.next() else {
            handle.stop();
            return Ok(());
        };
        let line = line.context("read stdin")?;
        match parse_reply(&line) {
            Reply::Next(feedback) => {
                handle.step(feedback);
            }
            Reply::Continue => {
                handle.set_mode(RunMode::NonStop);
                handle.resume(None);
            }
            Reply::Quit => {
                handle.stop();
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Next(Option<String>),
    Continue,
    Quit,
}

fn parse_reply(line: &str) -> Reply {
    let line = line.trim();
    match line {
        "c" | "continue" => Reply::Continue,
        "q" | "quit" | "stop" => Reply::Quit,
        _ => match line.strip_prefix("f ") {
            Some(text) if !text.trim().is_empty() => Reply::Next(Some(text.trim().to_string())),
            _ => Reply::Next(None),
        },
    }
}

fn print_snapshot(snapshot: &StatusSnapshot) {
    println!("{}", snapshot.headline());
    if let Some(result) = &snapshot.last_result {
        let verdict = if result.success { "ok" } else { "failed" };
        println!(
            "  last: {} attempt {} {verdict}: {}",
            result.phase, result.attempt, result.summary
        );
        for path in &result.files_touched {
            println!("    {}", path.display());
        }
    }
}

fn exit_code(halt: Option<&HaltReason>) -> i32 {
    match halt {
        Some(HaltReason::PlanExhausted | HaltReason::MaxCyclesReached) => exit_codes::OK,
        Some(HaltReason::Stopped) => exit_codes::STOPPED,
        Some(HaltReason::Fatal { .. }) | None => exit_codes::FATAL,
    }
}
