//! Assembling a session from a project directory.
//!
//! Shared by the `phaseloop run` command and the web UI: load config, apply
//! command-line overrides, seed the plan from the operator prompt, build the
//! production adapters and start the engine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::core::types::RunMode;
use crate::engine::{self, EngineOptions, LoopHandle};
use crate::io::atomic::write_atomic;
use crate::io::config::{LoopConfig, load_config};
use crate::io::file_tracker::SnapshotTracker;
use crate::io::generation::generator_from_config;
use crate::io::init::PhaseloopPaths;
use crate::io::plan_store::{FilePlanStore, PlanStore};
use crate::io::status_sink::{FanOut, JsonlSink, LatestStatusFile, StatusSink, TracingSink};
use crate::io::test_runner::{CommandTestRunner, TestRunner};
use crate::phases::PhaseExecutor;
use crate::plan::plan_template;

/// Per-run values that take precedence over `.phaseloop/config.toml`.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Operator prompt: seeds the plan and is shown to every phase.
    pub prompt: Option<String>,
    pub min_cycles: Option<u32>,
    pub max_cycles: Option<u32>,
    pub model: Option<String>,
    pub mode: Option<RunMode>,
}

/// A resolved project: paths plus the effective config.
#[derive(Debug, Clone)]
pub struct Project {
    pub paths: PhaseloopPaths,
    pub config: LoopConfig,
    pub plan_path: PathBuf,
}

impl Project {
    /// Load the project's config (defaults when absent).
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(anyhow!("project path {} is not a directory", root.display()));
        }
        let paths = PhaseloopPaths::new(root);
        let config = load_config(&paths.config_path)?;
        let plan_path = paths.plan_path(&config);
        Ok(Self {
            paths,
            config,
            plan_path,
        })
    }

    /// Apply overrides and re-validate.
    pub fn apply(&mut self, overrides: &RunOverrides) -> Result<()> {
        if let Some(min) = overrides.min_cycles {
            self.config.min_cycles = min;
        }
        if let Some(max) = overrides.max_cycles {
            self.config.max_cycles = max;
        }
        if let Some(model) = overrides.model.as_deref().filter(|m| !m.trim().is_empty()) {
            self.config.generation.model = model.to_string();
        }
        if let Some(mode) = overrides.mode {
            self.config.mode = mode;
        }
        self.config.validate().context("invalid run settings")
    }

    pub fn plan_store(&self) -> FilePlanStore {
        FilePlanStore::new(&self.plan_path)
    }

    /// Engine options from the effective config.
    pub fn engine_options(&self, goal: Option<String>) -> Result<EngineOptions> {
        Ok(EngineOptions {
            settings: self.config.settings()?,
            retry_delay: self.config.retry_delay(),
            idle_poll: self.config.idle_poll(),
            goal,
        })
    }

    /// Files generated code must never overwrite: the plan and `.phaseloop/`.
    pub fn protected_paths(&self) -> Vec<PathBuf> {
        vec![self.plan_path.clone(), self.paths.tool_dir.clone()]
    }

    /// Status sinks every session writes: tracing plus the `.phaseloop/` files.
    pub fn default_sinks(&self) -> FanOut {
        FanOut::new()
            .with(TracingSink)
            .with(JsonlSink::new(&self.paths.history_path))
            .with(LatestStatusFile::new(&self.paths.status_path))
    }
}

/// Make sure the prompt has a task to work on.
///
/// - no plan file: write the template with `prompt` as the first task;
/// - plan without pending tasks: append `prompt`;
/// - otherwise the plan is left alone.
///
/// Without a prompt the plan must already exist.
#[instrument(skip_all, fields(path = %store.path().display()))]
pub fn seed_plan(store: &FilePlanStore, prompt: Option<&str>) -> Result<()> {
    let prompt = prompt.map(str::trim).filter(|p| !p.is_empty());
    let path = store.path();
    if !path.exists() {
        let Some(prompt) = prompt else {
            return Err(anyhow!(
                "plan file {} not found (run `phaseloop init` or pass --prompt)",
                path.display()
            ));
        };
        write_atomic(path, &plan_template(Some(prompt)))?;
        info!(task = prompt, "plan created from prompt");
        return Ok(());
    }
    let Some(prompt) = prompt else {
        return Ok(());
    };
    let plan = store.load()?;
    if plan.pending_count() == 0 {
        store.append_task(prompt)?;
        info!(task = prompt, "no pending tasks; prompt appended to plan");
    } else {
        debug!(pending = plan.pending_count(), "plan has pending tasks; prompt used as goal");
    }
    Ok(())
}

/// Start a session for the project at `root` with production adapters.
///
/// `extra_sink` receives every snapshot after the default sinks.
pub fn launch(
    root: &Path,
    overrides: &RunOverrides,
    extra_sink: Option<Box<dyn StatusSink + Send>>,
) -> Result<LoopHandle> {
    let mut project = Project::open(root)?;
    project.apply(overrides)?;
    let store = project.plan_store();
    seed_plan(&store, overrides.prompt.as_deref())?;

    let generation = &project.config.generation;
    let root = project.paths.root.clone();
    let generator = generator_from_config(generation, root.clone())?;
    let test_runner = CommandTestRunner::from_config(&project.config.test, root.clone())
        .map(|runner| Box::new(runner) as Box<dyn TestRunner + Send>);
    info!(
        backend = ?generation.backend,
        model = %generation.model,
        tests = test_runner.is_some(),
        "adapters ready"
    );
    let executor = PhaseExecutor::new(root, generator, SnapshotTracker)
        .with_test_runner(test_runner)
        .with_protected_paths(project.protected_paths());

    let mut sinks = project.default_sinks();
    if let Some(extra) = extra_sink {
        sinks = sinks.with(extra);
    }
    let options = project.engine_options(overrides.prompt.clone())?;
    engine::start(store, executor, Box::new(sinks), options)
}
