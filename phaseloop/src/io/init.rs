//! Project scaffolding: `.phaseloop/` and the plan file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::io::atomic::write_atomic;
use crate::io::config::{LoopConfig, write_config};
use crate::plan::plan_template;

/// Canonical paths of the tool's files for a project root.
#[derive(Debug, Clone)]
pub struct PhaseloopPaths {
    pub root: PathBuf,
    pub tool_dir: PathBuf,
    pub config_path: PathBuf,
    pub status_path: PathBuf,
    pub history_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl PhaseloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let tool_dir = root.join(".phaseloop");
        Self {
            root,
            config_path: tool_dir.join("config.toml"),
            status_path: tool_dir.join("status.json"),
            history_path: tool_dir.join("history.jsonl"),
            gitignore_path: tool_dir.join(".gitignore"),
            tool_dir,
        }
    }

    /// Plan file location for `cfg`; relative plan paths resolve against the root.
    pub fn plan_path(&self, cfg: &LoopConfig) -> PathBuf {
        if cfg.plan_file.is_absolute() {
            cfg.plan_file.clone()
        } else {
            self.root.join(&cfg.plan_file)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite existing config and plan.
    pub force: bool,
    /// First task written into a new plan.
    pub initial_task: Option<String>,
}

/// Create `.phaseloop/` with a default config, and the plan template.
///
/// Fails if `.phaseloop/` already exists unless `options.force` is set. An
/// existing plan file is only replaced with `force`.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<PhaseloopPaths> {
    let paths = PhaseloopPaths::new(root);
    if paths.tool_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to overwrite)",
            paths.tool_dir.display()
        ));
    }
    if paths.tool_dir.exists() && !paths.tool_dir.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.tool_dir.display()
        ));
    }
    fs::create_dir_all(&paths.tool_dir)
        .with_context(|| format!("create directory {}", paths.tool_dir.display()))?;

    let cfg = LoopConfig::default();
    write_config(&paths.config_path, &cfg)?;
    write_atomic(&paths.gitignore_path, TOOL_GITIGNORE)?;

    let plan_path = paths.plan_path(&cfg);
    if !plan_path.exists() || options.force {
        write_atomic(&plan_path, &plan_template(options.initial_task.as_deref()))?;
        info!(path = %plan_path.display(), "plan template written");
    }
    Ok(paths)
}

const TOOL_GITIGNORE: &str = "status.json\nhistory.jsonl\n";
