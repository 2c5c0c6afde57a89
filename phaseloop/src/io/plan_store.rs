//! Plan file persistence.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::io::atomic::write_atomic;
use crate::plan::Plan;

/// Source of truth for the task list.
///
/// `mark_done` and `append_task` are read-modify-write helpers on top of
/// `load`/`save`; implementations with a cheaper path may override them.
pub trait PlanStore {
    fn load(&self) -> Result<Plan>;
    fn save(&self, plan: &Plan) -> Result<()>;

    /// Mark the first pending task with `description` done and persist.
    fn mark_done(&self, description: &str) -> Result<()> {
        let mut plan = self.load()?;
        if !plan.mark_done(description) {
            return Err(anyhow!("no pending task '{description}' in plan"));
        }
        self.save(&plan)
    }

    fn append_task(&self, description: &str) -> Result<()> {
        if description.trim().is_empty() {
            return Err(anyhow!("task description must not be empty"));
        }
        let mut plan = self.load()?;
        plan.append_task(description);
        self.save(&plan)
    }
}

/// Plan stored in a markdown file on disk.
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    path: PathBuf,
}

impl FilePlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PlanStore for FilePlanStore {
    fn load(&self) -> Result<Plan> {
        load_plan(&self.path)
    }

    fn save(&self, plan: &Plan) -> Result<()> {
        save_plan(&self.path, plan)
    }
}

#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_plan(path: &Path) -> Result<Plan> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let plan = Plan::parse(&text);
    debug!(pending = plan.pending_count(), "plan loaded");
    Ok(plan)
}

#[instrument(skip_all, fields(path = %path.display()))]
pub fn save_plan(path: &Path, plan: &Plan) -> Result<()> {
    write_atomic(path, &plan.render()).with_context(|| format!("save plan {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "# Fix Plan\n\n## High Priority\n- [ ] parse input\n- [x] scaffold\n\nnotes stay here\n";

    #[test]
    fn save_of_load_is_byte_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("@fix_plan.md");
        fs::write(&path, PLAN).expect("seed");
        let store = FilePlanStore::new(&path);
        let plan = store.load().expect("load");
        store.save(&plan).expect("save");
        assert_eq!(fs::read_to_string(&path).expect("read"), PLAN);
    }

    #[test]
    fn mark_done_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("@fix_plan.md");
        fs::write(&path, PLAN).expect("seed");
        let store = FilePlanStore::new(&path);
        store.mark_done("parse input").expect("mark");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("- [x] parse input\n"));
        assert!(store.mark_done("parse input").is_err());
    }

    #[test]
    fn append_persists_after_last_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("@fix_plan.md");
        fs::write(&path, PLAN).expect("seed");
        let store = FilePlanStore::new(&path);
        store.append_task("write docs").expect("append");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("- [x] scaffold\n- [ ] write docs\n\nnotes stay here\n"));
        assert!(store.append_task("   ").is_err());
    }

    #[test]
    fn missing_plan_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FilePlanStore::new(temp.path().join("absent.md"));
        assert!(store.load().is_err());
    }
}
