//! Immutable status snapshots published after every state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{Control, HaltReason, Phase, PhaseReport, RunMode, TaskEvent};

/// Point-in-time view of a session.
///
/// `seq` increases by one per published snapshot; consumers use it to detect
/// missed updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub control: Control,
    pub mode: RunMode,
    /// Phase that runs next for the current task.
    pub phase: Phase,
    pub current_task: Option<String>,
    pub task_attempt: Option<u32>,
    pub cycles_completed: u32,
    pub min_cycles: u32,
    pub max_cycles: u32,
    pub waiting_for_tasks: bool,
    pub tasks_completed: u32,
    pub tasks_skipped: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<PhaseReport>,
    /// The most recent phase attempts, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_results: Vec<PhaseReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_event: Option<TaskEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltReason>,
}

impl StatusSnapshot {
    pub fn is_halted(&self) -> bool {
        self.control == Control::Stopped
    }

    /// One-line human summary used by the CLI and log sinks.
    pub fn headline(&self) -> String {
        let task = self.current_task.as_deref().unwrap_or("-");
        let mut line = format!(
            "#{} [{:?}] cycles {}/{} phase={} task={}",
            self.seq, self.control, self.cycles_completed, self.max_cycles, self.phase, task
        );
        if self.waiting_for_tasks {
            line.push_str(" (waiting for tasks)");
        }
        if let Some(halt) = &self.halt {
            line.push_str(&format!(" halted: {halt}"));
        }
        line
    }
}
