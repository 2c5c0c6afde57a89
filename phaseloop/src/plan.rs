//! Checklist plan model.
//!
//! A plan is the raw text of the plan file split into lines. Lines of the form
//! `- [ ] description` / `- [x] description` are tasks; everything else is kept
//! verbatim so that serializing an unmodified plan reproduces the input byte for
//! byte.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(\S.*?)\s*$").expect("task line regex should be valid")
});

/// Completion state recorded in the plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
}

/// A task extracted from the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Zero-based position among the plan's tasks.
    pub index: usize,
    pub description: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PlanLine {
    /// A checklist line. `raw` includes the line terminator; `mark` is the byte
    /// offset of the status character inside `raw`.
    Task {
        raw: String,
        mark: usize,
        description: String,
    },
    Other(String),
}

impl PlanLine {
    fn raw(&self) -> &str {
        match self {
            PlanLine::Task { raw, .. } => raw,
            PlanLine::Other(raw) => raw,
        }
    }
}

/// Ordered plan contents. Insertion order is priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    lines: Vec<PlanLine>,
}

impl Plan {
    /// Parse plan text. Never fails: unrecognized lines are preserved as-is.
    pub fn parse(text: &str) -> Self {
        let lines = text.split_inclusive('\n').map(parse_line).collect();
        Self { lines }
    }

    /// Render the plan back to text.
    pub fn render(&self) -> String {
        self.lines.iter().map(PlanLine::raw).collect()
    }

    /// All tasks in plan order.
    pub fn tasks(&self) -> Vec<Task> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                PlanLine::Task {
                    raw,
                    mark,
                    description,
                } => Some((raw, *mark, description)),
                PlanLine::Other(_) => None,
            })
            .enumerate()
            .map(|(index, (raw, mark, description))| Task {
                index,
                description: description.clone(),
                status: status_at(raw, mark),
            })
            .collect()
    }

    /// First pending task whose description is not rejected by `skip`.
    pub fn first_pending<F: Fn(&str) -> bool>(&self, skip: F) -> Option<Task> {
        self.tasks()
            .into_iter()
            .find(|task| task.is_pending() && !skip(&task.description))
    }

    pub fn pending_count(&self) -> usize {
        self.tasks().iter().filter(|task| task.is_pending()).count()
    }

    /// Append a pending task directly after the last task line, or at the end of
    /// the plan when it has no tasks yet.
    pub fn append_task(&mut self, description: &str) {
        let description = description.trim();
        let insert_at = self
            .lines
            .iter()
            .rposition(|line| matches!(line, PlanLine::Task { .. }))
            .map(|pos| pos + 1)
            .unwrap_or(self.lines.len());

        if insert_at > 0 {
            if let Some(prev) = self.lines.get_mut(insert_at - 1) {
                ensure_terminated(prev);
            }
        }

        let raw = format!("- [ ] {description}\n");
        let line = parse_line(&raw);
        self.lines.insert(insert_at, line);
    }

    /// Mark the first pending task with `description` as done.
    ///
    /// Returns false if no pending task matches.
    pub fn mark_done(&mut self, description: &str) -> bool {
        for line in &mut self.lines {
            if let PlanLine::Task {
                raw,
                mark,
                description: existing,
            } = line
            {
                if existing == description && status_at(raw, *mark) == TaskStatus::Pending {
                    raw.replace_range(*mark..*mark + 1, "x");
                    return true;
                }
            }
        }
        false
    }
}

fn parse_line(raw: &str) -> PlanLine {
    let body = raw.trim_end_matches(['\n', '\r']);
    match TASK_RE.captures(body) {
        Some(caps) => {
            let mark = caps.get(1).map(|m| m.start()).unwrap_or_default();
            let description = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            PlanLine::Task {
                raw: raw.to_string(),
                mark,
                description,
            }
        }
        None => PlanLine::Other(raw.to_string()),
    }
}

fn status_at(raw: &str, mark: usize) -> TaskStatus {
    match raw.as_bytes().get(mark) {
        Some(b'x') | Some(b'X') => TaskStatus::Done,
        _ => TaskStatus::Pending,
    }
}

fn ensure_terminated(line: &mut PlanLine) {
    match line {
        PlanLine::Task { raw, .. } | PlanLine::Other(raw) => {
            if !raw.ends_with('\n') {
                raw.push('\n');
            }
        }
    }
}

/// Plan file template written by `phaseloop init` and for new projects.
pub fn plan_template(initial_task: Option<&str>) -> String {
    let mut buf = String::new();
    buf.push_str("# Fix Plan - Prioritized Task List\n\n");
    buf.push_str("> Tasks are marked with `[ ]` for incomplete and `[x]` for complete.\n");
    buf.push_str("> The loop always works on the first incomplete task.\n\n");
    buf.push_str("## High Priority\n\n");
    if let Some(task) = initial_task.map(str::trim).filter(|t| !t.is_empty()) {
        buf.push_str(&format!("- [ ] {task}\n"));
    }
    buf.push_str("\n## Medium Priority\n\n");
    buf.push_str("## Low Priority\n");
    buf
}
