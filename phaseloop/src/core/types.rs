//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between the engine, the phase executor
//! and status consumers. They do not depend on external state or I/O.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the four work phases applied to every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Study,
    Implement,
    Test,
    Update,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Study, Phase::Implement, Phase::Test, Phase::Update];

    /// Successor within a task. Update wraps around to Study of the next task.
    pub fn next(self) -> Phase {
        match self {
            Phase::Study => Phase::Implement,
            Phase::Implement => Phase::Test,
            Phase::Test => Phase::Update,
            Phase::Update => Phase::Study,
        }
    }

    /// Phase that must have completed for the current task before this one runs.
    pub fn prerequisite(self) -> Option<Phase> {
        match self {
            Phase::Study => None,
            Phase::Implement => Some(Phase::Study),
            Phase::Test => Some(Phase::Implement),
            Phase::Update => Some(Phase::Test),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Study => "study",
            Phase::Implement => "implement",
            Phase::Test => "test",
            Phase::Update => "update",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the engine moves between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run phases back to back without intervention.
    #[default]
    NonStop,
    /// Pause after every phase until an explicit resume or step.
    PhaseByPhase,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::NonStop => "non_stop",
            RunMode::PhaseByPhase => "phase_by_phase",
        }
    }
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "non_stop" | "non-stop" | "nonstop" => Ok(RunMode::NonStop),
            "phase_by_phase" | "phase-by-phase" | "step" => Ok(RunMode::PhaseByPhase),
            other => Err(anyhow!(
                "unknown mode '{other}' (expected non_stop or phase_by_phase)"
            )),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control state of a session, as set by callers and the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Running,
    Paused,
    /// Stop requested; the worker halts at the next phase boundary.
    Stopping,
    Stopped,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HaltReason {
    /// No pending task remained and the minimum cycle count was satisfied.
    PlanExhausted,
    /// The hard cycle ceiling was reached.
    MaxCyclesReached,
    /// A caller requested a stop.
    Stopped,
    /// Session state violated an engine invariant.
    Fatal { message: String },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::PlanExhausted => f.write_str("plan exhausted"),
            HaltReason::MaxCyclesReached => f.write_str("max cycles reached"),
            HaltReason::Stopped => f.write_str("stopped"),
            HaltReason::Fatal { message } => write!(f, "fatal: {message}"),
        }
    }
}

/// Result of the Test phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Pass,
    Fail,
    /// Tests ran but produced no verdict (e.g. a review without a verdict line).
    Inconclusive,
}

/// Decision produced by the Update phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDecision {
    /// Mark the task done in the plan and move to the next task.
    MarkDone,
    /// Tests failed; start the task over from Study.
    RetryTask,
}

/// Phase-specific products handed back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseArtifacts {
    #[default]
    None,
    Study {
        notes: String,
    },
    Implement {
        response: String,
        files_written: Vec<PathBuf>,
    },
    Test {
        outcome: TestOutcome,
        report: String,
    },
    Update {
        decision: UpdateDecision,
    },
}

/// Failure categories of the generation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    Timeout,
    Connection,
    ModelNotFound,
    ServerError,
}

/// Classification of a failed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "kind", rename_all = "snake_case")]
pub enum PhaseErrorKind {
    Generation(GenerationErrorKind),
    TestRunner,
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub kind: PhaseErrorKind,
    pub message: String,
}

/// Everything a phase execution reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub artifacts: PhaseArtifacts,
    pub files_touched: Vec<PathBuf>,
    pub summary: String,
    pub error: Option<PhaseError>,
}

impl PhaseOutcome {
    pub fn success(phase: Phase, artifacts: PhaseArtifacts, summary: impl Into<String>) -> Self {
        Self {
            phase,
            artifacts,
            files_touched: Vec::new(),
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failure(phase: Phase, kind: PhaseErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            phase,
            artifacts: PhaseArtifacts::None,
            files_touched: Vec::new(),
            summary: format!("{phase} failed: {message}"),
            error: Some(PhaseError { kind, message }),
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files_touched = files;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Serializable digest of one phase attempt, carried in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub task: String,
    /// 1-based attempt number of this phase for the task.
    pub attempt: u32,
    pub success: bool,
    pub files_touched: Vec<PathBuf>,
    pub summary: String,
    pub error: Option<PhaseError>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Task-level transitions reported alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started { task: String },
    Completed { task: String },
    /// Tests failed and the task restarts at Study.
    Retrying { task: String, attempt: u32 },
    /// Attempts were exhausted; the task stays pending in the plan but is not
    /// selected again during this session.
    Skipped { task: String, reason: String },
}
