//! The loop session state machine.
//!
//! `LoopSession` holds every piece of mutable loop state: the active task, the
//! phase about to run, cycle accounting, run mode and control state. All
//! transitions are pure; the engine owns blocking and I/O and calls into this
//! type while holding its mutex.

use chrono::{DateTime, Utc};

use crate::core::budget::{CycleBudget, IdleDecision};
use crate::core::status::StatusSnapshot;
use crate::core::types::{
    Control, HaltReason, Phase, PhaseArtifacts, PhaseOutcome, PhaseReport, RunMode, TaskEvent,
    UpdateDecision,
};
use crate::plan::Plan;

/// Immutable session parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub budget: CycleBudget,
    pub mode: RunMode,
    /// Attempts of a single phase before the task is skipped.
    pub max_phase_attempts: u32,
    /// Full Study..Update passes with failing tests before the task is skipped.
    pub max_task_attempts: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            budget: CycleBudget {
                min_cycles: 4,
                max_cycles: 40,
            },
            mode: RunMode::NonStop,
            max_phase_attempts: 3,
            max_task_attempts: 3,
        }
    }
}

/// The task the session is currently working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTask {
    pub description: String,
    /// Failed attempts of the current phase.
    pub phase_failures: u32,
    /// 1-based pass over the task (incremented when tests fail).
    pub task_attempt: u32,
    /// Phases completed during the current pass, in order.
    pub completed_phases: Vec<Phase>,
}

impl ActiveTask {
    fn new(description: String) -> Self {
        Self {
            description,
            phase_failures: 0,
            task_attempt: 1,
            completed_phases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseOrigin {
    Manual,
    PhaseBoundary,
}

/// Result of looking for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A task is already active.
    Active,
    /// A new task was selected.
    Started(String),
    /// Nothing to do yet; the minimum cycle count is not met.
    Wait,
    /// The session halted.
    Halted(HaltReason),
}

/// A phase the engine is cleared to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTicket {
    pub phase: Phase,
    pub task: String,
    /// 1-based attempt number of this phase.
    pub attempt: u32,
    pub task_attempt: u32,
    /// Operator feedback supplied with the last resume, consumed by this phase.
    pub feedback: Option<String>,
}

/// How the session moved after recording a phase outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Moved on to the next phase of the same task.
    Advanced(Phase),
    /// The phase failed and will be attempted again.
    RetryPhase { attempt: u32 },
    TaskCompleted(String),
    TaskRetry { task: String, attempt: u32 },
    TaskSkipped { task: String, reason: String },
}

impl Transition {
    pub fn task_event(&self) -> Option<TaskEvent> {
        match self {
            Transition::Advanced(_) | Transition::RetryPhase { .. } => None,
            Transition::TaskCompleted(task) => Some(TaskEvent::Completed { task: task.clone() }),
            Transition::TaskRetry { task, attempt } => Some(TaskEvent::Retrying {
                task: task.clone(),
                attempt: *attempt,
            }),
            Transition::TaskSkipped { task, reason } => Some(TaskEvent::Skipped {
                task: task.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session is not running (control={0:?})")]
    NotRunning(Control),
    #[error("no active task")]
    NoActiveTask,
    #[error("{phase} cannot run before {prerequisite} for task '{task}'")]
    OutOfOrder {
        phase: Phase,
        prerequisite: Phase,
        task: String,
    },
    #[error("outcome for {got} does not match current phase {expected}")]
    PhaseMismatch { expected: Phase, got: Phase },
    #[error("cycle ceiling {0} already reached")]
    CeilingReached(u32),
    #[error("invariant violations: {}", .0.join("; "))]
    Invariants(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSession {
    pub current_task: Option<ActiveTask>,
    /// Phase that runs next (or is running).
    pub phase: Phase,
    pub cycles_completed: u32,
    pub mode: RunMode,
    pub control: Control,
    pub budget: CycleBudget,
    pub max_phase_attempts: u32,
    pub max_task_attempts: u32,
    pub completed_tasks: Vec<String>,
    pub skipped_tasks: Vec<String>,
    pub waiting_for_tasks: bool,
    pub halt: Option<HaltReason>,
    pub feedback: Option<String>,
    pause_origin: Option<PauseOrigin>,
    /// A step was requested; the next phase to begin claims it.
    step_requested: bool,
    /// The running phase is a step and pauses the session when it finishes.
    stepping: bool,
}

impl LoopSession {
    pub fn new(settings: LoopSettings) -> Self {
        Self {
            current_task: None,
            phase: Phase::Study,
            cycles_completed: 0,
            mode: settings.mode,
            control: Control::Running,
            budget: settings.budget,
            max_phase_attempts: settings.max_phase_attempts.max(1),
            max_task_attempts: settings.max_task_attempts.max(1),
            completed_tasks: Vec::new(),
            skipped_tasks: Vec::new(),
            waiting_for_tasks: false,
            halt: None,
            feedback: None,
            pause_origin: None,
            step_requested: false,
            stepping: false,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.control == Control::Stopped
    }

    pub fn is_skipped(&self, description: &str) -> bool {
        self.skipped_tasks.iter().any(|t| t == description)
    }

    pub fn current_task_description(&self) -> Option<&str> {
        self.current_task.as_ref().map(|t| t.description.as_str())
    }

    /// End the session. The first recorded reason wins.
    pub fn halt(&mut self, reason: HaltReason) {
        if self.halt.is_none() {
            self.halt = Some(reason);
        }
        self.control = Control::Stopped;
        self.waiting_for_tasks = false;
        self.step_requested = false;
        self.stepping = false;
        self.pause_origin = None;
    }

    /// Halt if the cycle ceiling has been reached. Returns true when halted.
    pub fn enforce_ceiling(&mut self) -> bool {
        if self.budget.ceiling_reached(self.cycles_completed) {
            self.halt(HaltReason::MaxCyclesReached);
            return true;
        }
        false
    }

    /// Pick the next pending task from `plan` if none is active.
    pub fn select_task(&mut self, plan: &Plan) -> Selection {
        if self.current_task.is_some() {
            return Selection::Active;
        }
        if self.enforce_ceiling() {
            return Selection::Halted(HaltReason::MaxCyclesReached);
        }
        match plan.first_pending(|d| self.is_skipped(d)) {
            Some(task) => {
                self.current_task = Some(ActiveTask::new(task.description.clone()));
                self.phase = Phase::Study;
                self.waiting_for_tasks = false;
                Selection::Started(task.description)
            }
            None => match self.budget.on_empty_plan(self.cycles_completed) {
                IdleDecision::Exhausted => {
                    self.halt(HaltReason::PlanExhausted);
                    Selection::Halted(HaltReason::PlanExhausted)
                }
                IdleDecision::WaitForTasks => {
                    self.waiting_for_tasks = true;
                    Selection::Wait
                }
            },
        }
    }

    /// Clear the engine to run the current phase.
    pub fn begin_phase(&mut self) -> Result<PhaseTicket, SessionError> {
        if self.control != Control::Running {
            return Err(SessionError::NotRunning(self.control));
        }
        if self.budget.ceiling_reached(self.cycles_completed) {
            return Err(SessionError::CeilingReached(self.budget.max_cycles));
        }
        let phase = self.phase;
        let task = self
            .current_task
            .as_ref()
            .ok_or(SessionError::NoActiveTask)?;
        if let Some(prerequisite) = phase.prerequisite() {
            if !task.completed_phases.contains(&prerequisite) {
                return Err(SessionError::OutOfOrder {
                    phase,
                    prerequisite,
                    task: task.description.clone(),
                });
            }
        }
        let ticket = PhaseTicket {
            phase,
            task: task.description.clone(),
            attempt: task.phase_failures + 1,
            task_attempt: task.task_attempt,
            feedback: self.feedback.take(),
        };
        self.stepping = std::mem::take(&mut self.step_requested);
        Ok(ticket)
    }

    /// Record a phase outcome: count the cycle and advance the state machine.
    pub fn record(&mut self, outcome: &PhaseOutcome) -> Result<Transition, SessionError> {
        if outcome.phase != self.phase {
            return Err(SessionError::PhaseMismatch {
                expected: self.phase,
                got: outcome.phase,
            });
        }
        let max_phase_attempts = self.max_phase_attempts;
        let max_task_attempts = self.max_task_attempts;
        let task = self
            .current_task
            .as_mut()
            .ok_or(SessionError::NoActiveTask)?;
        self.cycles_completed += 1;

        if !outcome.is_success() {
            task.phase_failures += 1;
            if task.phase_failures >= max_phase_attempts {
                let reason = format!(
                    "{} failed {} time(s)",
                    outcome.phase, task.phase_failures
                );
                return Ok(self.skip_current(reason));
            }
            return Ok(Transition::RetryPhase {
                attempt: task.phase_failures + 1,
            });
        }

        task.phase_failures = 0;
        task.completed_phases.push(outcome.phase);
        if outcome.phase != Phase::Update {
            self.phase = outcome.phase.next();
            return Ok(Transition::Advanced(self.phase));
        }

        let decision = match &outcome.artifacts {
            PhaseArtifacts::Update { decision } => *decision,
            _ => UpdateDecision::MarkDone,
        };
        match decision {
            UpdateDecision::MarkDone => {
                let description = task.description.clone();
                self.completed_tasks.push(description.clone());
                self.current_task = None;
                self.phase = Phase::Study;
                Ok(Transition::TaskCompleted(description))
            }
            UpdateDecision::RetryTask if task.task_attempt >= max_task_attempts => {
                let reason = format!("tests failed after {} attempt(s)", task.task_attempt);
                Ok(self.skip_current(reason))
            }
            UpdateDecision::RetryTask => {
                task.task_attempt += 1;
                task.completed_phases.clear();
                self.phase = Phase::Study;
                Ok(Transition::TaskRetry {
                    task: task.description.clone(),
                    attempt: task.task_attempt,
                })
            }
        }
    }

    fn skip_current(&mut self, reason: String) -> Transition {
        let description = self
            .current_task
            .take()
            .map(|t| t.description)
            .unwrap_or_default();
        self.skipped_tasks.push(description.clone());
        self.phase = Phase::Study;
        Transition::TaskSkipped {
            task: description,
            reason,
        }
    }

    /// Apply phase-boundary rules after an outcome was recorded: the cycle
    /// ceiling, pending stop requests and phase-by-phase pausing.
    pub fn finish_phase(&mut self) -> Option<HaltReason> {
        if self.enforce_ceiling() {
            return self.halt.clone();
        }
        match self.control {
            Control::Stopping => {
                self.halt(HaltReason::Stopped);
                return self.halt.clone();
            }
            Control::Running if self.mode == RunMode::PhaseByPhase || self.stepping => {
                self.control = Control::Paused;
                self.pause_origin = Some(PauseOrigin::PhaseBoundary);
            }
            _ => {}
        }
        self.stepping = false;
        None
    }

    pub fn pause(&mut self) -> bool {
        if self.control != Control::Running {
            return false;
        }
        self.control = Control::Paused;
        self.pause_origin = Some(PauseOrigin::Manual);
        true
    }

    /// Resume from a pause. `feedback` is handed to the next phase.
    pub fn resume(&mut self, feedback: Option<String>) -> bool {
        if self.control != Control::Paused {
            return false;
        }
        self.control = Control::Running;
        self.pause_origin = None;
        self.step_requested = false;
        if let Some(text) = feedback.filter(|t| !t.trim().is_empty()) {
            self.feedback = Some(text);
        }
        true
    }

    /// Run exactly one more phase, then pause.
    ///
    /// A phase already in flight does not count: the step is claimed by the
    /// next phase to begin.
    pub fn step(&mut self, feedback: Option<String>) -> bool {
        match self.control {
            Control::Paused => {
                self.resume(feedback);
                self.step_requested = true;
                true
            }
            Control::Running => {
                self.step_requested = true;
                true
            }
            Control::Stopping | Control::Stopped => false,
        }
    }

    /// Request a stop. Irreversible.
    pub fn stop(&mut self) -> bool {
        match self.control {
            Control::Stopping | Control::Stopped => false,
            Control::Running | Control::Paused => {
                self.control = Control::Stopping;
                self.step_requested = false;
                true
            }
        }
    }

    /// Change the run mode; takes effect at the next phase boundary.
    ///
    /// Switching to non-stop releases an automatic phase-boundary pause but
    /// leaves a manual pause in place.
    pub fn set_mode(&mut self, mode: RunMode) -> bool {
        if matches!(self.control, Control::Stopping | Control::Stopped) {
            return false;
        }
        self.mode = mode;
        if mode == RunMode::NonStop
            && self.control == Control::Paused
            && self.pause_origin == Some(PauseOrigin::PhaseBoundary)
        {
            self.control = Control::Running;
            self.pause_origin = None;
            self.step_requested = false;
        }
        true
    }

    /// Project the session into an immutable snapshot.
    pub fn snapshot(
        &self,
        seq: u64,
        timestamp: DateTime<Utc>,
        last_result: Option<PhaseReport>,
        task_event: Option<TaskEvent>,
    ) -> StatusSnapshot {
        StatusSnapshot {
            seq,
            timestamp,
            control: self.control,
            mode: self.mode,
            phase: self.phase,
            current_task: self.current_task.as_ref().map(|t| t.description.clone()),
            task_attempt: self.current_task.as_ref().map(|t| t.task_attempt),
            cycles_completed: self.cycles_completed,
            min_cycles: self.budget.min_cycles,
            max_cycles: self.budget.max_cycles,
            waiting_for_tasks: self.waiting_for_tasks,
            tasks_completed: self.completed_tasks.len() as u32,
            tasks_skipped: self.skipped_tasks.len() as u32,
            last_result,
            recent_results: Vec::new(),
            task_event,
            halt: self.halt.clone(),
        }
    }
}
