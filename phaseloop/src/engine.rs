//! The loop engine: one worker thread driving phases, plus a handle exposing
//! the control surface to other threads.
//!
//! All session state lives in a single `Mutex<EngineState>`. The lock is never
//! held while a phase, the plan store or a status sink runs, so control calls
//! and `get_status` return promptly even during a long generation request.
//!
//! Two condition variables hang off the same mutex:
//! - `wake` wakes the worker (resume, step, stop, mode change, plan change);
//! - `published` wakes observers waiting for a newer snapshot.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::invariants::validate_session;
use crate::core::session::{
    LoopSession, LoopSettings, PhaseTicket, Selection, SessionError, Transition,
};
use crate::core::status::StatusSnapshot;
use crate::core::types::{
    Control, HaltReason, Phase, PhaseArtifacts, PhaseErrorKind, PhaseOutcome, PhaseReport,
    RunMode, TaskEvent, UpdateDecision,
};
use crate::io::plan_store::PlanStore;
use crate::io::status_sink::StatusSink;
use crate::phases::{PhaseContext, PhaseRequest, PhaseRunner};
use crate::plan::Plan;

/// Phase reports kept for `StatusSnapshot::recent_results`.
pub const RECENT_RESULTS: usize = 10;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub settings: LoopSettings,
    /// Base delay before re-attempting a failed phase; grows linearly with the
    /// number of failures.
    pub retry_delay: Duration,
    /// Re-read interval while waiting for tasks below the minimum cycle count.
    pub idle_poll: Duration,
    /// Operator prompt passed to every phase.
    pub goal: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            settings: LoopSettings::default(),
            retry_delay: Duration::from_secs(2),
            idle_poll: Duration::from_secs(2),
            goal: None,
        }
    }
}

struct EngineState {
    session: LoopSession,
    seq: u64,
    latest: StatusSnapshot,
    last_result: Option<PhaseReport>,
    recent: VecDeque<PhaseReport>,
    plan_changed: bool,
    finished: bool,
}

impl EngineState {
    fn project(&self, seq: u64, event: Option<TaskEvent>) -> StatusSnapshot {
        let mut snapshot = self
            .session
            .snapshot(seq, Utc::now(), self.last_result.clone(), event);
        snapshot.recent_results = self.recent.iter().cloned().collect();
        snapshot
    }

    fn remember(&mut self, report: PhaseReport) {
        if self.recent.len() == RECENT_RESULTS {
            self.recent.pop_front();
        }
        self.recent.push_back(report.clone());
        self.last_result = Some(report);
    }
}

struct Shared {
    state: Mutex<EngineState>,
    wake: Condvar,
    published: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Control handle for a running session.
pub struct LoopHandle {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

/// Start a session on a dedicated worker thread.
///
/// Fails without starting anything if the settings are invalid or the plan
/// cannot be loaded.
#[instrument(
    skip_all,
    fields(
        mode = %options.settings.mode,
        min = options.settings.budget.min_cycles,
        max = options.settings.budget.max_cycles
    )
)]
pub fn start<S, R>(
    store: S,
    runner: R,
    sink: Box<dyn StatusSink + Send>,
    options: EngineOptions,
) -> Result<LoopHandle>
where
    S: PlanStore + Send + 'static,
    R: PhaseRunner + Send + 'static,
{
    options.settings.budget.validate()?;
    let plan = store.load().context("load plan")?;
    info!(pending = plan.pending_count(), "starting session");

    let session = LoopSession::new(options.settings);
    let latest = session.snapshot(0, Utc::now(), None, None);
    let shared = Arc::new(Shared {
        state: Mutex::new(EngineState {
            session,
            seq: 0,
            latest,
            last_result: None,
            recent: VecDeque::with_capacity(RECENT_RESULTS),
            plan_changed: false,
            finished: false,
        }),
        wake: Condvar::new(),
        published: Condvar::new(),
    });

    let worker = Worker {
        shared: Arc::clone(&shared),
        store,
        runner,
        sink,
        plan,
        context: PhaseContext::with_goal(options.goal),
        retry_delay: options.retry_delay,
        idle_poll: options.idle_poll,
        was_waiting: false,
    };
    let join = thread::Builder::new()
        .name("phaseloop-worker".to_string())
        .spawn(move || worker.run())
        .context("spawn worker thread")?;

    Ok(LoopHandle {
        shared,
        worker: Some(join),
    })
}

impl LoopHandle {
    /// Current session state. Never waits for a running phase.
    ///
    /// `seq` is that of the last published snapshot; control changes made since
    /// are already reflected.
    pub fn get_status(&self) -> StatusSnapshot {
        let state = self.shared.lock();
        if state.finished {
            return state.latest.clone();
        }
        state.project(state.seq, state.latest.task_event.clone())
    }

    /// Pause at the next phase boundary. A running phase completes first.
    pub fn pause(&self) -> bool {
        self.control("pause", |s| s.pause())
    }

    /// Resume a paused session; `feedback` is injected into the next phase.
    pub fn resume(&self, feedback: Option<String>) -> bool {
        self.control("resume", |s| s.resume(feedback))
    }

    /// Run exactly one phase, then pause.
    pub fn step(&self, feedback: Option<String>) -> bool {
        self.control("step", |s| s.step(feedback))
    }

    /// Stop at the next phase boundary. Irreversible.
    pub fn stop(&self) -> bool {
        self.control("stop", LoopSession::stop)
    }

    /// Switch modes; takes effect at the next phase boundary.
    pub fn set_mode(&self, mode: RunMode) -> bool {
        self.control("set_mode", |s| s.set_mode(mode))
    }

    /// Tell an idle worker the plan may have new tasks.
    pub fn notify_plan_changed(&self) {
        let mut state = self.shared.lock();
        state.plan_changed = true;
        self.shared.wake.notify_all();
    }

    /// Block until a snapshot newer than `after_seq` is published, the session
    /// ends, or `timeout` elapses. Returns the latest snapshot if it is newer.
    pub fn wait_for_update(&self, after_seq: u64, timeout: Duration) -> Option<StatusSnapshot> {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .published
            .wait_timeout_while(state, timeout, |s| s.seq <= after_seq && !s.finished)
            .unwrap_or_else(PoisonError::into_inner);
        (state.seq > after_seq).then(|| state.latest.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// Wait for the worker to exit and return the final snapshot.
    pub fn join(mut self) -> Result<StatusSnapshot> {
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| anyhow!("worker thread panicked"))?;
        }
        Ok(self.shared.lock().latest.clone())
    }

    fn control(&self, op: &str, apply: impl FnOnce(&mut LoopSession) -> bool) -> bool {
        let mut state = self.shared.lock();
        let changed = apply(&mut state.session);
        debug!(op, changed, control = ?state.session.control, "control request");
        if changed {
            self.shared.wake.notify_all();
        }
        changed
    }
}

struct Worker<S, R> {
    shared: Arc<Shared>,
    store: S,
    runner: R,
    sink: Box<dyn StatusSink + Send>,
    plan: Plan,
    context: PhaseContext,
    retry_delay: Duration,
    idle_poll: Duration,
    was_waiting: bool,
}

/// Marks the session finished when the worker exits, even by panic.
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if !state.session.is_halted() {
            state.session.halt(HaltReason::Fatal {
                message: "worker exited unexpectedly".to_string(),
            });
            state.seq += 1;
            let seq = state.seq;
            state.latest = state.project(seq, None);
        }
        state.finished = true;
        self.0.published.notify_all();
        self.0.wake.notify_all();
    }
}

impl<S: PlanStore, R: PhaseRunner> Worker<S, R> {
    fn run(mut self) {
        let _guard = FinishGuard(Arc::clone(&self.shared));
        self.publish(None, None);
        while self.drive().is_continue() {}
        let halt = self.shared.lock().session.halt.clone();
        info!(?halt, "session ended");
    }

    /// One drive step: gate on control, find work, run one phase.
    fn drive(&mut self) -> ControlFlow<()> {
        self.gate()?;

        match self.store.load() {
            Ok(plan) => self.plan = plan,
            Err(err) => warn!(err = %format!("{err:#}"), "plan reload failed; keeping last plan"),
        }

        let selection = self.shared.lock().session.select_task(&self.plan);
        match selection {
            Selection::Halted(reason) => {
                info!(%reason, "halting");
                self.publish(None, None);
                return ControlFlow::Break(());
            }
            Selection::Wait => {
                if !self.was_waiting {
                    info!("plan exhausted below minimum cycles; waiting for tasks");
                    self.was_waiting = true;
                    self.publish(None, None);
                }
                self.idle_wait();
                return ControlFlow::Continue(());
            }
            Selection::Started(task) => {
                info!(%task, "task started");
                self.was_waiting = false;
                self.context.start_task();
                self.publish(None, Some(TaskEvent::Started { task }));
            }
            Selection::Active => {}
        }

        let ticket = {
            let mut state = self.shared.lock();
            match state.session.begin_phase() {
                Ok(ticket) => ticket,
                // Paused or stopped since selection; the gate handles it.
                Err(SessionError::NotRunning(_)) => {
                    return ControlFlow::Continue(());
                }
                Err(err) => {
                    error!(err = %err, "cannot begin phase");
                    state.session.halt(HaltReason::Fatal {
                        message: err.to_string(),
                    });
                    drop(state);
                    self.publish(None, None);
                    return ControlFlow::Break(());
                }
            }
        };

        self.execute(ticket)
    }

    /// Block while paused; finish on stop or at the ceiling.
    fn gate(&mut self) -> ControlFlow<()> {
        let mut state = self.shared.lock();
        loop {
            match state.session.control {
                Control::Running => break,
                Control::Paused => {
                    debug!("paused; waiting");
                    state = self
                        .shared
                        .wake
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Control::Stopping => {
                    state.session.halt(HaltReason::Stopped);
                    drop(state);
                    info!("stop requested; halting");
                    self.publish(None, None);
                    return ControlFlow::Break(());
                }
                Control::Stopped => return ControlFlow::Break(()),
            }
        }
        if state.session.enforce_ceiling() {
            drop(state);
            self.publish(None, None);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    fn idle_wait(&self) {
        let mut state = self.shared.lock();
        if !state.plan_changed {
            state = self
                .shared
                .wake
                .wait_timeout_while(state, self.idle_poll, |s| {
                    s.session.control == Control::Running && !s.plan_changed
                })
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        state.plan_changed = false;
    }

    #[instrument(
        skip_all,
        fields(phase = %ticket.phase, task = %ticket.task, attempt = ticket.attempt)
    )]
    fn execute(&mut self, ticket: PhaseTicket) -> ControlFlow<()> {
        if ticket.feedback.is_some() {
            self.context.feedback = ticket.feedback.clone();
        }
        let started = Instant::now();
        let started_at = Utc::now();
        let mut outcome = self.runner.run(&PhaseRequest {
            phase: ticket.phase,
            task: &ticket.task,
            attempt: ticket.attempt,
            task_attempt: ticket.task_attempt,
            context: &self.context,
        });
        self.context.feedback = None;

        if outcome.phase != ticket.phase {
            warn!(got = %outcome.phase, "runner reported a different phase");
        }
        let marks_done = matches!(
            outcome.artifacts,
            PhaseArtifacts::Update {
                decision: UpdateDecision::MarkDone
            }
        );
        if outcome.is_success() && ticket.phase == Phase::Update && marks_done {
            if let Err(err) = self.store.mark_done(&ticket.task) {
                warn!(err = %format!("{err:#}"), "marking task done failed");
                outcome = PhaseOutcome::failure(
                    Phase::Update,
                    PhaseErrorKind::Io,
                    format!("mark task done: {err:#}"),
                )
                .with_files(outcome.files_touched);
            }
        }
        self.context.absorb(&outcome);

        let report = PhaseReport {
            phase: ticket.phase,
            task: ticket.task.clone(),
            attempt: ticket.attempt,
            success: outcome.is_success(),
            files_touched: outcome.files_touched.clone(),
            summary: outcome.summary.clone(),
            error: outcome.error.clone(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if report.success {
            info!(duration_ms = report.duration_ms, "{}", report.summary);
        } else {
            warn!(duration_ms = report.duration_ms, "{}", report.summary);
        }

        let (transition, halted) = {
            let mut state = self.shared.lock();
            let transition = match state.session.record(&outcome) {
                Ok(transition) => Some(transition),
                Err(err) => {
                    error!(err = %err, "cannot record outcome");
                    state.session.halt(HaltReason::Fatal {
                        message: err.to_string(),
                    });
                    None
                }
            };
            let violations = validate_session(&state.session);
            if !violations.is_empty() {
                error!(?violations, "session invariants violated");
                state.session.halt(HaltReason::Fatal {
                    message: violations.join("; "),
                });
            } else if !state.session.is_halted() {
                state.session.finish_phase();
            }
            (transition, state.session.is_halted())
        };

        let event = transition.as_ref().and_then(Transition::task_event);
        match &transition {
            Some(Transition::TaskCompleted(_)) | Some(Transition::TaskSkipped { .. }) => {
                self.context.start_task();
            }
            Some(Transition::TaskRetry { .. }) => self.context.restart_task(),
            _ => {}
        }
        if let Some(TaskEvent::Skipped { task, reason }) = &event {
            warn!(%task, %reason, "task skipped");
        }
        self.publish(Some(report), event);

        if halted {
            return ControlFlow::Break(());
        }
        if let Some(Transition::RetryPhase { attempt }) = transition {
            self.retry_pause(attempt.saturating_sub(1));
        }
        ControlFlow::Continue(())
    }

    /// Linear backoff between phase attempts; cut short by any control change.
    fn retry_pause(&self, failures: u32) {
        let delay = self.retry_delay * failures;
        if delay.is_zero() {
            return;
        }
        debug!(delay_ms = delay.as_millis() as u64, "waiting before retry");
        let state = self.shared.lock();
        let _ = self
            .shared
            .wake
            .wait_timeout_while(state, delay, |s| s.session.control == Control::Running);
    }

    fn publish(&mut self, last_result: Option<PhaseReport>, event: Option<TaskEvent>) {
        let snapshot = {
            let mut state = self.shared.lock();
            state.seq += 1;
            if let Some(report) = last_result {
                state.remember(report);
            }
            let snapshot = state.project(state.seq, event);
            state.latest = snapshot.clone();
            self.shared.published.notify_all();
            snapshot
        };
        if let Err(err) = self.sink.publish(&snapshot) {
            warn!(seq = snapshot.seq, err = %format!("{err:#}"), "status sink failed");
        }
    }
}
