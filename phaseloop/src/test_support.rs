//! Deterministic fakes for unit and integration tests.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::status::StatusSnapshot;
use crate::core::types::{
    Phase, PhaseArtifacts, PhaseErrorKind, PhaseOutcome, TestOutcome, UpdateDecision,
};
use crate::io::file_tracker::{ChangeSet, ChangeTracker, Checkpoint};
use crate::io::generation::{Generation, GenerationError, GenerationRequest, Generator};
use crate::io::plan_store::PlanStore;
use crate::io::status_sink::StatusSink;
use crate::phases::{PhaseRequest, PhaseRunner, update_decision};
use crate::plan::Plan;

/// Successful outcome with phase-appropriate artifacts (tests pass).
pub fn ok_outcome(phase: Phase) -> PhaseOutcome {
    let artifacts = match phase {
        Phase::Study => PhaseArtifacts::Study {
            notes: "notes".to_string(),
        },
        Phase::Implement => PhaseArtifacts::Implement {
            response: String::new(),
            files_written: Vec::new(),
        },
        Phase::Test => PhaseArtifacts::Test {
            outcome: TestOutcome::Pass,
            report: "ok".to_string(),
        },
        Phase::Update => PhaseArtifacts::Update {
            decision: UpdateDecision::MarkDone,
        },
    };
    PhaseOutcome::success(phase, artifacts, format!("{phase} ok"))
}

pub fn update_outcome(decision: UpdateDecision) -> PhaseOutcome {
    PhaseOutcome::success(Phase::Update, PhaseArtifacts::Update { decision }, "update")
}

/// Generator replaying a fixed script of responses and recording prompts.
pub struct ScriptedGenerator {
    script: VecDeque<Result<String, GenerationError>>,
    repeat: Option<Result<String, GenerationError>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedGenerator {
    pub fn new(script: impl IntoIterator<Item = Result<String, GenerationError>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            repeat: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Return `response` for every request once the script is exhausted.
    pub fn repeating(mut self, response: Result<String, GenerationError>) -> Self {
        self.repeat = Some(response);
        self
    }

    /// Shared log of every prompt received.
    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&mut self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        let next = match self.script.pop_front() {
            Some(next) => next,
            None => self.repeat.clone().unwrap_or_else(|| {
                Err(GenerationError::Server {
                    status: None,
                    message: "script exhausted".to_string(),
                })
            }),
        };
        next.map(|text| Generation {
            text,
            model: "scripted".to_string(),
        })
    }
}

/// Handles for a phase that blocks until released.
pub struct PhaseGate {
    /// Receives once the gated phase has started.
    pub entered: Receiver<()>,
    /// Send to let the gated phase finish.
    pub release: Sender<()>,
}

struct GateEnds {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Phase runner with scripted failures and test outcomes.
///
/// Unscripted phases succeed. Update decides from the test outcome the same
/// way the real executor does.
#[derive(Default)]
pub struct ScriptedPhases {
    failures: HashMap<Phase, VecDeque<PhaseErrorKind>>,
    always_fail: HashMap<Phase, PhaseErrorKind>,
    test_outcomes: VecDeque<TestOutcome>,
    gates: HashMap<Phase, GateEnds>,
    calls: Arc<Mutex<Vec<(Phase, String)>>>,
    feedback_seen: Arc<Mutex<Vec<Option<String>>>>,
}

impl ScriptedPhases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` attempts of `phase`.
    pub fn fail(mut self, phase: Phase, times: usize, kind: PhaseErrorKind) -> Self {
        self.failures
            .entry(phase)
            .or_default()
            .extend(std::iter::repeat_n(kind, times));
        self
    }

    pub fn always_fail(mut self, phase: Phase, kind: PhaseErrorKind) -> Self {
        self.always_fail.insert(phase, kind);
        self
    }

    /// Outcomes for successive Test phases; `Pass` once exhausted.
    pub fn test_outcomes(mut self, outcomes: impl IntoIterator<Item = TestOutcome>) -> Self {
        self.test_outcomes.extend(outcomes);
        self
    }

    /// Block the next attempt of `phase` until released through the gate.
    pub fn gate(&mut self, phase: Phase) -> PhaseGate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.gates.insert(
            phase,
            GateEnds {
                entered: entered_tx,
                release: release_rx,
            },
        );
        PhaseGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Shared log of `(phase, task)` per attempt.
    pub fn calls(&self) -> Arc<Mutex<Vec<(Phase, String)>>> {
        Arc::clone(&self.calls)
    }

    /// Shared log of the operator feedback each attempt saw.
    pub fn feedback_seen(&self) -> Arc<Mutex<Vec<Option<String>>>> {
        Arc::clone(&self.feedback_seen)
    }
}

impl PhaseRunner for ScriptedPhases {
    fn run(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        let phase = request.phase;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((phase, request.task.to_string()));
        }
        if let Ok(mut seen) = self.feedback_seen.lock() {
            seen.push(request.context.feedback.clone());
        }
        if let Some(gate) = self.gates.remove(&phase) {
            let _ = gate.entered.send(());
            let _ = gate.release.recv_timeout(Duration::from_secs(10));
        }

        if let Some(kind) = self.always_fail.get(&phase) {
            return PhaseOutcome::failure(phase, *kind, "scripted failure");
        }
        if let Some(kind) = self.failures.get_mut(&phase).and_then(VecDeque::pop_front) {
            return PhaseOutcome::failure(phase, kind, "scripted failure");
        }

        match phase {
            Phase::Test => {
                let outcome = self.test_outcomes.pop_front().unwrap_or(TestOutcome::Pass);
                PhaseOutcome::success(
                    phase,
                    PhaseArtifacts::Test {
                        outcome,
                        report: format!("tests {outcome:?}"),
                    },
                    "test",
                )
            }
            Phase::Update => update_outcome(update_decision(request.context.test_outcome)),
            Phase::Study | Phase::Implement => ok_outcome(phase),
        }
    }
}

/// In-memory plan store; clones share the same text.
#[derive(Clone, Default)]
pub struct MemoryPlanStore {
    text: Arc<Mutex<String>>,
    fail_loads: Arc<Mutex<bool>>,
}

impl MemoryPlanStore {
    pub fn new(text: &str) -> Self {
        Self {
            text: Arc::new(Mutex::new(text.to_string())),
            fail_loads: Arc::new(Mutex::new(false)),
        }
    }

    pub fn text(&self) -> String {
        self.text.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn set_fail_loads(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_loads.lock() {
            *flag = fail;
        }
    }
}

impl PlanStore for MemoryPlanStore {
    fn load(&self) -> Result<Plan> {
        if self.fail_loads.lock().map(|f| *f).unwrap_or(false) {
            return Err(anyhow!("plan unavailable"));
        }
        Ok(Plan::parse(&self.text()))
    }

    fn save(&self, plan: &Plan) -> Result<()> {
        let mut text = self.text.lock().map_err(|_| anyhow!("plan lock poisoned"))?;
        *text = plan.render();
        Ok(())
    }
}

/// Sink keeping every snapshot; clones share the log.
#[derive(Clone, Default)]
pub struct RecordingSink {
    snapshots: Arc<Mutex<Vec<StatusSnapshot>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<StatusSnapshot> {
        self.snapshots.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .push(snapshot.clone());
        Ok(())
    }
}

/// Tracker that reports a fixed set of changed files.
#[derive(Debug, Clone, Default)]
pub struct StaticTracker {
    pub changed: BTreeSet<PathBuf>,
}

impl ChangeTracker for StaticTracker {
    fn checkpoint(&self, _root: &Path) -> Result<Checkpoint> {
        Ok(Checkpoint::default())
    }

    fn changes_since(&self, _root: &Path, _since: &Checkpoint) -> Result<ChangeSet> {
        Ok(ChangeSet {
            modified: self.changed.clone(),
            ..ChangeSet::default()
        })
    }
}

/// A temporary project directory with a plan file.
pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    pub fn with_plan(plan: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("@fix_plan.md"), plan).expect("write plan");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root().join("@fix_plan.md")
    }

    pub fn plan_text(&self) -> String {
        fs::read_to_string(self.plan_path()).expect("read plan")
    }

    pub fn write_config(&self, toml: &str) {
        let dir = self.root().join(".phaseloop");
        fs::create_dir_all(&dir).expect("create .phaseloop");
        fs::write(dir.join("config.toml"), toml).expect("write config");
    }
}
