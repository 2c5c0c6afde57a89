//! Phase execution: what each of Study, Implement, Test and Update does.
//!
//! The engine calls a `PhaseRunner` once per phase attempt, outside its lock.
//! Runners never return `Err`: every failure becomes a failed `PhaseOutcome`
//! that the engine records and retries.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::code_blocks::{parse_code_blocks, safe_relative_path};
use crate::core::types::{
    Phase, PhaseArtifacts, PhaseErrorKind, PhaseOutcome, TestOutcome, UpdateDecision,
};
use crate::io::file_tracker::{ChangeTracker, Checkpoint, project_layout};
use crate::io::generation::{GenerationError, GenerationRequest, Generator};
use crate::io::prompt::{PromptBuilder, PromptInputs, PromptKind};
use crate::io::test_runner::TestRunner;

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*#>_-]*VERDICT[\s*_]*:[\s*_]*(PASS|FAIL)\b")
        .expect("verdict regex should be valid")
});

const LAYOUT_LIMIT: usize = 200;

/// What earlier phases of the current task produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseContext {
    /// Operator prompt for the whole session.
    pub goal: Option<String>,
    pub study_notes: Option<String>,
    pub implementation: Option<String>,
    pub files_written: Vec<PathBuf>,
    pub test_outcome: Option<TestOutcome>,
    pub test_report: Option<String>,
    /// Why the previous attempt (of the phase or the whole task) failed.
    pub previous_failure: Option<String>,
    /// Operator feedback for the next phase only.
    pub feedback: Option<String>,
}

impl PhaseContext {
    pub fn with_goal(goal: Option<String>) -> Self {
        Self {
            goal: goal.filter(|g| !g.trim().is_empty()),
            ..Self::default()
        }
    }

    /// Forget everything about the previous task.
    pub fn start_task(&mut self) {
        *self = Self::with_goal(self.goal.take());
    }

    /// Tests failed: start the task over, keeping the failure report.
    pub fn restart_task(&mut self) {
        let failure = self.test_report.take();
        self.start_task();
        self.previous_failure = failure;
    }

    pub fn absorb(&mut self, outcome: &PhaseOutcome) {
        match &outcome.artifacts {
            PhaseArtifacts::Study { notes } => self.study_notes = Some(notes.clone()),
            PhaseArtifacts::Implement {
                response,
                files_written,
            } => {
                self.implementation = Some(response.clone());
                self.files_written = files_written.clone();
            }
            PhaseArtifacts::Test { outcome, report } => {
                self.test_outcome = Some(*outcome);
                self.test_report = Some(report.clone());
            }
            PhaseArtifacts::Update { .. } | PhaseArtifacts::None => {}
        }
        if let Some(err) = &outcome.error {
            self.previous_failure = Some(format!("{} failed: {}", outcome.phase, err.message));
        }
    }
}

/// One phase attempt handed to a runner.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRequest<'a> {
    pub phase: Phase,
    pub task: &'a str,
    /// 1-based attempt of this phase.
    pub attempt: u32,
    /// 1-based pass over the whole task.
    pub task_attempt: u32,
    pub context: &'a PhaseContext,
}

pub trait PhaseRunner {
    fn run(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome;
}

impl<R: PhaseRunner + ?Sized> PhaseRunner for Box<R> {
    fn run(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        (**self).run(request)
    }
}

/// Phase runner backed by a generator, a change tracker and an optional test
/// command.
pub struct PhaseExecutor<G, T> {
    root: PathBuf,
    generator: G,
    tracker: T,
    test_runner: Option<Box<dyn TestRunner + Send>>,
    prompts: PromptBuilder,
    study_checkpoint: Option<Checkpoint>,
    /// Root-relative paths generated files may not replace.
    protected: Vec<PathBuf>,
}

impl<G: Generator, T: ChangeTracker> PhaseExecutor<G, T> {
    pub fn new(root: impl Into<PathBuf>, generator: G, tracker: T) -> Self {
        Self {
            root: root.into(),
            generator,
            tracker,
            test_runner: None,
            prompts: PromptBuilder::default(),
            study_checkpoint: None,
            protected: Vec::new(),
        }
    }

    pub fn with_test_runner(mut self, runner: Option<Box<dyn TestRunner + Send>>) -> Self {
        self.test_runner = runner;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Files and directories the Implement phase must leave alone. Paths may
    /// be absolute (under the root) or root-relative; a directory covers
    /// everything below it.
    pub fn with_protected_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        for path in paths {
            let relative = match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) if path.is_relative() => path,
                Err(_) => continue,
            };
            if let Some(rel) = relative.to_str().and_then(safe_relative_path) {
                self.protected.push(rel);
            }
        }
        self
    }

    fn is_protected(&self, rel: &Path) -> bool {
        self.protected.iter().any(|p| rel.starts_with(p))
    }

    fn inputs<'a>(&self, request: &'a PhaseRequest<'a>) -> PromptInputs<'a> {
        let ctx = request.context;
        PromptInputs {
            task: request.task,
            task_attempt: request.task_attempt,
            goal: ctx.goal.as_deref(),
            feedback: ctx.feedback.as_deref(),
            previous_failure: ctx.previous_failure.as_deref(),
            layout: None,
            study_notes: ctx.study_notes.as_deref(),
            implementation: ctx.implementation.as_deref(),
            files_written: &ctx.files_written,
        }
    }

    fn generate(
        &mut self,
        phase: Phase,
        kind: PromptKind,
        inputs: &PromptInputs<'_>,
    ) -> Result<String, PhaseOutcome> {
        let prompt = self.prompts.render(kind, inputs).map_err(|err| {
            PhaseOutcome::failure(phase, PhaseErrorKind::Io, format!("render prompt: {err:#}"))
        })?;
        let request = GenerationRequest::new(prompt).with_system(kind.system_prompt());
        self.generator
            .generate(&request)
            .map(|generation| generation.text)
            .map_err(|err| generation_failure(phase, &err))
    }

    #[instrument(skip_all, fields(task = request.task))]
    fn study(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        match self.tracker.checkpoint(&self.root) {
            Ok(checkpoint) => self.study_checkpoint = Some(checkpoint),
            Err(err) => {
                return PhaseOutcome::failure(
                    Phase::Study,
                    PhaseErrorKind::Io,
                    format!("checkpoint project: {err:#}"),
                );
            }
        }
        let layout = project_layout(&self.root, LAYOUT_LIMIT);
        let mut inputs = self.inputs(request);
        inputs.layout = Some(&layout);
        match self.generate(Phase::Study, PromptKind::Study, &inputs) {
            Ok(notes) => {
                let summary = format!("studied task ({} chars of notes)", notes.len());
                PhaseOutcome::success(Phase::Study, PhaseArtifacts::Study { notes }, summary)
            }
            Err(failure) => failure,
        }
    }

    #[instrument(skip_all, fields(task = request.task))]
    fn implement(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        let before = match self.tracker.checkpoint(&self.root) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                return PhaseOutcome::failure(
                    Phase::Implement,
                    PhaseErrorKind::Io,
                    format!("checkpoint project: {err:#}"),
                );
            }
        };
        let layout = project_layout(&self.root, LAYOUT_LIMIT);
        let mut inputs = self.inputs(request);
        inputs.layout = Some(&layout);
        let response = match self.generate(Phase::Implement, PromptKind::Implement, &inputs) {
            Ok(text) => text,
            Err(failure) => return failure,
        };

        let mut written = Vec::new();
        let mut rejected = Vec::new();
        for block in parse_code_blocks(&response) {
            let Some(rel) = safe_relative_path(&block.path).filter(|rel| !self.is_protected(rel))
            else {
                warn!(path = %block.path, "rejected unsafe or protected path from response");
                rejected.push(block.path);
                continue;
            };
            if let Err(err) = write_project_file(&self.root, &rel, &block.content) {
                return PhaseOutcome::failure(
                    Phase::Implement,
                    PhaseErrorKind::Io,
                    format!("write {}: {err}", rel.display()),
                )
                .with_files(written);
            }
            debug!(path = %rel.display(), bytes = block.content.len(), "wrote file");
            written.push(rel);
        }

        let mut touched: BTreeSet<PathBuf> = written.iter().cloned().collect();
        match self.tracker.changed_files(&self.root, &before) {
            Ok(changed) => touched.extend(changed),
            Err(err) => warn!(err = %format!("{err:#}"), "change detection failed"),
        }

        let mut summary = format!("wrote {} file(s)", written.len());
        if !rejected.is_empty() {
            summary.push_str(&format!(", rejected {} unsafe path(s)", rejected.len()));
        }
        info!(files = written.len(), rejected = rejected.len(), "implementation applied");
        PhaseOutcome::success(
            Phase::Implement,
            PhaseArtifacts::Implement {
                response,
                files_written: written,
            },
            summary,
        )
        .with_files(touched.into_iter().collect())
    }

    #[instrument(skip_all, fields(task = request.task))]
    fn test(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        if let Some(runner) = &self.test_runner {
            return match runner.run() {
                Ok(report) => {
                    let summary = format!("tests {}", outcome_word(report.outcome));
                    PhaseOutcome::success(
                        Phase::Test,
                        PhaseArtifacts::Test {
                            outcome: report.outcome,
                            report: report.output,
                        },
                        summary,
                    )
                }
                Err(err) => PhaseOutcome::failure(
                    Phase::Test,
                    PhaseErrorKind::TestRunner,
                    format!("{err:#}"),
                ),
            };
        }

        let inputs = self.inputs(request);
        match self.generate(Phase::Test, PromptKind::Review, &inputs) {
            Ok(review) => {
                let outcome = parse_verdict(&review);
                let summary = format!("review {}", outcome_word(outcome));
                PhaseOutcome::success(
                    Phase::Test,
                    PhaseArtifacts::Test {
                        outcome,
                        report: review,
                    },
                    summary,
                )
            }
            Err(failure) => failure,
        }
    }

    fn update(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        let decision = update_decision(request.context.test_outcome);
        let summary = match decision {
            UpdateDecision::MarkDone => "task complete".to_string(),
            UpdateDecision::RetryTask => "tests failed; task will be retried".to_string(),
        };
        let files = self
            .study_checkpoint
            .take()
            .and_then(|checkpoint| self.tracker.changed_files(&self.root, &checkpoint).ok())
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        PhaseOutcome::success(Phase::Update, PhaseArtifacts::Update { decision }, summary)
            .with_files(files)
    }
}

impl<G: Generator, T: ChangeTracker> PhaseRunner for PhaseExecutor<G, T> {
    fn run(&mut self, request: &PhaseRequest<'_>) -> PhaseOutcome {
        match request.phase {
            Phase::Study => self.study(request),
            Phase::Implement => self.implement(request),
            Phase::Test => self.test(request),
            Phase::Update => self.update(request),
        }
    }
}

/// Failed tests restart the task; passing or inconclusive tests complete it.
pub fn update_decision(test_outcome: Option<TestOutcome>) -> UpdateDecision {
    match test_outcome {
        Some(TestOutcome::Fail) => UpdateDecision::RetryTask,
        Some(TestOutcome::Pass) | Some(TestOutcome::Inconclusive) | None => {
            UpdateDecision::MarkDone
        }
    }
}

/// The last `VERDICT: PASS|FAIL` line of a review wins.
pub fn parse_verdict(review: &str) -> TestOutcome {
    match VERDICT_RE
        .captures_iter(review)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
        .as_deref()
    {
        Some("PASS") => TestOutcome::Pass,
        Some("FAIL") => TestOutcome::Fail,
        _ => TestOutcome::Inconclusive,
    }
}

fn outcome_word(outcome: TestOutcome) -> &'static str {
    match outcome {
        TestOutcome::Pass => "passed",
        TestOutcome::Fail => "failed",
        TestOutcome::Inconclusive => "inconclusive",
    }
}

fn generation_failure(phase: Phase, err: &GenerationError) -> PhaseOutcome {
    warn!(%phase, kind = ?err.kind(), err = %err, "generation failed");
    PhaseOutcome::failure(phase, PhaseErrorKind::Generation(err.kind()), err.to_string())
}

fn write_project_file(root: &Path, rel: &Path, content: &str) -> std::io::Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::GenerationErrorKind;
    use crate::io::file_tracker::SnapshotTracker;
    use crate::io::test_runner::TestReport;
    use crate::test_support::{ScriptedGenerator, StaticTracker};

    fn request<'a>(phase: Phase, context: &'a PhaseContext) -> PhaseRequest<'a> {
        PhaseRequest {
            phase,
            task: "add greeting",
            attempt: 1,
            task_attempt: 1,
            context,
        }
    }

    #[test]
    fn implement_writes_safe_blocks_and_reports_touched_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new([Ok(
            "Here you go:\n```src/greet.rs\npub fn hi() {}\n```\n```../escape.rs\nbad\n```\n"
                .to_string(),
        )]);
        let mut executor = PhaseExecutor::new(temp.path(), generator, SnapshotTracker);
        let ctx = PhaseContext::default();

        let outcome = executor.run(&request(Phase::Implement, &ctx));
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.files_touched, vec![PathBuf::from("src/greet.rs")]);
        assert!(outcome.summary.contains("rejected 1 unsafe path"));
        assert_eq!(
            fs::read_to_string(temp.path().join("src/greet.rs")).expect("read"),
            "pub fn hi() {}\n"
        );
        assert!(!temp.path().parent().expect("parent").join("escape.rs").exists());
    }

    #[test]
    fn implement_leaves_plan_and_tool_dir_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan_path = temp.path().join("@fix_plan.md");
        fs::write(&plan_path, "- [ ] a\n- [ ] b\n").expect("plan");
        let generator = ScriptedGenerator::new([Ok(concat!(
            "```@fix_plan.md\n# rewritten\n```\n",
            "```./.phaseloop/config.toml\nmax_cycles = 1\n```\n",
            "```src/ok.rs\n// ok\n```\n",
        )
        .to_string())]);
        let mut executor = PhaseExecutor::new(temp.path(), generator, SnapshotTracker)
            .with_protected_paths([plan_path.clone(), temp.path().join(".phaseloop")]);
        let ctx = PhaseContext::default();

        let outcome = executor.run(&request(Phase::Implement, &ctx));
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(outcome.summary.contains("rejected 2 unsafe path"));
        assert_eq!(outcome.files_touched, vec![PathBuf::from("src/ok.rs")]);
        assert_eq!(
            fs::read_to_string(&plan_path).expect("plan"),
            "- [ ] a\n- [ ] b\n"
        );
        assert!(!temp.path().join(".phaseloop/config.toml").exists());
    }

    #[test]
    fn implement_reports_files_changed_outside_code_blocks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new([Ok("```src/x.rs\n// x\n```\n".to_string())]);
        let tracker = StaticTracker {
            changed: BTreeSet::from([PathBuf::from("Cargo.lock")]),
        };
        let mut executor = PhaseExecutor::new(temp.path(), generator, tracker);
        let ctx = PhaseContext::default();

        let outcome = executor.run(&request(Phase::Implement, &ctx));
        assert_eq!(
            outcome.files_touched,
            vec![PathBuf::from("Cargo.lock"), PathBuf::from("src/x.rs")]
        );
        assert!(matches!(
            outcome.artifacts,
            PhaseArtifacts::Implement { ref files_written, .. }
                if files_written == &vec![PathBuf::from("src/x.rs")]
        ));
    }

    #[test]
    fn generation_error_becomes_failed_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = ScriptedGenerator::new([Err(GenerationError::Timeout(
            std::time::Duration::from_secs(300),
        ))]);
        let mut executor = PhaseExecutor::new(temp.path(), generator, SnapshotTracker);
        let ctx = PhaseContext::default();
        let outcome = executor.run(&request(Phase::Study, &ctx));
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.error.map(|e| e.kind),
            Some(PhaseErrorKind::Generation(GenerationErrorKind::Timeout))
        );
    }

    #[test]
    fn study_prompt_carries_feedback_and_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("Cargo.toml"), "[package]").expect("write");
        let generator = ScriptedGenerator::new([Ok("notes".to_string())]);
        let prompts = generator.prompts();
        let mut executor = PhaseExecutor::new(temp.path(), generator, SnapshotTracker);
        let ctx = PhaseContext {
            feedback: Some("prefer std only".to_string()),
            ..PhaseContext::default()
        };
        let outcome = executor.run(&request(Phase::Study, &ctx));
        assert_eq!(
            outcome.artifacts,
            PhaseArtifacts::Study {
                notes: "notes".to_string()
            }
        );
        let sent = prompts.lock().expect("prompts");
        assert!(sent[0].contains("prefer std only"));
        assert!(sent[0].contains("Cargo.toml"));
    }

    struct CannedTests(TestOutcome);

    impl TestRunner for CannedTests {
        fn run(&self) -> anyhow::Result<TestReport> {
            Ok(TestReport {
                outcome: self.0,
                output: "1 failed".to_string(),
                timed_out: false,
            })
        }
    }

    #[test]
    fn test_phase_uses_runner_when_configured() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut executor =
            PhaseExecutor::new(temp.path(), ScriptedGenerator::new([]), SnapshotTracker)
                .with_test_runner(Some(Box::new(CannedTests(TestOutcome::Fail))));
        let ctx = PhaseContext::default();
        let outcome = executor.run(&request(Phase::Test, &ctx));
        assert!(outcome.is_success());
        assert_eq!(
            outcome.artifacts,
            PhaseArtifacts::Test {
                outcome: TestOutcome::Fail,
                report: "1 failed".to_string()
            }
        );
    }

    #[test]
    fn test_phase_falls_back_to_review() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator =
            ScriptedGenerator::new([Ok("Looks right.\n\n**VERDICT: PASS**".to_string())]);
        let mut executor = PhaseExecutor::new(temp.path(), generator, SnapshotTracker);
        let ctx = PhaseContext::default();
        let outcome = executor.run(&request(Phase::Test, &ctx));
        assert!(matches!(
            outcome.artifacts,
            PhaseArtifacts::Test {
                outcome: TestOutcome::Pass,
                ..
            }
        ));
    }

    #[test]
    fn verdict_parsing() {
        assert_eq!(parse_verdict("VERDICT: FAIL"), TestOutcome::Fail);
        assert_eq!(parse_verdict("verdict: pass"), TestOutcome::Pass);
        assert_eq!(
            parse_verdict("VERDICT: FAIL\nafter fixes\nVERDICT: PASS"),
            TestOutcome::Pass
        );
        assert_eq!(parse_verdict("seems fine"), TestOutcome::Inconclusive);
    }

    #[test]
    fn update_follows_test_outcome() {
        assert_eq!(update_decision(Some(TestOutcome::Fail)), UpdateDecision::RetryTask);
        assert_eq!(
            update_decision(Some(TestOutcome::Inconclusive)),
            UpdateDecision::MarkDone
        );
        assert_eq!(update_decision(None), UpdateDecision::MarkDone);
    }

    #[test]
    fn context_restart_keeps_goal_and_test_report() {
        let mut ctx = PhaseContext::with_goal(Some("ship it".to_string()));
        ctx.absorb(&PhaseOutcome::success(
            Phase::Test,
            PhaseArtifacts::Test {
                outcome: TestOutcome::Fail,
                report: "assertion failed".to_string(),
            },
            "tests failed",
        ));
        ctx.restart_task();
        assert_eq!(ctx.goal.as_deref(), Some("ship it"));
        assert_eq!(ctx.previous_failure.as_deref(), Some("assertion failed"));
        assert!(ctx.test_outcome.is_none());
    }
}
