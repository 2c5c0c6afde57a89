//! Session-level tests: drive the engine's worker thread through whole
//! sessions with scripted phases and observe it only through `LoopHandle`.

use std::time::{Duration, Instant};

use phaseloop::core::budget::CycleBudget;
use phaseloop::core::session::LoopSettings;
use phaseloop::core::status::StatusSnapshot;
use phaseloop::core::types::{
    Control, GenerationErrorKind, HaltReason, Phase, PhaseErrorKind, RunMode, TaskEvent,
    TestOutcome,
};
use phaseloop::engine::{EngineOptions, LoopHandle, start};
use phaseloop::io::file_tracker::SnapshotTracker;
use phaseloop::io::plan_store::{FilePlanStore, PlanStore};
use phaseloop::launch::Project;
use phaseloop::phases::PhaseExecutor;
use phaseloop::test_support::{
    MemoryPlanStore, RecordingSink, ScriptedGenerator, ScriptedPhases, TestProject,
};

fn options(min: u32, max: u32, mode: RunMode) -> EngineOptions {
    EngineOptions {
        settings: LoopSettings {
            budget: CycleBudget::new(min, max).expect("budget"),
            mode,
            ..LoopSettings::default()
        },
        retry_delay: Duration::ZERO,
        idle_poll: Duration::from_millis(20),
        goal: None,
    }
}

/// Poll published snapshots until `done` holds; panics after five seconds.
fn wait_until(handle: &LoopHandle, done: impl Fn(&StatusSnapshot) -> bool) -> StatusSnapshot {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = handle.get_status();
        if done(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "timed out; last status: {status:?}");
        handle.wait_for_update(status.seq, Duration::from_millis(50));
    }
}

#[test]
fn four_cycle_budget_completes_single_task() {
    let store = MemoryPlanStore::new("# Plan\n- [ ] add parser\n");
    let phases = ScriptedPhases::new();
    let calls = phases.calls();
    let handle = start(
        store.clone(),
        phases,
        Box::new(RecordingSink::new()),
        options(4, 4, RunMode::NonStop),
    )
    .expect("start");

    let last = handle.join().expect("join");
    assert_eq!(last.cycles_completed, 4);
    assert_eq!(last.tasks_completed, 1);
    assert_eq!(last.halt, Some(HaltReason::MaxCyclesReached));
    assert_eq!(store.text(), "# Plan\n- [x] add parser\n");

    let phases: Vec<Phase> = calls.lock().expect("calls").iter().map(|(p, _)| *p).collect();
    assert_eq!(phases, Phase::ALL.to_vec());
}

#[test]
fn implement_timing_out_skips_task_after_three_attempts() {
    let store = MemoryPlanStore::new("- [ ] flaky\n");
    let sink = RecordingSink::new();
    let phases = ScriptedPhases::new().always_fail(
        Phase::Implement,
        PhaseErrorKind::Generation(GenerationErrorKind::Timeout),
    );
    let handle = start(
        store.clone(),
        phases,
        Box::new(sink.clone()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    let last = handle.join().expect("join");
    // Study once, Implement three times.
    assert_eq!(last.cycles_completed, 4);
    assert_eq!(last.tasks_skipped, 1);
    assert_eq!(last.tasks_completed, 0);
    assert_eq!(last.halt, Some(HaltReason::PlanExhausted));
    assert_eq!(store.text(), "- [ ] flaky\n");

    let snapshots = sink.snapshots();
    let cycles: Vec<u32> = snapshots
        .iter()
        .filter(|s| s.last_result.is_some())
        .map(|s| s.cycles_completed)
        .collect();
    assert!(cycles.windows(2).all(|w| w[1] >= w[0]));
    let attempts: Vec<u32> = snapshots
        .iter()
        .filter_map(|s| s.last_result.as_ref())
        .filter(|r| r.phase == Phase::Implement)
        .map(|r| r.attempt)
        .collect();
    assert!(attempts.starts_with(&[1, 2, 3]));
    assert!(snapshots.iter().any(|s| matches!(
        &s.task_event,
        Some(TaskEvent::Skipped { task, .. }) if task == "flaky"
    )));
    let failed = snapshots
        .iter()
        .filter_map(|s| s.last_result.as_ref())
        .find(|r| !r.success)
        .expect("failed report");
    assert_eq!(
        failed.error.as_ref().map(|e| e.kind),
        Some(PhaseErrorKind::Generation(GenerationErrorKind::Timeout))
    );
}

#[test]
fn pause_during_test_stops_before_update_and_step_runs_one_phase() {
    let store = MemoryPlanStore::new("- [ ] a\n- [ ] b\n");
    let mut phases = ScriptedPhases::new();
    let gate = phases.gate(Phase::Test);
    let calls = phases.calls();
    let handle = start(
        store,
        phases,
        Box::new(RecordingSink::new()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("test phase entered");
    assert!(handle.pause());
    // The running phase is not interrupted.
    assert_eq!(handle.get_status().phase, Phase::Test);
    gate.release.send(()).expect("release");

    let paused = wait_until(&handle, |s| s.cycles_completed == 3);
    assert_eq!(paused.control, Control::Paused);
    assert_eq!(paused.phase, Phase::Update);
    assert_eq!(paused.current_task.as_deref(), Some("a"));

    // Paused workers run nothing.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.lock().expect("calls").len(), 3);

    assert!(handle.step(None));
    let stepped = wait_until(&handle, |s| {
        s.cycles_completed == 4 && s.control == Control::Paused
    });
    assert_eq!(stepped.tasks_completed, 1);
    assert_eq!(stepped.phase, Phase::Study);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.lock().expect("calls").len(), 4);

    assert!(handle.stop());
    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::Stopped));
    assert_eq!(last.cycles_completed, 4);
}

#[test]
fn exhausted_plan_below_minimum_waits_for_new_tasks() {
    let store = MemoryPlanStore::new("- [ ] a\n");
    let handle = start(
        store.clone(),
        ScriptedPhases::new(),
        Box::new(RecordingSink::new()),
        options(8, 40, RunMode::NonStop),
    )
    .expect("start");

    let waiting = wait_until(&handle, |s| s.waiting_for_tasks);
    assert_eq!(waiting.cycles_completed, 4);
    assert_eq!(waiting.halt, None);

    store.append_task("b").expect("append");
    handle.notify_plan_changed();

    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::PlanExhausted));
    assert_eq!(last.cycles_completed, 8);
    assert_eq!(last.tasks_completed, 2);
    assert_eq!(store.text(), "- [x] a\n- [x] b\n");
}

#[test]
fn stop_ends_a_waiting_session() {
    let store = MemoryPlanStore::new("- [ ] a\n");
    let handle = start(
        store,
        ScriptedPhases::new(),
        Box::new(RecordingSink::new()),
        EngineOptions {
            idle_poll: Duration::from_secs(30),
            ..options(10, 40, RunMode::NonStop)
        },
    )
    .expect("start");

    wait_until(&handle, |s| s.waiting_for_tasks);
    assert!(handle.stop());
    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::Stopped));
    assert!(!last.waiting_for_tasks);
    assert_eq!(last.cycles_completed, 4);
}

#[test]
fn ceiling_halts_mid_task() {
    let store = MemoryPlanStore::new("- [ ] a\n- [ ] b\n");
    let phases = ScriptedPhases::new();
    let calls = phases.calls();
    let handle = start(
        store.clone(),
        phases,
        Box::new(RecordingSink::new()),
        options(0, 6, RunMode::NonStop),
    )
    .expect("start");

    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::MaxCyclesReached));
    assert_eq!(last.cycles_completed, 6);
    assert_eq!(last.current_task.as_deref(), Some("b"));
    assert_eq!(calls.lock().expect("calls").len(), 6);
    assert_eq!(store.text(), "- [x] a\n- [ ] b\n");
}

#[test]
fn failing_tests_retry_the_task_from_study() {
    let store = MemoryPlanStore::new("- [ ] a\n");
    let sink = RecordingSink::new();
    let phases = ScriptedPhases::new().test_outcomes([TestOutcome::Fail]);
    let handle = start(
        store.clone(),
        phases,
        Box::new(sink.clone()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    let last = handle.join().expect("join");
    assert_eq!(last.cycles_completed, 8);
    assert_eq!(last.tasks_completed, 1);
    assert_eq!(store.text(), "- [x] a\n");
    assert!(sink.snapshots().iter().any(|s| s.task_event
        == Some(TaskEvent::Retrying {
            task: "a".to_string(),
            attempt: 2,
        })));
}

#[test]
fn phase_by_phase_feedback_reaches_the_next_phase() {
    let store = MemoryPlanStore::new("- [ ] a\n");
    let phases = ScriptedPhases::new();
    let seen = phases.feedback_seen();
    let handle = start(
        store,
        phases,
        Box::new(RecordingSink::new()),
        options(0, 40, RunMode::PhaseByPhase),
    )
    .expect("start");

    let first = wait_until(&handle, |s| s.control == Control::Paused);
    assert_eq!(first.cycles_completed, 1);
    assert_eq!(first.phase, Phase::Implement);

    assert!(handle.step(Some("use serde for parsing".to_string())));
    wait_until(&handle, |s| {
        s.cycles_completed == 2 && s.control == Control::Paused
    });

    // Switching to non-stop releases the boundary pause and runs to the end.
    assert!(handle.set_mode(RunMode::NonStop));
    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::PlanExhausted));

    let seen = seen.lock().expect("feedback").clone();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], None);
    assert_eq!(seen[1].as_deref(), Some("use serde for parsing"));
    assert_eq!(seen[2], None);
}

#[test]
fn controls_after_halt_are_rejected() {
    let handle = start(
        MemoryPlanStore::new("# nothing to do\n"),
        ScriptedPhases::new(),
        Box::new(RecordingSink::new()),
        options(0, 4, RunMode::NonStop),
    )
    .expect("start");

    let done = wait_until(&handle, |s| s.is_halted());
    assert_eq!(done.halt, Some(HaltReason::PlanExhausted));
    assert_eq!(done.cycles_completed, 0);
    assert!(!handle.pause());
    assert!(!handle.resume(None));
    assert!(!handle.step(None));
    assert!(!handle.stop());
    assert!(!handle.set_mode(RunMode::PhaseByPhase));
}

#[test]
fn missing_plan_file_fails_to_start() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FilePlanStore::new(temp.path().join("@fix_plan.md"));
    let result = start(
        store,
        ScriptedPhases::new(),
        Box::new(RecordingSink::new()),
        options(0, 4, RunMode::NonStop),
    );
    let err = result.err().expect("start should fail");
    assert!(format!("{err:#}").contains("load plan"));
}

#[test]
fn executor_session_writes_files_and_marks_plan() {
    let project = TestProject::with_plan("# Plan\n- [ ] add greeting\n");
    let generator = ScriptedGenerator::new([
        Ok("The crate needs a greet function.".to_string()),
        Ok("```src/greet.rs\npub fn greet() -> &'static str {\n    \"hi\"\n}\n```\n".to_string()),
        Ok("Looks right.\nVERDICT: PASS\n".to_string()),
    ]);
    let prompts = generator.prompts();
    let executor = PhaseExecutor::new(project.root(), generator, SnapshotTracker);
    let sink = RecordingSink::new();
    let handle = start(
        FilePlanStore::new(project.plan_path()),
        executor,
        Box::new(sink.clone()),
        EngineOptions {
            goal: Some("say hello".to_string()),
            ..options(0, 10, RunMode::NonStop)
        },
    )
    .expect("start");

    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::PlanExhausted));
    assert_eq!(last.cycles_completed, 4);
    assert_eq!(project.plan_text(), "# Plan\n- [x] add greeting\n");
    let written =
        std::fs::read_to_string(project.root().join("src/greet.rs")).expect("generated file");
    assert!(written.contains("pub fn greet()"));

    let implement = sink
        .snapshots()
        .into_iter()
        .filter_map(|s| s.last_result)
        .find(|r| r.phase == Phase::Implement)
        .expect("implement report");
    assert!(implement.success);
    assert!(
        implement
            .files_touched
            .contains(&std::path::PathBuf::from("src/greet.rs"))
    );

    let prompts = prompts.lock().expect("prompts").clone();
    assert_eq!(prompts.len(), 3);
    assert!(prompts.iter().all(|p| p.contains("add greeting")));
    assert!(prompts[0].contains("say hello"));
    assert!(prompts[1].contains("The crate needs a greet function."));
}

#[test]
fn store_appends_are_picked_up_between_tasks() {
    let project = TestProject::with_plan("- [ ] a\n");
    let store = FilePlanStore::new(project.plan_path());
    let mut phases = ScriptedPhases::new();
    let gate = phases.gate(Phase::Update);
    let handle = start(
        store.clone(),
        phases,
        Box::new(RecordingSink::new()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("update entered");
    store.append_task("b").expect("append");
    gate.release.send(()).expect("release");

    let last = handle.join().expect("join");
    assert_eq!(last.tasks_completed, 2);
    assert_eq!(project.plan_text(), "- [x] a\n- [x] b\n");
}

#[test]
fn step_requested_while_a_phase_runs_covers_the_next_phase() {
    let store = MemoryPlanStore::new("- [ ] a\n- [ ] b\n");
    let mut phases = ScriptedPhases::new();
    let gate = phases.gate(Phase::Test);
    let calls = phases.calls();
    let handle = start(
        store,
        phases,
        Box::new(RecordingSink::new()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("test phase entered");
    assert!(handle.pause());
    assert!(handle.step(None));
    gate.release.send(()).expect("release");

    let stepped = wait_until(&handle, |s| {
        s.cycles_completed == 4 && s.control == Control::Paused
    });
    assert_eq!(stepped.tasks_completed, 1);
    assert_eq!(stepped.phase, Phase::Study);
    std::thread::sleep(Duration::from_millis(50));
    let ran: Vec<Phase> = calls.lock().expect("calls").iter().map(|(p, _)| *p).collect();
    assert_eq!(ran, Phase::ALL.to_vec());

    assert!(handle.stop());
    assert_eq!(handle.join().expect("join").cycles_completed, 4);
}

#[test]
fn phase_recovers_on_retry_without_skipping_task() {
    let store = MemoryPlanStore::new("- [ ] wobbly\n");
    let sink = RecordingSink::new();
    let phases = ScriptedPhases::new().fail(
        Phase::Implement,
        2,
        PhaseErrorKind::Generation(GenerationErrorKind::Connection),
    );
    let calls = phases.calls();
    let handle = start(
        store.clone(),
        phases,
        Box::new(sink.clone()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::PlanExhausted));
    assert_eq!(last.cycles_completed, 6);
    assert_eq!(last.tasks_completed, 1);
    assert_eq!(last.tasks_skipped, 0);
    assert_eq!(store.text(), "- [x] wobbly\n");

    let ran: Vec<Phase> = calls.lock().expect("calls").iter().map(|(p, _)| *p).collect();
    assert_eq!(
        ran,
        vec![
            Phase::Study,
            Phase::Implement,
            Phase::Implement,
            Phase::Implement,
            Phase::Test,
            Phase::Update,
        ]
    );
    let implement: Vec<(u32, bool)> = last
        .recent_results
        .iter()
        .filter(|r| r.phase == Phase::Implement)
        .map(|r| (r.attempt, r.success))
        .collect();
    assert_eq!(implement, vec![(1, false), (2, false), (3, true)]);
    assert!(
        !sink
            .snapshots()
            .iter()
            .any(|s| matches!(s.task_event, Some(TaskEvent::Skipped { .. })))
    );
}

#[test]
fn stop_during_a_phase_lets_it_finish_then_halts() {
    let store = MemoryPlanStore::new("- [ ] a\n");
    let mut phases = ScriptedPhases::new();
    let gate = phases.gate(Phase::Implement);
    let calls = phases.calls();
    let handle = start(
        store.clone(),
        phases,
        Box::new(RecordingSink::new()),
        options(0, 40, RunMode::NonStop),
    )
    .expect("start");

    gate.entered
        .recv_timeout(Duration::from_secs(5))
        .expect("implement entered");
    assert!(handle.stop());
    assert_eq!(handle.get_status().control, Control::Stopping);
    assert!(!handle.stop());
    gate.release.send(()).expect("release");

    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::Stopped));
    assert_eq!(last.cycles_completed, 2);
    let result = last.last_result.expect("last result");
    assert_eq!(result.phase, Phase::Implement);
    assert!(result.success);
    assert_eq!(calls.lock().expect("calls").len(), 2);
    assert_eq!(store.text(), "- [ ] a\n");
}

#[test]
fn generated_code_cannot_rewrite_the_plan() {
    let project = TestProject::with_plan("# Plan\n- [ ] a\n- [ ] b\n- [x] c\n");
    let generator = ScriptedGenerator::new([]).repeating(Ok(concat!(
        "```@fix_plan.md\n# rewritten\n```\n",
        "```.phaseloop/status.json\n{}\n```\n",
        "```src/lib.rs\n// lib\n```\n",
        "VERDICT: PASS\n",
    )
    .to_string()));
    let protected = Project::open(project.root())
        .expect("open project")
        .protected_paths();
    let executor = PhaseExecutor::new(project.root(), generator, SnapshotTracker)
        .with_protected_paths(protected);
    let handle = start(
        FilePlanStore::new(project.plan_path()),
        executor,
        Box::new(RecordingSink::new()),
        options(0, 20, RunMode::NonStop),
    )
    .expect("start");

    let last = handle.join().expect("join");
    assert_eq!(last.halt, Some(HaltReason::PlanExhausted));
    assert_eq!(last.cycles_completed, 8);
    assert_eq!(last.tasks_completed, 2);
    assert_eq!(last.tasks_skipped, 0);
    assert_eq!(project.plan_text(), "# Plan\n- [x] a\n- [x] b\n- [x] c\n");
    assert!(!project.root().join(".phaseloop/status.json").exists());
    assert!(project.root().join("src/lib.rs").is_file());
}
