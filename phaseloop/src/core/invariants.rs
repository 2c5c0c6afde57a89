//! Session invariants checked after every recorded phase.

use crate::core::session::LoopSession;
use crate::core::types::{Control, Phase};

/// Check structural invariants of a session:
/// - the cycle budget is sane and `cycles_completed <= max_cycles`
/// - an idle session (no task) always points at Study
/// - the phases completed for the active task are exactly the prefix of the
///   phase cycle preceding the pending phase
/// - attempt counters stay within their bounds
/// - `Stopped` if and only if a halt reason is recorded
/// - waiting for tasks implies no active task
pub fn validate_session(session: &LoopSession) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(err) = session.budget.validate() {
        errors.push(format!("budget: {err}"));
    }
    if session.cycles_completed > session.budget.max_cycles {
        errors.push(format!(
            "cycles_completed {} exceeds max_cycles {}",
            session.cycles_completed, session.budget.max_cycles
        ));
    }

    match &session.current_task {
        None => {
            if session.phase != Phase::Study {
                errors.push(format!(
                    "no active task but pending phase is {}",
                    session.phase
                ));
            }
        }
        Some(task) => {
            let expected: Vec<Phase> = Phase::ALL
                .iter()
                .copied()
                .take_while(|p| *p != session.phase)
                .collect();
            if task.completed_phases != expected {
                errors.push(format!(
                    "task '{}': completed phases {:?} do not precede pending phase {}",
                    task.description, task.completed_phases, session.phase
                ));
            }
            if task.phase_failures >= session.max_phase_attempts {
                errors.push(format!(
                    "task '{}': phase failures {} reached bound {} without skip",
                    task.description, task.phase_failures, session.max_phase_attempts
                ));
            }
            if task.task_attempt == 0 || task.task_attempt > session.max_task_attempts {
                errors.push(format!(
                    "task '{}': task attempt {} outside 1..={}",
                    task.description, task.task_attempt, session.max_task_attempts
                ));
            }
            if session.waiting_for_tasks {
                errors.push(format!(
                    "waiting for tasks while task '{}' is active",
                    task.description
                ));
            }
        }
    }

    let stopped = session.control == Control::Stopped;
    if stopped != session.halt.is_some() {
        errors.push(format!(
            "control {:?} inconsistent with halt {:?}",
            session.control, session.halt
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::LoopSettings;
    use crate::core::types::HaltReason;
    use crate::plan::Plan;

    #[test]
    fn fresh_session_is_valid() {
        let session = LoopSession::new(LoopSettings::default());
        assert!(validate_session(&session).is_empty());
    }

    #[test]
    fn detects_phase_skipped_ahead() {
        let mut session = LoopSession::new(LoopSettings::default());
        session.select_task(&Plan::parse("- [ ] t\n"));
        session.phase = Phase::Test;
        let errors = validate_session(&session);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("do not precede"));
    }

    #[test]
    fn detects_halt_without_stop() {
        let mut session = LoopSession::new(LoopSettings::default());
        session.halt = Some(HaltReason::Stopped);
        assert!(
            validate_session(&session)
                .iter()
                .any(|e| e.contains("inconsistent with halt"))
        );
    }

    #[test]
    fn detects_cycles_over_ceiling() {
        let mut session = LoopSession::new(LoopSettings::default());
        session.cycles_completed = 41;
        assert!(
            validate_session(&session)
                .iter()
                .any(|e| e.contains("exceeds max_cycles"))
        );
    }
}
