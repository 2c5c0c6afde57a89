//! Test command adapter used by the Test phase.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::types::TestOutcome;
use crate::io::config::TestConfig;
use crate::io::process::{run_with_timeout, shell_command};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub outcome: TestOutcome,
    /// Captured output, bounded by the configured limit.
    pub output: String,
    pub timed_out: bool,
}

pub trait TestRunner {
    /// Run the project's tests. `Err` means the runner itself could not run
    /// (e.g. spawn failure); failing tests are an `Ok` report with `Fail`.
    fn run(&self) -> Result<TestReport>;
}

/// Runs a shell command from the project root; exit status 0 is a pass.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandTestRunner {
    /// `None` when no test command is configured.
    pub fn from_config(cfg: &TestConfig, workdir: PathBuf) -> Option<Self> {
        let command = cfg.command.trim();
        if command.is_empty() {
            return None;
        }
        Some(Self {
            command: command.to_string(),
            workdir,
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        })
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(command = %self.command))]
    fn run(&self) -> Result<TestReport> {
        let output = run_with_timeout(
            shell_command(&self.command, &self.workdir),
            None,
            self.timeout,
            self.output_limit_bytes,
        )?;
        let mut text = output.combined_text();
        if output.timed_out {
            text.push_str(&format!(
                "\n[test command timed out after {}s]\n",
                self.timeout.as_secs()
            ));
        }
        let outcome = if output.succeeded() {
            TestOutcome::Pass
        } else {
            TestOutcome::Fail
        };
        info!(
            ?outcome,
            exit_code = ?output.status.code(),
            timed_out = output.timed_out,
            "tests finished"
        );
        Ok(TestReport {
            outcome,
            output: text,
            timed_out: output.timed_out,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner(command: &str, dir: &std::path::Path) -> CommandTestRunner {
        CommandTestRunner {
            command: command.to_string(),
            workdir: dir.to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn exit_zero_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = runner("echo ok", temp.path()).run().expect("run");
        assert_eq!(report.outcome, TestOutcome::Pass);
        assert!(report.output.contains("ok"));
    }

    #[test]
    fn non_zero_exit_fails_with_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = runner("echo 'assertion failed' >&2; exit 1", temp.path())
            .run()
            .expect("run");
        assert_eq!(report.outcome, TestOutcome::Fail);
        assert!(report.output.contains("assertion failed"));
    }

    #[test]
    fn timeout_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut slow = runner("exec sleep 5", temp.path());
        slow.timeout = Duration::from_millis(100);
        let report = slow.run().expect("run");
        assert_eq!(report.outcome, TestOutcome::Fail);
        assert!(report.timed_out);
    }

    #[test]
    fn empty_command_means_no_runner() {
        let cfg = TestConfig::default();
        assert!(CommandTestRunner::from_config(&cfg, PathBuf::from(".")).is_none());
    }
}
