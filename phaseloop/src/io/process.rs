//! Child processes with a deadline and bounded output capture.
//!
//! Used by the command generation backend and the test runner.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a finished (or killed) child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped beyond the capture limit, per stream.
    pub dropped: (usize, usize),
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, with notes about truncation.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        if self.dropped.0 > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.dropped.0));
        }
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        if self.dropped.1 > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.dropped.1));
        }
        text
    }
}

/// Build a `sh -c` command running in `cwd`.
pub fn shell_command(script: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(cwd);
    cmd
}

/// Run `cmd` to completion or until `timeout` elapses, killing it on expiry.
///
/// Both pipes are drained on reader threads while the child runs so a chatty
/// child can never block on a full pipe. At most `limit` bytes per stream are
/// kept in memory.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), limit))]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    limit: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd.spawn().context("spawn command")?;
    debug!(pid = child.id(), "child spawned");

    if let Some(input) = stdin {
        let mut pipe = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        pipe.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let out_reader = thread::spawn(move || drain_limited(stdout, limit));
    let err_reader = thread::spawn(move || drain_limited(stderr, limit));

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;

    let (stdout, stdout_dropped) = join_reader(out_reader).context("join stdout")?;
    let (stderr, stderr_dropped) = join_reader(err_reader).context("join stderr")?;
    if stdout_dropped > 0 || stderr_dropped > 0 {
        warn!(stdout_dropped, stderr_dropped, "child output truncated");
    }

    let elapsed = started.elapsed();
    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "child finished"
    );
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        dropped: (stdout_dropped, stderr_dropped),
        timed_out,
        elapsed,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => Ok((status, false)),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "child timed out, killing");
            child.kill().context("kill child")?;
            let status = child.wait().context("reap killed child")?;
            Ok((status, true))
        }
    }
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let keep = n.min(room);
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    Ok((kept, dropped))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_with_timeout(
            shell_command("echo hello; echo oops >&2; exit 3", dir.path()),
            None,
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.succeeded());
        assert_eq!(out.stdout_text(), "hello\n");
        assert!(out.combined_text().contains("oops"));
    }

    #[test]
    fn pipes_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_with_timeout(
            shell_command("cat", dir.path()),
            Some(b"prompt text"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.succeeded());
        assert_eq!(out.stdout_text(), "prompt text");
    }

    #[test]
    fn kills_on_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_with_timeout(
            shell_command("exec sleep 5", dir.path()),
            None,
            Duration::from_millis(100),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.succeeded());
    }

    #[test]
    fn truncates_beyond_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = run_with_timeout(
            shell_command("printf 'abcdefghij'", dir.path()),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.dropped.0, 6);
        assert!(out.combined_text().contains("truncated 6 bytes"));
    }
}
