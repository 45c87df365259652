//! Bounded, time-limited execution of step processes.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// What a finished (or killed) step process left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from stdout once the limit was reached.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// The process outlived its timeout and was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout then stderr as shown to users, noting any dropped bytes.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        push_truncation_note(&mut text, "stdout", self.stdout_truncated);
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        push_truncation_note(&mut text, "stderr", self.stderr_truncated);
        text
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

fn push_truncation_note(text: &mut String, stream: &str, dropped: usize) {
    if dropped > 0 {
        text.push_str(&format!("\n[{stream} truncated {dropped} bytes]\n"));
    }
}

/// Spawn `cmd` with no stdin and wait at most `timeout` for it to exit.
///
/// Both pipes are drained on their own threads while the child runs, keeping
/// at most `output_limit_bytes` of each. A child that outlives `timeout` is
/// killed along with everything it spawned, and reported with `timed_out` set
/// rather than as an error.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {:?}", cmd.get_program()))?;
    debug!(pid = child.id(), "spawned step process");

    let stdout = child.stdout.take().context("stdout not piped")?;
    let stderr = child.stderr.take().context("stderr not piped")?;
    let stdout_reader = thread::spawn(move || drain_bounded(stdout, output_limit_bytes));
    let stderr_reader = thread::spawn(move || drain_bounded(stderr, output_limit_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for step process")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "step process timed out, killing");
            kill_process_tree(&mut child)?;
            (child.wait().context("reap killed step process")?, true)
        }
    };

    let (stdout, stdout_truncated) = collect(stdout_reader, "stdout")?;
    let (stderr, stderr_truncated) = collect(stderr_reader, "stderr")?;
    if stdout_truncated + stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "step output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "step process finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// The child leads a new process group so a timeout reaches its descendants,
/// which would otherwise hold the output pipes open.
#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id()).context("step pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // Already gone between the timeout and the signal.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).context("kill step process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill step process")
}

type Drained = Result<(Vec<u8>, usize)>;

fn collect(reader: JoinHandle<Drained>, stream: &str) -> Drained {
    reader
        .join()
        .map_err(|_| anyhow!("{stream} reader panicked"))?
        .with_context(|| format!("read {stream}"))
}

/// Read `source` to EOF, keeping the first `limit` bytes and counting the rest.
fn drain_bounded(mut source: impl Read, limit: usize) -> Drained {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = source.read(&mut chunk)?;
        if n == 0 {
            return Ok((kept, dropped));
        }
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn combined_output_is_stdout_then_stderr() {
        let out = run_command_with_timeout(
            sh("printf 'Plan: 1 to add'; printf 'Warning: x' >&2"),
            Duration::from_secs(10),
            1_000,
        )
        .expect("run");
        assert!(out.succeeded());
        assert_eq!(out.combined(), "Plan: 1 to addWarning: x");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let out = run_command_with_timeout(sh("printf abcdefghij"), Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.combined().ends_with("[stdout truncated 6 bytes]\n"));
    }

    #[test]
    fn slow_process_is_killed() {
        let out = run_command_with_timeout(sh("exec sleep 5"), Duration::from_millis(100), 1_000)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.succeeded());
    }

    #[test]
    fn timeout_also_kills_grandchildren() {
        let started = std::time::Instant::now();
        let out = run_command_with_timeout(
            sh("sleep 30; echo late"),
            Duration::from_millis(200),
            1_000,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!out.combined().contains("late"));
    }

    #[test]
    fn failing_exit_code_is_reported() {
        let out = run_command_with_timeout(sh("exit 3"), Duration::from_secs(10), 1_000)
            .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.succeeded());
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = run_command_with_timeout(
            Command::new("definitely-not-a-real-binary"),
            Duration::from_secs(1),
            1_000,
        )
        .expect_err("spawn should fail");
        assert!(format!("{err:#}").contains("spawn"));
    }
}
