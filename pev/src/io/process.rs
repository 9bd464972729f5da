//! Bounded child processes: a wall-clock limit and capped output capture.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Limits applied to one child process.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub timeout: Duration,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit: usize,
}

/// One captured stream.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes read past the limit and dropped.
    pub dropped: usize,
}

impl Captured {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Text for a log file, with a marker line when bytes were dropped.
    pub fn render(&self, label: &str) -> String {
        let mut text = self.lossy();
        if self.is_truncated() {
            text.push_str(&format!("\n[{label} truncated {} bytes]\n", self.dropped));
        }
        text
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

/// Spawn `cmd`, feed it `stdin`, and wait within `bounds`.
///
/// Both pipes are drained on scoped reader threads while the child runs, so a
/// chatty child never blocks on a full pipe. A child that outlives the timeout
/// is killed and reported with `timed_out`.
#[instrument(skip_all, fields(timeout_secs = bounds.timeout.as_secs(), output_limit = bounds.output_limit))]
pub fn run_bounded(mut cmd: Command, stdin: Option<&[u8]>, bounds: Bounds) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

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

    let (status, timed_out, stdout, stderr) = thread::scope(|scope| -> Result<_> {
        let out = scope.spawn(|| capture(stdout, bounds.output_limit));
        let err = scope.spawn(|| capture(stderr, bounds.output_limit));
        let (status, timed_out) = wait_or_kill(&mut child, bounds.timeout)?;
        let stdout = out
            .join()
            .map_err(|_| anyhow!("stdout reader panicked"))??;
        let stderr = err
            .join()
            .map_err(|_| anyhow!("stderr reader panicked"))??;
        Ok((status, timed_out, stdout, stderr))
    })?;

    if stdout.is_truncated() || stderr.is_truncated() {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for command")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
    child.kill().context("kill command")?;
    let status = child.wait().context("reap killed command")?;
    Ok((status, true))
}

fn capture<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).context("read output")?;
        if read == 0 {
            return Ok(captured);
        }
        let keep = read.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += read - keep;
    }
}
