//! Running a long child process (a clone) under a deadline.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How a deadline-bounded child process ended.
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    /// Trimmed stderr, cut to the configured limit.
    pub stderr: String,
    pub timed_out: bool,
}

impl Finished {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Run `cmd` with stdout discarded, killing it once `timeout` elapses.
///
/// Stderr is drained on a separate thread so a chatty child cannot block on a
/// full pipe; at most `stderr_limit` bytes of it are kept.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_with_deadline(
    mut cmd: Command,
    timeout: Duration,
    stderr_limit: usize,
) -> Result<Finished> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn command")?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let reader = thread::spawn(move || drain_limited(stderr, stderr_limit));

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let stderr = reader
        .join()
        .map_err(|_| anyhow!("stderr reader panicked"))?
        .context("read stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(Finished {
        status,
        stderr,
        timed_out,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for command")? {
        return Ok((status, false));
    }
    warn!(timeout_secs = timeout.as_secs(), "deadline passed, killing command");
    child.kill().context("kill command")?;
    let status = child.wait().context("wait for killed command")?;
    Ok((status, true))
}

/// Read `reader` to the end, keeping the first `limit` bytes as lossy UTF-8.
fn drain_limited(mut reader: impl Read, limit: usize) -> std::io::Result<String> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let take = n.min(limit.saturating_sub(kept.len()));
        kept.extend_from_slice(&chunk[..take]);
        dropped += n - take;
    }
    let mut text = String::from_utf8_lossy(&kept).trim().to_string();
    if dropped > 0 {
        text.push_str(&format!(" [{dropped} more bytes]"));
    }
    Ok(text)
}
