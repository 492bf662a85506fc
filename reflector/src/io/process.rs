//! Child process execution with a deadline and bounded output capture.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long output pipes may stay open once the child has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// What a collaborator process left behind.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes dropped from stdout past the capture limit.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Human-readable summary used in logs and error messages.
    pub fn describe_failure(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = String::from_utf8_lossy(&self.stderr);
        let tail = stderr.trim();
        let tail = tail
            .char_indices()
            .rev()
            .nth(400)
            .map_or(tail, |(idx, _)| &tail[idx..]);
        match self.status.code() {
            Some(code) if tail.is_empty() => format!("exited with status {code}"),
            Some(code) => format!("exited with status {code}: {tail}"),
            None => "terminated by signal".to_string(),
        }
    }

    /// Log-file rendering of both streams, with truncation notices.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        out.push_str("== stdout ==\n");
        out.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            out.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        out.push_str("\n== stderr ==\n");
        out.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            out.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        out
    }
}

/// Run `cmd` to completion or until `timeout`, draining both pipes on reader
/// threads so a chatty child cannot deadlock on a full pipe.
///
/// The child runs in its own process group. On timeout the whole group is
/// killed, so helpers the child spawned cannot keep the call alive by holding
/// its pipes. At most `output_limit_bytes` of each stream are kept; the rest
/// is read and discarded.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!(program = ?cmd.get_program(), "spawning collaborator");
    let mut child = cmd.spawn().map_err(|e| {
        error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
        anyhow!(e).context(format!("spawn {}", cmd.get_program().to_string_lossy()))
    })?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Off the caller thread: a child that never reads stdin must not hold up the deadline.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "collaborator did not consume stdin");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            timed_out = true;
            kill_process_group(pid);
            if let Err(e) = child.kill() {
                debug!(err = %e, "child already gone");
            }
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = collect_output(&stdout_rx, pid, "stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, pid, "stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type Captured = Result<(Vec<u8>, usize)>;

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> mpsc::Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only if the caller gave up on this stream.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// Wait for a reader thread to hit EOF. If the pipe is still open after
/// [`OUTPUT_GRACE`], processes left behind by the child are holding it: kill
/// the group and take whatever was read.
fn collect_output(rx: &mpsc::Receiver<Captured>, pid: u32, stream: &str) -> Captured {
    match rx.recv_timeout(OUTPUT_GRACE) {
        Ok(captured) => return captured,
        Err(RecvTimeoutError::Disconnected) => {
            return Err(anyhow!("{stream} reader thread panicked"));
        }
        Err(RecvTimeoutError::Timeout) => {}
    }
    warn!(stream, "output still open after exit, killing leftover processes");
    kill_process_group(pid);
    match rx.recv_timeout(OUTPUT_GRACE) {
        Ok(captured) => captured,
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("{stream} reader thread panicked")),
        Err(RecvTimeoutError::Timeout) => {
            warn!(stream, "abandoning output reader");
            Ok((Vec::new(), 0))
        }
    }
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_: &mut Command) {}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, err = %err, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_: u32) {}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(kept.len()));
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    Ok((kept, dropped))
}
