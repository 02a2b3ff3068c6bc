//! Child process plumbing with timeouts and bounded output.
//!
//! Used by the command runner, the git adapter and the process-backed chat
//! client. Output is drained on reader threads started before any input is
//! written, so neither a chatty child nor a large prompt can deadlock on a
//! full pipe. On unix each child leads its own process group and a timeout
//! kills the whole group.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        text
    }
}

type Tee = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command with a timeout and capture stdout/stderr.
///
/// `output_limit_bytes` bounds the amount of each stream kept in memory;
/// bytes beyond the limit are discarded while the pipe is still drained.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_child(cmd, stdin, timeout, output_limit_bytes, None)
}

/// Like [`run_command_with_timeout`], additionally copying each stdout line to
/// `transcript_path` as it arrives.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, transcript = %transcript_path.display()))]
pub fn run_command_with_transcript(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    transcript_path: &Path,
) -> Result<CommandOutput> {
    if let Some(parent) = transcript_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create transcript dir {}", parent.display()))?;
    }
    let file = File::create(transcript_path)
        .with_context(|| format!("create transcript {}", transcript_path.display()))?;
    run_child(
        cmd,
        stdin,
        timeout,
        output_limit_bytes,
        Some(Mutex::new(BufWriter::new(file))),
    )
}

fn run_child(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee: Option<Mutex<BufWriter<File>>>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let tee: Tee = Arc::new(tee);
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, &tee));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // A child that exits without reading stdin closes the pipe early.
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "child closed stdin before input was written");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_process_tree(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// Kill the child's process group so grandchildren holding the output pipes
/// die with it. Falls back to killing the direct child.
fn kill_process_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        let group = format!("kill -KILL -- -{}", child.id());
        match Command::new("sh")
            .arg("-c")
            .arg(&group)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => warn!(%status, "process group kill failed; killing child only"),
            Err(e) => warn!(err = %e, "process group kill failed; killing child only"),
        }
    }
    child.kill().context("kill command")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(reader: R, limit: usize, tee: &Tee) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(mutex) = &**tee
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write transcript");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush transcript");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}
