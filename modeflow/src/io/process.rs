//! Child process execution with a timeout and bounded captured output.
//!
//! On unix the child leads its own process group, so a timeout kills every
//! process it spawned rather than only the direct child.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the output limit, per stream.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        with_notice(&self.stdout, self.stdout_truncated)
    }

    pub fn stderr_lossy(&self) -> String {
        with_notice(&self.stderr, self.stderr_truncated)
    }
}

/// How long to wait for output pipes to close once the child has exited.
/// A background process that inherited them can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const DRAIN_POLL: Duration = Duration::from_millis(10);

fn with_notice(bytes: &[u8], truncated: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[truncated {truncated} bytes]\n"));
    }
    text
}

/// Run `cmd` to completion or until `timeout`, killing it on expiry.
///
/// Both pipes are drained on reader threads while the child runs so a chatty
/// process cannot deadlock on a full pipe. Bytes beyond `output_limit_bytes`
/// are counted and discarded. Once the child exits the pipes get a short
/// grace period to close; whatever was captured by then is returned.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
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

    let started = Instant::now();
    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping closes the pipe so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = Reader::spawn(stdout, output_limit_bytes);
    let stderr_reader = Reader::spawn(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let drain_deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_truncated) = stdout_reader.finish(drain_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) = stderr_reader.finish(drain_deadline).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

/// Kill the child's whole process group, falling back to the child alone.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_tree(child: &mut Child) -> Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return child.kill().context("kill child");
    };
    // SAFETY: kill(2) takes plain integers; a negative pid targets the group
    // created by `process_group(0)`, whose id equals the child's pid.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, "process group kill failed; killing child only");
        return child.kill().context("kill child");
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill child")
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Drains one output pipe on its own thread into a shared buffer.
struct Reader {
    captured: Arc<Mutex<Captured>>,
    handle: thread::JoinHandle<Result<()>>,
}

impl Reader {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let handle = thread::spawn(move || read_limited(reader, limit, &sink));
        Self { captured, handle }
    }

    /// Join the reader, or leave it detached if it is still blocked on the
    /// pipe at `deadline`.
    fn finish(self, deadline: Instant) -> Result<(Vec<u8>, usize)> {
        while !self.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
        if self.handle.is_finished() {
            match self.handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("output reader thread panicked"),
            }
        } else {
            warn!("output pipe still open after exit; keeping partial output");
        }
        let mut captured = self
            .captured
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let Captured { bytes, truncated } = std::mem::take(&mut *captured);
        Ok((bytes, truncated))
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink
            .lock()
            .map_err(|_| anyhow!("output buffer lock poisoned"))?;
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_exit_code() {
        let out = run_with_timeout(sh("echo hi; echo oops >&2; exit 3"), None, Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_lossy(), "hi\n");
        assert_eq!(out.stderr_lossy(), "oops\n");
        assert!(!out.timed_out);
    }

    #[test]
    fn pipes_stdin() {
        let out = run_with_timeout(sh("cat"), Some(b"payload"), Duration::from_secs(10), 1024)
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"payload");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_lossy().contains("[truncated 6 bytes]"));
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let out = run_with_timeout(sh("sleep 4 | cat"), None, Duration::from_millis(200), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(2), "took {:?}", out.elapsed);
    }

    #[test]
    fn output_written_before_timeout_is_kept() {
        let out = run_with_timeout(sh("echo started; sleep 4"), None, Duration::from_millis(300), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.stdout_lossy(), "started\n");
    }

    #[test]
    fn background_process_does_not_hold_the_result() {
        let out = run_with_timeout(sh("echo done; sleep 4 &"), None, Duration::from_secs(10), 1024)
            .expect("run");
        assert!(!out.timed_out);
        assert!(out.status.success());
        assert_eq!(out.stdout_lossy(), "done\n");
        assert!(out.elapsed < Duration::from_secs(2), "took {:?}", out.elapsed);
    }
}
