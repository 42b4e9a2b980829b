//! Child processes with a wall-clock limit and bounded output capture.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the capture limit.
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How long readers may keep draining after a timed-out child was killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Run `cmd`, feeding `stdin`, and wait at most `timeout`.
///
/// stdout and stderr are drained on their own threads for the whole lifetime
/// of the child so that a chatty process never blocks on a full pipe. Only the
/// first `limit` bytes of each stream are kept.
///
/// On unix the child leads its own process group, and a timeout kills the
/// whole group. Wrapper commands (`sh -c`, `npx`) therefore cannot outlive
/// the limit through their children.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs(), limit))]
pub fn run_bounded(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    limit: usize,
) -> Result<ProcessOutput, ProcessError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd.spawn().map_err(|source| {
        error!(err = %source, program = %program, "failed to spawn process");
        ProcessError::Spawn {
            program: program.clone(),
            source,
        }
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = thread::spawn(move || drain_capped(stdout, limit));
    let stderr_reader = thread::spawn(move || drain_capped(stderr, limit));

    let stdin_writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(thread::spawn(move || match pipe.write_all(&input) {
                // The child may exit without reading everything; that is its choice.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }))
        }
        (Some(_), None) => return Err(anyhow!("stdin was not piped").into()),
        _ => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for process")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "process timed out, killing");
            timed_out = true;
            kill_tree(&mut child).context("kill process")?;
            child.wait().context("reap killed process")?
        }
    };

    if let Some(writer) = stdin_writer {
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "failed to write process stdin"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked").into()),
        }
    }
    let deadline = timed_out.then(|| Instant::now() + KILL_GRACE);
    let (stdout, stdout_dropped) =
        join_reader(stdout_reader, deadline).context("collect stdout")?;
    let (stderr, stderr_dropped) =
        join_reader(stderr_reader, deadline).context("collect stderr")?;
    if stdout_dropped > 0 || stderr_dropped > 0 {
        warn!(stdout_dropped, stderr_dropped, "process output exceeded capture limit");
    }

    debug!(exit_code = ?status.code(), timed_out, "process finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        timed_out,
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(child.id()) else {
        return child.kill();
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(errno) => {
            warn!(err = %errno, "failed to kill process group, killing child only");
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// Join a reader thread. With a `deadline`, a reader whose pipe is still held
/// open by an escaped descendant is abandoned and its output dropped.
fn join_reader(
    handle: thread::JoinHandle<std::io::Result<(Vec<u8>, usize)>>,
    deadline: Option<Instant>,
) -> anyhow::Result<(Vec<u8>, usize)> {
    if let Some(deadline) = deadline {
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("output pipe still open after kill, abandoning reader");
                return Ok((Vec::new(), 0));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    match handle.join() {
        Ok(result) => result.context("read process output"),
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read `reader` to the end, keeping at most `limit` bytes.
fn drain_capped<R: Read>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let room = limit.saturating_sub(kept.len()).min(n);
        kept.extend_from_slice(&chunk[..room]);
        dropped += n - room;
    }
    Ok((kept, dropped))
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
    fn captures_stdout_stderr_and_stdin() {
        let out = run_bounded(
            sh("cat; echo err >&2"),
            Some(b"hello"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_text(), "hello");
        assert_eq!(out.stderr_text(), "err\n");
    }

    #[test]
    fn output_beyond_limit_is_dropped() {
        let out = run_bounded(sh("printf 0123456789"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_dropped, 6);
    }

    #[test]
    fn slow_process_is_killed() {
        let out = run_bounded(sh("exec sleep 5"), None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
    }

    #[test]
    fn timeout_also_kills_children_of_a_wrapper() {
        let started = Instant::now();
        let out = run_bounded(
            sh("sleep 4; echo late"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(!out.stdout_text().contains("late"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_bounded(
            Command::new("quill-definitely-not-a-program"),
            None,
            Duration::from_secs(1),
            16,
        )
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
