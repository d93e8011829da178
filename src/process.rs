//! Child-process execution with a hard timeout.
//!
//! Input is fed and output pipes are drained on helper threads so a child
//! can't stall the caller on a full pipe. The calling thread owns the `Child`
//! and polls it, killing it once the deadline passes.

use std::{
    io::{ErrorKind, Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Cap on captured bytes per stream.
const MAX_CAPTURE: u64 = 64 * 1024;

/// Errors from running a child process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("I/O error talking to '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit code, with signal deaths reported as `-1`.
    pub fn code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec<'a> {
    pub argv: &'a [String],
    pub cwd: Option<&'a Path>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<&'a [u8]>,
}

impl<'a> ProcessSpec<'a> {
    pub fn new(argv: &'a [String]) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cwd(mut self, cwd: &'a Path) -> Self {
        self.cwd = Some(cwd);
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }
}

/// Runs `spec` to completion or kills it at `timeout`.
pub fn run_with_timeout(spec: &ProcessSpec<'_>, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
    let (program, args) = spec.argv.split_first().ok_or(ProcessError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;
    let started = Instant::now();
    debug!(program, pid = child.id(), "spawned");

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    // Input goes through its own thread: a child that never reads must not
    // hold the caller past the deadline.
    if let Some(input) = spec.stdin
        && let Some(pipe) = child.stdin.take()
    {
        feed(program, pipe, input.to_vec());
    }

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() >= timeout => {
                warn!(program, ?timeout, "killing child after timeout");
                kill(&mut child);
                return Err(ProcessError::Timeout {
                    program: program.clone(),
                    timeout,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                kill(&mut child);
                return Err(ProcessError::Io {
                    program: program.clone(),
                    source,
                });
            }
        }
    };

    Ok(ProcessOutput {
        exit_code: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

/// Spawns `argv` and returns without waiting for it. Input is written before
/// returning, so it must fit in the pipe buffer; the child is reaped on a
/// helper thread.
pub fn spawn_detached(argv: &[String], cwd: &Path, stdin: &[u8]) -> Result<u32, ProcessError> {
    let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
    let pid = child.id();

    if let Some(mut pipe) = child.stdin.take()
        && let Err(e) = pipe.write_all(stdin)
        && e.kind() != ErrorKind::BrokenPipe
    {
        kill(&mut child);
        return Err(ProcessError::Io {
            program: program.clone(),
            source: e,
        });
    }

    thread::spawn(move || {
        let _ = child.wait();
    });
    debug!(program, pid, "spawned detached");
    Ok(pid)
}

fn feed(program: &str, mut pipe: ChildStdin, input: Vec<u8>) {
    let program = program.to_string();
    thread::spawn(move || {
        // A child that exits without reading its input closes the pipe early.
        if let Err(e) = pipe.write_all(&input)
            && e.kind() != ErrorKind::BrokenPipe
        {
            warn!(program, error = %e, "failed to write child stdin");
        }
    });
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let mut limited = pipe.take(MAX_CAPTURE);
            let _ = limited.read_to_end(&mut buf);
            // Keep draining so the child never blocks on a full pipe.
            let _ = std::io::copy(&mut limited.into_inner(), &mut std::io::sink());
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
