use crate::{Invocation, ProcessRunner, RunResult, RunnerError, child_env};
use fsd_core::{EnvSnapshot, vars};
use fsd_stage::Stage;
use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_STREAM_CAP_BYTES: usize = 16 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// How long stream readers may lag behind the child once the deadline has passed.
const READER_GRACE: Duration = Duration::from_millis(100);
const READ_CHUNK_BYTES: usize = 8192;

/// Spawns the test program as a real child process.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    parent_env: EnvSnapshot,
    timeout: Option<Duration>,
    stream_cap: usize,
}

impl SubprocessRunner {
    #[must_use]
    pub fn new(parent_env: EnvSnapshot) -> Self {
        Self {
            parent_env,
            timeout: Some(DEFAULT_TIMEOUT),
            stream_cap: DEFAULT_STREAM_CAP_BYTES,
        }
    }

    /// Runner inheriting `env`, with the timeout taken from `TRY_RUN_TIMEOUT_SECS`.
    #[must_use]
    pub fn from_env(env: &EnvSnapshot) -> Self {
        let timeout = env
            .duration_secs(vars::TRY_RUN_TIMEOUT_SECS)
            .unwrap_or(Some(DEFAULT_TIMEOUT));
        Self::new(env.clone()).with_timeout(timeout)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stream_cap(mut self, bytes: usize) -> Self {
        self.stream_cap = bytes;
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl ProcessRunner for SubprocessRunner {
    fn run(&self, stage: &Stage, invocation: &Invocation) -> Result<RunResult, RunnerError> {
        let env = child_env(&self.parent_env, stage);
        let mut command = Command::new(&invocation.exe);
        command
            .args(&invocation.args)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(
            stage = stage.name(),
            exe = %invocation.exe.display(),
            timeout_secs = self.timeout.map(|t| t.as_secs()),
            "spawning stage child"
        );
        let started_at = Instant::now();
        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            exe: invocation.exe.clone(),
            source,
        })?;

        let stdout = spawn_reader(child.stdout.take(), self.stream_cap);
        let stderr = spawn_reader(child.stderr.take(), self.stream_cap);
        let waited = wait_with_timeout(&mut child, self.timeout);
        // Grandchildren can hold the pipes open past the child's death, so
        // the readers share the child's deadline instead of running to EOF.
        let deadline = self
            .timeout
            .map(|limit| (started_at + limit).max(Instant::now()) + READER_GRACE);
        let stdout = collect_reader(stdout, "stdout", deadline)?;
        let stderr = collect_reader(stderr, "stderr", deadline)?;
        let (status, timed_out) = waited?;

        for (label, capture) in [("stdout", &stdout), ("stderr", &stderr)] {
            if capture.abandoned {
                warn!(
                    stage = stage.name(),
                    stream = label,
                    "child stream still open after the deadline; capture abandoned"
                );
            } else if capture.total_bytes > capture.bytes.len() {
                warn!(
                    stage = stage.name(),
                    stream = label,
                    total_bytes = capture.total_bytes,
                    kept_bytes = capture.bytes.len(),
                    "child stream exceeded capture cap; kept the tail"
                );
            }
        }

        let mut exit_code = exit_code_of(status);
        if timed_out {
            warn!(stage = stage.name(), "stage child timed out and was killed");
            if exit_code >= 0 {
                exit_code = -1;
            }
        }
        debug!(stage = stage.name(), exit_code, timed_out, "stage child exited");

        Ok(RunResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            timed_out,
        })
    }
}

/// Exit code with signal deaths mapped to `-signal`.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<(ExitStatus, bool), RunnerError> {
    let started_at = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status, false)),
            Ok(None) => {}
            Err(error) => {
                terminate_and_reap_child(child);
                return Err(RunnerError::Wait(error));
            }
        }
        if timeout.is_some_and(|limit| started_at.elapsed() >= limit) {
            let _ = child.kill();
            let status = child.wait().map_err(RunnerError::Wait)?;
            return Ok((status, true));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn terminate_and_reap_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Debug, Default)]
struct CappedCapture {
    bytes: Vec<u8>,
    total_bytes: usize,
    abandoned: bool,
}

type ReaderHandle = Option<Receiver<Result<CappedCapture, String>>>;

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>, cap: usize) -> ReaderHandle {
    stream.map(|stream| {
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = sender.send(read_tail_capped(stream, cap));
        });
        receiver
    })
}

/// Wait for a reader until `deadline`. A reader still blocked past it is
/// left behind and its capture reported as abandoned.
fn collect_reader(
    handle: ReaderHandle,
    stream: &'static str,
    deadline: Option<Instant>,
) -> Result<CappedCapture, RunnerError> {
    let Some(receiver) = handle else {
        return Ok(CappedCapture::default());
    };
    let received = match deadline {
        Some(deadline) => {
            match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(received) => received,
                Err(RecvTimeoutError::Timeout) => {
                    return Ok(CappedCapture {
                        abandoned: true,
                        ..CappedCapture::default()
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(reader_panicked(stream)),
            }
        }
        None => receiver.recv().map_err(|_| reader_panicked(stream))?,
    };
    received.map_err(|detail| RunnerError::Capture { stream, detail })
}

fn reader_panicked(stream: &'static str) -> RunnerError {
    RunnerError::Capture {
        stream,
        detail: "reader thread panicked".to_owned(),
    }
}

/// Drain `reader` to EOF, keeping at most the last `cap` bytes.
fn read_tail_capped<R: Read>(mut reader: R, cap: usize) -> Result<CappedCapture, String> {
    let mut kept = VecDeque::with_capacity(cap.min(READ_CHUNK_BYTES));
    let mut total_bytes = 0usize;
    let mut chunk = [0_u8; READ_CHUNK_BYTES];
    loop {
        let read_len = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read_len) => read_len,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error.to_string()),
        };
        total_bytes = total_bytes.saturating_add(read_len);
        kept.extend(&chunk[..read_len]);
        if kept.len() > cap {
            let excess = kept.len() - cap;
            kept.drain(..excess);
        }
    }
    Ok(CappedCapture {
        bytes: kept.into(),
        total_bytes,
        abandoned: false,
    })
}
