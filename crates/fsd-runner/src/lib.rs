#![forbid(unsafe_code)]

//! Out-of-process execution of one stage of the current test program.
//!
//! A [`ProcessRunner`] re-invokes the test executable with the stage's
//! configuration exported into the child environment. The gates built on top
//! of it decide whether the in-process run is skipped, short-circuited, or
//! replaced by a crash report.

pub mod crash;
pub mod gates;
pub mod process;

pub use crash::{CRASH_TAIL_BYTES, CrashReportLedger, stderr_tail};
pub use gates::{SkipDecision, SkipGate, TryRunGate, TryRunVerdict};
pub use process::{DEFAULT_STREAM_CAP_BYTES, DEFAULT_TIMEOUT, SubprocessRunner};

use fsd_core::{EnvSnapshot, vars};
use fsd_stage::Stage;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;

/// Executable and argument vector used to re-invoke the test program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub exe: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new<I, S>(exe: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            exe: exe.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The running executable with its own arguments.
    pub fn current() -> Result<Self, RunnerError> {
        let exe = std::env::current_exe().map_err(RunnerError::CurrentExe)?;
        Ok(Self {
            exe,
            args: std::env::args_os().skip(1).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl RunResult {
    #[must_use]
    pub fn exited(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.exit_code == 0
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.exit_code > 0
    }

    #[must_use]
    pub fn is_crash(&self) -> bool {
        self.exit_code < 0
    }
}

#[derive(Debug)]
pub enum RunnerError {
    CurrentExe(io::Error),
    Spawn { exe: PathBuf, source: io::Error },
    Wait(io::Error),
    Capture { stream: &'static str, detail: String },
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CurrentExe(source) => {
                write!(f, "cannot locate the running executable: {source}")
            }
            Self::Spawn { exe, source } => {
                write!(f, "failed to spawn {}: {source}", exe.display())
            }
            Self::Wait(source) => write!(f, "child process wait failed: {source}"),
            Self::Capture { stream, detail } => {
                write!(f, "child {stream} capture failed: {detail}")
            }
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CurrentExe(source) | Self::Wait(source) | Self::Spawn { source, .. } => {
                Some(source)
            }
            Self::Capture { .. } => None,
        }
    }
}

/// Runs the test program once under a given stage.
pub trait ProcessRunner {
    fn run(&self, stage: &Stage, invocation: &Invocation) -> Result<RunResult, RunnerError>;
}

/// Environment for a child running `stage`.
///
/// Same view as [`Stage::active_env`], except the child never diffs against
/// earlier stages and never try-runs again.
#[must_use]
pub fn child_env(parent: &EnvSnapshot, stage: &Stage) -> EnvSnapshot {
    let mut env = stage.active_env(parent);
    env.set(vars::STAGE_ENABLE_DIFF, "0");
    env.set(vars::TRY_RUN_ENABLED, "0");
    env
}
