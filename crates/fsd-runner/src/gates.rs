use crate::{CrashReportLedger, Invocation, ProcessRunner, RunResult};
use fsd_stage::{Stage, StageSequence};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: String,
}

impl SkipDecision {
    #[must_use]
    pub fn proceed() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip: true,
            reason: reason.into(),
        }
    }
}

/// Skips a stage whose predecessor already fails, so the report names the
/// stage that introduced a regression rather than every stage after it.
pub struct SkipGate<'a, R: ProcessRunner + ?Sized> {
    pipeline: &'a StageSequence,
    runner: &'a R,
    invocation: &'a Invocation,
    diff_enabled: bool,
}

impl<'a, R: ProcessRunner + ?Sized> SkipGate<'a, R> {
    pub fn new(
        pipeline: &'a StageSequence,
        runner: &'a R,
        invocation: &'a Invocation,
        diff_enabled: bool,
    ) -> Self {
        Self {
            pipeline,
            runner,
            invocation,
            diff_enabled,
        }
    }

    pub fn should_skip(&self, stage: &Stage) -> SkipDecision {
        if !self.diff_enabled {
            return SkipDecision::proceed();
        }
        let Some(previous) = self.pipeline.previous(stage) else {
            debug!(stage = stage.name(), "first stage; nothing to diff against");
            return SkipDecision::proceed();
        };

        match self.runner.run(previous, self.invocation) {
            Ok(result) if result.exit_code != 0 => {
                info!(
                    stage = stage.name(),
                    previous = previous.name(),
                    exit_code = result.exit_code,
                    "previous stage failed; skipping"
                );
                SkipDecision::skip(format!(
                    "previous stage `{}` failed: {}",
                    previous.name(),
                    result.stderr
                ))
            }
            Ok(_) => SkipDecision::proceed(),
            Err(error) => {
                warn!(
                    stage = stage.name(),
                    previous = previous.name(),
                    %error,
                    "could not run previous stage; not skipping"
                );
                SkipDecision::proceed()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TryRunVerdict {
    /// Try-run is switched off; the case runs in process.
    Disabled,
    /// The isolated child verified every assertion.
    Passed,
    /// Ordinary failure; rerun in process to surface the mismatch.
    Failed { exit_code: i32 },
    /// The child died abnormally.
    Crashed {
        exit_code: i32,
        stderr: String,
        timed_out: bool,
    },
    /// The child could not be started; run in process instead.
    Unavailable { detail: String },
}

impl TryRunVerdict {
    #[must_use]
    pub fn runs_in_process(&self) -> bool {
        matches!(
            self,
            Self::Disabled | Self::Failed { .. } | Self::Unavailable { .. }
        )
    }

    /// Failure message for a crashed try-run, recorded in `ledger`.
    ///
    /// Each call counts as one crash report, so only the first case to
    /// surface a crash in this process carries the stderr tail.
    pub fn crash_message(&self, stage: &str, ledger: &CrashReportLedger) -> Option<String> {
        let Self::Crashed {
            exit_code,
            stderr,
            timed_out,
        } = self
        else {
            return None;
        };
        let mut message = ledger.report(stage, *exit_code, stderr);
        if *timed_out {
            message.insert_str(0, "timed out and was killed; ");
        }
        Some(message)
    }
}

/// Runs the current stage once out of process before any in-process work.
pub struct TryRunGate<'a, R: ProcessRunner + ?Sized> {
    runner: &'a R,
    invocation: &'a Invocation,
    enabled: bool,
}

impl<'a, R: ProcessRunner + ?Sized> TryRunGate<'a, R> {
    pub fn new(runner: &'a R, invocation: &'a Invocation, enabled: bool) -> Self {
        Self {
            runner,
            invocation,
            enabled,
        }
    }

    pub fn evaluate(&self, stage: &Stage) -> TryRunVerdict {
        if !self.enabled {
            return TryRunVerdict::Disabled;
        }
        match self.runner.run(stage, self.invocation) {
            Ok(result) => classify(stage, result),
            Err(error) => {
                warn!(
                    stage = stage.name(),
                    %error,
                    "try-run child unavailable; running in process"
                );
                TryRunVerdict::Unavailable {
                    detail: error.to_string(),
                }
            }
        }
    }
}

fn classify(stage: &Stage, result: RunResult) -> TryRunVerdict {
    if result.is_pass() {
        debug!(stage = stage.name(), "try-run passed");
        return TryRunVerdict::Passed;
    }
    if result.is_failure() {
        debug!(
            stage = stage.name(),
            exit_code = result.exit_code,
            "try-run failed; running in process"
        );
        return TryRunVerdict::Failed {
            exit_code: result.exit_code,
        };
    }
    warn!(
        stage = stage.name(),
        exit_code = result.exit_code,
        timed_out = result.timed_out,
        "try-run child crashed"
    );
    TryRunVerdict::Crashed {
        exit_code: result.exit_code,
        stderr: result.stderr,
        timed_out: result.timed_out,
    }
}
