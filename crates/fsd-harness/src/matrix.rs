//! Run one test executable under every stage of a pipeline.

use fsd_runner::{Invocation, ProcessRunner, RunResult, RunnerError, stderr_tail};
use fsd_stage::StageSequence;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Bytes of stderr kept per stage in a matrix report.
pub const REPORT_STDERR_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pass,
    Fail,
    Crash,
    Timeout,
}

impl StageStatus {
    #[must_use]
    pub fn classify(result: &RunResult) -> Self {
        if result.timed_out {
            Self::Timeout
        } else if result.is_pass() {
            Self::Pass
        } else if result.is_failure() {
            Self::Fail
        } else {
            Self::Crash
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Crash => "crash",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub exit_code: i32,
    pub stderr_tail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixReport {
    pub exe: String,
    pub stages: Vec<StageReport>,
    /// Earliest stage, in pipeline order, that did not pass.
    pub first_failing_stage: Option<String>,
}

impl MatrixReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.first_failing_stage.is_none()
    }
}

pub fn run_matrix<R: ProcessRunner + ?Sized>(
    pipeline: &StageSequence,
    runner: &R,
    invocation: &Invocation,
) -> Result<MatrixReport, RunnerError> {
    let mut stages = Vec::with_capacity(pipeline.len());
    for stage in pipeline {
        let result = runner.run(stage, invocation)?;
        let status = StageStatus::classify(&result);
        info!(
            stage = stage.name(),
            status = status.as_str(),
            exit_code = result.exit_code,
            "stage finished"
        );
        stages.push(StageReport {
            stage: stage.name().to_owned(),
            status,
            exit_code: result.exit_code,
            stderr_tail: stderr_tail(&result.stderr, REPORT_STDERR_BYTES).to_owned(),
        });
    }
    let first_failing_stage = stages
        .iter()
        .find(|report| report.status != StageStatus::Pass)
        .map(|report| report.stage.clone());
    Ok(MatrixReport {
        exe: invocation.exe.display().to_string(),
        stages,
        first_failing_stage,
    })
}
