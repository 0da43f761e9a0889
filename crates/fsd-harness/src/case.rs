use fsd_compare::{ComparisonSummary, Mismatch};
use fsd_core::{EnvSnapshot, Value};
use fsd_stage::Stage;
use serde::{Deserialize, Serialize};

/// Which compiled variant of a computation is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Baseline,
    Accelerated,
}

impl ExecutionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Accelerated => "accelerated",
        }
    }

    #[must_use]
    pub fn is_accelerated(self) -> bool {
        self == Self::Accelerated
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by the computation under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseError(pub String);

impl std::fmt::Display for CaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CaseError {}

impl From<String> for CaseError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CaseError {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<fsd_control::BlockError> for CaseError {
    fn from(value: fsd_control::BlockError) -> Self {
        Self(value.to_string())
    }
}

impl From<fsd_core::ValueError> for CaseError {
    fn from(value: fsd_core::ValueError) -> Self {
        Self(value.to_string())
    }
}

/// Settings one in-process execution runs under.
///
/// `env` is the environment a child process would see for the active stage,
/// so the in-process run and the try-run read the same stage config.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    mode: ExecutionMode,
    seed: u64,
    stage: Option<&'a Stage>,
    env: &'a EnvSnapshot,
}

impl<'a> RunContext<'a> {
    #[must_use]
    pub fn new(
        mode: ExecutionMode,
        seed: u64,
        stage: Option<&'a Stage>,
        env: &'a EnvSnapshot,
    ) -> Self {
        Self {
            mode,
            seed,
            stage,
            env,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn stage(&self) -> Option<&'a Stage> {
        self.stage
    }

    #[must_use]
    pub fn env(&self) -> &'a EnvSnapshot {
        self.env
    }

    /// A config key as exported by the active stage, falling back to the
    /// process environment.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&'a str> {
        self.env.get(key)
    }

    #[must_use]
    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.env.flag(key, default)
    }
}

/// A computation that can be executed once per variant.
///
/// Both executions receive the same seed so any randomness in input
/// construction is identical across them.
pub trait DifferentialCase {
    fn name(&self) -> &str;

    fn run(&self, run: &RunContext<'_>) -> Result<Vec<Value>, CaseError>;
}

/// Adapter turning a closure into a [`DifferentialCase`].
pub struct FnCase<F> {
    name: String,
    run: F,
}

impl<F> FnCase<F>
where
    F: Fn(&RunContext<'_>) -> Result<Vec<Value>, CaseError>,
{
    pub fn new(name: impl Into<String>, run: F) -> Self {
        Self {
            name: name.into(),
            run,
        }
    }
}

impl<F> DifferentialCase for FnCase<F>
where
    F: Fn(&RunContext<'_>) -> Result<Vec<Value>, CaseError>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, run: &RunContext<'_>) -> Result<Vec<Value>, CaseError> {
        (self.run)(run)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaseOutcome {
    /// Both executions ran here and agreed.
    Passed { summary: ComparisonSummary },
    /// The isolated try-run already verified the case.
    PassedOutOfProcess,
    /// An earlier stage fails, so this stage's assertions are not evaluated.
    Skipped { reason: String },
    Failed { mismatch: Mismatch },
    Crashed { message: String },
    /// The computation itself returned an error.
    Errored { mode: ExecutionMode, detail: String },
}

impl CaseOutcome {
    /// Whether a test asserting on this outcome should pass.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            Self::Passed { .. } | Self::PassedOutOfProcess | Self::Skipped { .. }
        )
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed { .. } => "passed",
            Self::PassedOutOfProcess => "passed_out_of_process",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
            Self::Crashed { .. } => "crashed",
            Self::Errored { .. } => "errored",
        }
    }
}

impl std::fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed { summary } => write!(
                f,
                "passed ({} outputs, {} elements compared)",
                summary.outputs, summary.elements
            ),
            Self::PassedOutOfProcess => write!(f, "passed in isolated try-run"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Failed { mismatch } => write!(f, "failed: {mismatch}"),
            Self::Crashed { message } => write!(f, "crashed: {message}"),
            Self::Errored { mode, detail } => write!(f, "{mode} execution errored: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CaseError, CaseOutcome, DifferentialCase, ExecutionMode, FnCase, RunContext};
    use fsd_compare::ComparisonSummary;
    use fsd_core::{EnvSnapshot, Value};
    use fsd_stage::Stage;

    #[test]
    fn fn_case_forwards_mode_and_seed() {
        let case = FnCase::new("echo", |run: &RunContext<'_>| {
            Ok(vec![
                Value::scalar_bool(run.mode().is_accelerated()),
                Value::scalar_i64(i64::try_from(run.seed()).map_err(|e| e.to_string())?),
            ])
        });
        let env = EnvSnapshot::empty();
        assert_eq!(case.name(), "echo");
        assert_eq!(
            case.run(&RunContext::new(ExecutionMode::Accelerated, 7, None, &env)),
            Ok(vec![Value::scalar_bool(true), Value::scalar_i64(7)])
        );
    }

    #[test]
    fn run_context_reads_stage_config_from_active_env() {
        let stage = Stage::new("frontend").with("ENABLE_FUSION_FALLBACK", true);
        let env = stage.active_env(&EnvSnapshot::from_pairs([("HOME", "/root")]));
        let run = RunContext::new(ExecutionMode::Baseline, 0, Some(&stage), &env);
        assert_eq!(run.config("ENABLE_FUSION_FALLBACK"), Some("true"));
        assert!(run.flag("ENABLE_FUSION_FALLBACK", false));
        assert_eq!(run.config("HOME"), Some("/root"));
        assert_eq!(run.stage().map(Stage::name), Some("frontend"));
    }

    #[test]
    fn skipped_and_out_of_process_count_as_ok() {
        assert!(CaseOutcome::PassedOutOfProcess.is_ok());
        assert!(
            CaseOutcome::Skipped {
                reason: "x".to_owned()
            }
            .is_ok()
        );
        assert!(
            CaseOutcome::Passed {
                summary: ComparisonSummary::default()
            }
            .is_ok()
        );
        assert!(
            !CaseOutcome::Crashed {
                message: "m".to_owned()
            }
            .is_ok()
        );
        let errored = CaseOutcome::Errored {
            mode: ExecutionMode::Baseline,
            detail: "bad input".to_owned(),
        };
        assert!(!errored.is_ok());
        assert_eq!(errored.to_string(), "baseline execution errored: bad input");
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(CaseOutcome::Skipped {
            reason: "previous stage `b` failed: boom".to_owned(),
        })
        .expect("serialize");
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "previous stage `b` failed: boom");
    }

    #[test]
    fn case_error_converts_from_strings() {
        let err: CaseError = "oops".into();
        assert_eq!(err.to_string(), "oops");
    }
}
