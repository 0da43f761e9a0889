#![forbid(unsafe_code)]

//! Staged differential testing.
//!
//! A test program calls [`run_case`] for each computation it checks. On first
//! use the harness resolves the active stage, asks whether the previous stage
//! already fails, and try-runs the current stage in an isolated child. Only
//! when neither gate settles the outcome does it execute the computation in
//! process, once on the baseline path and once accelerated, and compare.

pub mod case;
pub mod matrix;
pub mod variant;

pub use case::{CaseError, CaseOutcome, DifferentialCase, ExecutionMode, FnCase, RunContext};
pub use variant::{VariantCache, VariantKey};

use fsd_compare::{TolerancePolicy, compare_outputs};
use fsd_control::{BlockError, FnBlock, LoopBlock, loop_cap_from_env};
use fsd_core::{EnvSnapshot, vars};
use fsd_runner::{
    CrashReportLedger, Invocation, ProcessRunner, RunnerError, SkipDecision, SkipGate,
    SubprocessRunner, TryRunGate, TryRunVerdict,
};
use fsd_stage::{Stage, StageError, StageSequence, default_pipeline};
use std::sync::OnceLock;
use tracing::{error, info};

/// Seed handed to both executions of every case.
pub const DEFAULT_SEED: u64 = 2024;

/// Exit code used when the harness configuration is unusable.
pub const CONFIG_ERROR_EXIT_CODE: i32 = 2;

#[derive(Debug)]
pub enum HarnessError {
    Stage(StageError),
    Runner(RunnerError),
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage(err) => write!(f, "stage configuration error: {err}"),
            Self::Runner(err) => write!(f, "runner setup error: {err}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stage(err) => Some(err),
            Self::Runner(err) => Some(err),
        }
    }
}

impl From<StageError> for HarnessError {
    fn from(value: StageError) -> Self {
        Self::Stage(value)
    }
}

impl From<RunnerError> for HarnessError {
    fn from(value: RunnerError) -> Self {
        Self::Runner(value)
    }
}

/// Settings resolved from the environment for one test process.
#[derive(Debug, Clone)]
pub struct HarnessContext {
    env: EnvSnapshot,
    stage_env: EnvSnapshot,
    pipeline: StageSequence,
    stage: Option<Stage>,
    invocation: Invocation,
    tolerance: TolerancePolicy,
    diff_enabled: bool,
    try_run_enabled: bool,
    acceleration_enabled: bool,
    loop_cap: usize,
    seed: u64,
}

impl HarnessContext {
    pub fn from_env(
        env: EnvSnapshot,
        pipeline: StageSequence,
        invocation: Invocation,
    ) -> Result<Self, HarnessError> {
        let stage = pipeline.current(&env)?.cloned();
        let stage_env = stage
            .as_ref()
            .map_or_else(|| env.clone(), |stage| stage.active_env(&env));
        let context = Self {
            stage_env,
            tolerance: TolerancePolicy::from_env(&env),
            diff_enabled: env.flag(vars::STAGE_ENABLE_DIFF, false),
            try_run_enabled: env.flag(vars::TRY_RUN_ENABLED, true),
            acceleration_enabled: env.flag(vars::ACCELERATION_ENABLED, true),
            loop_cap: loop_cap_from_env(&env),
            seed: DEFAULT_SEED,
            stage,
            pipeline,
            invocation,
            env,
        };
        info!(
            stage = context.stage_name().unwrap_or("<none>"),
            diff = context.diff_enabled,
            try_run = context.try_run_enabled,
            accelerated = context.acceleration_enabled,
            "harness configured"
        );
        Ok(context)
    }

    /// Context for the running test program with the default stage catalogue.
    pub fn from_process() -> Result<Self, HarnessError> {
        Self::from_env(
            EnvSnapshot::from_process(),
            default_pipeline(),
            Invocation::current()?,
        )
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    /// Environment with the active stage's config applied. In-process runs
    /// read this, matching what a try-run child sees.
    #[must_use]
    pub fn stage_env(&self) -> &EnvSnapshot {
        &self.stage_env
    }

    #[must_use]
    pub fn pipeline(&self) -> &StageSequence {
        &self.pipeline
    }

    #[must_use]
    pub fn stage(&self) -> Option<&Stage> {
        self.stage.as_ref()
    }

    #[must_use]
    pub fn stage_name(&self) -> Option<&str> {
        self.stage.as_ref().map(Stage::name)
    }

    #[must_use]
    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    #[must_use]
    pub fn tolerance(&self) -> &TolerancePolicy {
        &self.tolerance
    }

    #[must_use]
    pub fn diff_enabled(&self) -> bool {
        self.diff_enabled
    }

    #[must_use]
    pub fn try_run_enabled(&self) -> bool {
        self.try_run_enabled
    }

    #[must_use]
    pub fn acceleration_enabled(&self) -> bool {
        self.acceleration_enabled
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn loop_cap(&self) -> usize {
        self.loop_cap
    }

    /// Mode used for the second execution. With acceleration switched off
    /// both executions take the baseline path.
    #[must_use]
    pub fn accelerated_mode(&self) -> ExecutionMode {
        if self.acceleration_enabled {
            ExecutionMode::Accelerated
        } else {
            ExecutionMode::Baseline
        }
    }

    /// Variant key for `mode` under the active stage.
    #[must_use]
    pub fn variant_key(&self, mode: ExecutionMode) -> VariantKey {
        VariantKey::new(self.stage_name(), mode.is_accelerated())
    }

    /// Loop block capped by this process's `WHILE_LOOP_LIMIT`.
    pub fn loop_block(&self, body: FnBlock) -> Result<LoopBlock, BlockError> {
        LoopBlock::new(body, self.loop_cap)
    }
}

/// Report a configuration error and terminate the test process.
pub fn abort_on_config_error(err: &HarnessError) -> ! {
    error!(%err, "aborting on harness configuration error");
    eprintln!("fsd-harness: {err}");
    std::process::exit(CONFIG_ERROR_EXIT_CODE)
}

/// Gate verdicts for the active stage. Computed once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub skip: SkipDecision,
    pub try_run: TryRunVerdict,
}

impl Preflight {
    /// No active stage: nothing to gate, every case runs in process.
    #[must_use]
    pub fn ungated() -> Self {
        Self {
            skip: SkipDecision::proceed(),
            try_run: TryRunVerdict::Disabled,
        }
    }

    pub fn compute<R: ProcessRunner + ?Sized>(context: &HarnessContext, runner: &R) -> Self {
        let Some(stage) = context.stage() else {
            return Self::ungated();
        };
        let skip = SkipGate::new(
            context.pipeline(),
            runner,
            context.invocation(),
            context.diff_enabled(),
        )
        .should_skip(stage);
        if skip.skip {
            // A skipped stage never runs its assertions, so there is nothing to try-run.
            return Self {
                skip,
                try_run: TryRunVerdict::Disabled,
            };
        }
        let try_run = TryRunGate::new(runner, context.invocation(), context.try_run_enabled())
            .evaluate(stage);
        Self { skip, try_run }
    }
}

/// Resolved context plus its preflight verdicts.
#[derive(Debug, Clone)]
pub struct Harness {
    context: HarnessContext,
    preflight: Preflight,
}

static SHARED: OnceLock<Harness> = OnceLock::new();

impl Harness {
    #[must_use]
    pub fn new(context: HarnessContext, preflight: Preflight) -> Self {
        Self { context, preflight }
    }

    pub fn prepare<R: ProcessRunner + ?Sized>(context: HarnessContext, runner: &R) -> Self {
        let preflight = Preflight::compute(&context, runner);
        Self::new(context, preflight)
    }

    /// Process-wide harness built from the real environment on first use.
    /// Configuration errors terminate the process.
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| match HarnessContext::from_process() {
            Ok(context) => {
                let runner = SubprocessRunner::from_env(context.env());
                Self::prepare(context, &runner)
            }
            Err(err) => abort_on_config_error(&err),
        })
    }

    #[must_use]
    pub fn context(&self) -> &HarnessContext {
        &self.context
    }

    #[must_use]
    pub fn preflight(&self) -> &Preflight {
        &self.preflight
    }

    pub fn run_case(
        &self,
        case: &dyn DifferentialCase,
        ledger: &CrashReportLedger,
    ) -> CaseOutcome {
        if self.preflight.skip.skip {
            return CaseOutcome::Skipped {
                reason: self.preflight.skip.reason.clone(),
            };
        }
        match &self.preflight.try_run {
            TryRunVerdict::Passed => return CaseOutcome::PassedOutOfProcess,
            crashed @ TryRunVerdict::Crashed { .. } => {
                let stage = self.context.stage_name().unwrap_or_default();
                if let Some(message) = crashed.crash_message(stage, ledger) {
                    return CaseOutcome::Crashed { message };
                }
            }
            TryRunVerdict::Disabled
            | TryRunVerdict::Failed { .. }
            | TryRunVerdict::Unavailable { .. } => {}
        }
        self.run_in_process(case)
    }

    fn run_context(&self, mode: ExecutionMode) -> RunContext<'_> {
        RunContext::new(
            mode,
            self.context.seed(),
            self.context.stage(),
            self.context.stage_env(),
        )
    }

    /// Execute `case` twice in this process under the active stage's config
    /// and compare the results.
    pub fn run_in_process(&self, case: &dyn DifferentialCase) -> CaseOutcome {
        let baseline = match case.run(&self.run_context(ExecutionMode::Baseline)) {
            Ok(outputs) => outputs,
            Err(err) => {
                return CaseOutcome::Errored {
                    mode: ExecutionMode::Baseline,
                    detail: err.to_string(),
                };
            }
        };
        let mode = self.context.accelerated_mode();
        let accelerated = match case.run(&self.run_context(mode)) {
            Ok(outputs) => outputs,
            Err(err) => {
                return CaseOutcome::Errored {
                    mode,
                    detail: err.to_string(),
                };
            }
        };
        match compare_outputs(&baseline, &accelerated, self.context.tolerance()) {
            Ok(summary) => CaseOutcome::Passed { summary },
            Err(mismatch) => {
                error!(case = case.name(), %mismatch, "differential mismatch");
                CaseOutcome::Failed { mismatch }
            }
        }
    }
}

/// Run `case` against the process-wide harness.
pub fn run_case(case: &dyn DifferentialCase) -> CaseOutcome {
    Harness::shared().run_case(case, CrashReportLedger::global())
}

#[cfg(test)]
mod tests {
    use super::{
        CaseError, CaseOutcome, ExecutionMode, FnCase, Harness, HarnessContext, HarnessError,
        Preflight, RunContext, VariantKey,
    };
    use fsd_compare::{DEFAULT_HALF_TOLERANCE, MismatchKind};
    use fsd_core::{DType, EnvSnapshot, Shape, Value, vars};
    use fsd_runner::{CrashReportLedger, Invocation, SkipDecision, TryRunVerdict};
    use fsd_stage::{
        ENABLE_FUSION_FALLBACK, StageError, USE_ACCELERATED_BACKEND, default_pipeline,
    };
    use proptest::prelude::*;

    fn context(env: EnvSnapshot) -> HarnessContext {
        HarnessContext::from_env(
            env,
            default_pipeline(),
            Invocation::new("/bin/true", Vec::<String>::new()),
        )
        .expect("valid context")
    }

    fn harness(env: EnvSnapshot, try_run: TryRunVerdict) -> Harness {
        Harness::new(
            context(env),
            Preflight {
                skip: SkipDecision::proceed(),
                try_run,
            },
        )
    }

    fn f32_case(
        delta: f64,
    ) -> FnCase<impl Fn(&RunContext<'_>) -> Result<Vec<Value>, CaseError>> {
        FnCase::new("f32_add", move |run: &RunContext<'_>| {
            let offset = if run.mode().is_accelerated() { delta } else { 0.0 };
            let values = [1.0 + offset, 2.0, 3.0];
            Ok(vec![Value::tensor_f64(DType::F32, Shape::vector(3), &values)?])
        })
    }

    #[test]
    fn defaults_match_documented_settings() {
        let ctx = context(EnvSnapshot::empty());
        assert_eq!(ctx.stage(), None);
        assert!(!ctx.diff_enabled());
        assert!(ctx.try_run_enabled());
        assert!(ctx.acceleration_enabled());
        assert_eq!(ctx.seed(), 2024);
        assert_eq!(ctx.loop_cap(), 128);
        assert_eq!(ctx.accelerated_mode(), ExecutionMode::Accelerated);
    }

    #[test]
    fn unknown_stage_is_a_configuration_error() {
        let err = HarnessContext::from_env(
            EnvSnapshot::from_pairs([(vars::STAGE_NAME, "nonexistent")]),
            default_pipeline(),
            Invocation::new("/bin/true", Vec::<String>::new()),
        )
        .expect_err("unknown stage");
        assert!(matches!(
            err,
            HarnessError::Stage(StageError::NotFound { .. })
        ));
        let message = err.to_string();
        for name in ["dynamic_to_static", "prim", "infer_symbolic", "frontend", "backend"] {
            assert!(message.contains(name), "{message}");
        }
    }

    #[test]
    fn env_settings_flow_into_context() {
        let env = EnvSnapshot::from_pairs([
            (vars::STAGE_NAME, "prim"),
            (vars::STAGE_ENABLE_DIFF, "1"),
            (vars::TRY_RUN_ENABLED, "False"),
            (vars::ACCELERATION_ENABLED, "off"),
            (vars::WHILE_LOOP_LIMIT, "9"),
        ]);
        let ctx = context(env);
        assert_eq!(ctx.stage_name(), Some("prim"));
        assert!(ctx.diff_enabled());
        assert!(!ctx.try_run_enabled());
        assert_eq!(ctx.accelerated_mode(), ExecutionMode::Baseline);
        assert_eq!(ctx.loop_cap(), 9);
        assert_eq!(
            ctx.variant_key(ExecutionMode::Accelerated),
            VariantKey::new(Some("prim"), true)
        );
    }

    #[test]
    fn no_stage_means_ungated_preflight() {
        let ctx = context(EnvSnapshot::empty());
        struct Unreachable;
        impl fsd_runner::ProcessRunner for Unreachable {
            fn run(
                &self,
                _: &fsd_stage::Stage,
                _: &Invocation,
            ) -> Result<fsd_runner::RunResult, fsd_runner::RunnerError> {
                panic!("no child should be spawned without an active stage")
            }
        }
        assert_eq!(Preflight::compute(&ctx, &Unreachable), Preflight::ungated());
    }

    #[test]
    fn in_process_run_passes_within_tolerance() {
        let harness = harness(EnvSnapshot::empty(), TryRunVerdict::Disabled);
        let outcome = harness.run_case(&f32_case(1e-7), &CrashReportLedger::new());
        assert!(matches!(outcome, CaseOutcome::Passed { summary } if summary.elements == 3));
    }

    #[test]
    fn in_process_run_reports_mismatch() {
        let harness = harness(EnvSnapshot::empty(), TryRunVerdict::Failed { exit_code: 1 });
        let mismatch = match harness.run_case(&f32_case(1e-2), &CrashReportLedger::new()) {
            CaseOutcome::Failed { mismatch } => mismatch,
            other => panic!("expected failure, got {other:?}"),
        };
        assert!(matches!(mismatch.kind, MismatchKind::Element { index: 0, .. }));
    }

    #[test]
    fn tolerance_override_comes_from_env() {
        let env = EnvSnapshot::from_pairs([(vars::FLOAT32_TOLERANCE, "0.1")]);
        let harness = harness(env, TryRunVerdict::Disabled);
        assert!(harness.run_case(&f32_case(1e-2), &CrashReportLedger::new()).is_ok());
        assert_eq!(
            harness.context().tolerance().for_dtype(DType::F16).map(|t| t.atol),
            Some(DEFAULT_HALF_TOLERANCE)
        );
    }

    #[test]
    fn passed_try_run_short_circuits() {
        let harness = harness(EnvSnapshot::empty(), TryRunVerdict::Passed);
        let case = FnCase::new("never", |_: &RunContext<'_>| -> Result<Vec<Value>, CaseError> {
            panic!("in-process run must not happen")
        });
        assert_eq!(
            harness.run_case(&case, &CrashReportLedger::new()),
            CaseOutcome::PassedOutOfProcess
        );
    }

    #[test]
    fn crash_is_reported_without_running_in_process() {
        let env = EnvSnapshot::from_pairs([(vars::STAGE_NAME, "backend")]);
        let harness = harness(
            env,
            TryRunVerdict::Crashed {
                exit_code: -11,
                stderr: "SIGSEGV in fused kernel".to_owned(),
                timed_out: false,
            },
        );
        let ledger = CrashReportLedger::new();
        let case = FnCase::new("never", |_: &RunContext<'_>| -> Result<Vec<Value>, CaseError> {
            panic!("in-process run must not happen")
        });
        let CaseOutcome::Crashed { message } = harness.run_case(&case, &ledger) else {
            panic!("expected crash");
        };
        assert!(message.contains("SIGSEGV in fused kernel"));
        assert!(message.contains("backend"));
        let CaseOutcome::Crashed { message } = harness.run_case(&case, &ledger) else {
            panic!("expected crash");
        };
        assert!(!message.contains("SIGSEGV"));
    }

    #[test]
    fn skip_wins_over_everything() {
        let harness = Harness::new(
            context(EnvSnapshot::empty()),
            Preflight {
                skip: SkipDecision::skip("previous stage `prim` failed: boom"),
                try_run: TryRunVerdict::Passed,
            },
        );
        let outcome = harness.run_case(&f32_case(1.0), &CrashReportLedger::new());
        assert!(outcome.is_ok());
        assert!(matches!(outcome, CaseOutcome::Skipped { reason } if reason.contains("boom")));
    }

    #[test]
    fn case_error_is_reported_with_mode() {
        let harness = harness(EnvSnapshot::empty(), TryRunVerdict::Disabled);
        let case = FnCase::new("flaky", |run: &RunContext<'_>| {
            if run.mode().is_accelerated() {
                Err(CaseError::from("accelerated lowering failed"))
            } else {
                Ok(vec![Value::scalar_i64(1)])
            }
        });
        assert_eq!(
            harness.run_case(&case, &CrashReportLedger::new()),
            CaseOutcome::Errored {
                mode: ExecutionMode::Accelerated,
                detail: "accelerated lowering failed".to_owned(),
            }
        );
    }

    #[test]
    fn acceleration_kill_switch_runs_baseline_twice() {
        let env = EnvSnapshot::from_pairs([(vars::ACCELERATION_ENABLED, "0")]);
        let harness = harness(env, TryRunVerdict::Disabled);
        assert!(harness.run_case(&f32_case(1.0), &CrashReportLedger::new()).is_ok());
    }

    #[test]
    fn both_runs_receive_the_same_seed() {
        let harness = Harness::new(
            context(EnvSnapshot::empty()).with_seed(77),
            Preflight::ungated(),
        );
        let seen = parking_lot::Mutex::new(Vec::new());
        let case = FnCase::new("seeded", |run: &RunContext<'_>| {
            seen.lock().push((run.mode(), run.seed()));
            Ok(vec![Value::scalar_i64(0)])
        });
        assert!(harness.run_case(&case, &CrashReportLedger::new()).is_ok());
        assert_eq!(
            *seen.lock(),
            vec![(ExecutionMode::Baseline, 77), (ExecutionMode::Accelerated, 77)]
        );
    }

    #[test]
    fn in_process_runs_see_active_stage_config() {
        let env = EnvSnapshot::from_pairs([
            (vars::STAGE_NAME, "backend"),
            (USE_ACCELERATED_BACKEND, "false"),
            (ENABLE_FUSION_FALLBACK, "true"),
        ]);
        let harness = harness(env, TryRunVerdict::Failed { exit_code: 1 });
        let seen = parking_lot::Mutex::new(Vec::new());
        let case = FnCase::new("configured", |run: &RunContext<'_>| {
            seen.lock().push((
                run.stage().map(|stage| stage.name().to_owned()),
                run.config(USE_ACCELERATED_BACKEND).map(str::to_owned),
                run.flag(ENABLE_FUSION_FALLBACK, true),
            ));
            Ok(vec![Value::scalar_i64(0)])
        });
        assert!(harness.run_case(&case, &CrashReportLedger::new()).is_ok());

        let expected = (Some("backend".to_owned()), Some("true".to_owned()), false);
        assert_eq!(*seen.lock(), vec![expected.clone(), expected]);
        // The parent snapshot itself is left untouched.
        assert_eq!(
            harness.context().env().get(USE_ACCELERATED_BACKEND),
            Some("false")
        );
    }

    #[test]
    fn without_stage_in_process_env_is_the_parent_env() {
        let ctx = context(EnvSnapshot::from_pairs([(USE_ACCELERATED_BACKEND, "maybe")]));
        assert_eq!(ctx.stage_env(), ctx.env());
    }

    proptest! {
        #[test]
        fn f32_outcome_tracks_default_tolerance(
            small in 0.0f64..5e-7,
            large in 1e-5f64..1.0,
        ) {
            let harness = harness(EnvSnapshot::empty(), TryRunVerdict::Disabled);
            let ledger = CrashReportLedger::new();
            prop_assert!(harness.run_case(&f32_case(small), &ledger).is_ok());
            let is_failed = matches!(
                harness.run_case(&f32_case(large), &ledger),
                CaseOutcome::Failed { .. }
            );
            prop_assert!(is_failed);
        }
    }
}
