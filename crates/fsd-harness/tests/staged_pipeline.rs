//! End-to-end gating against real child processes.

#![cfg(unix)]

use fsd_core::{EnvSnapshot, Value, vars};
use fsd_harness::{CaseError, CaseOutcome, FnCase, Harness, HarnessContext, RunContext};
use fsd_runner::{
    CrashReportLedger, Invocation, ProcessRunner, SkipGate, SubprocessRunner, TryRunVerdict,
};
use fsd_stage::{Stage, StageSequence};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Script standing in for a test binary: its behaviour depends on the stage
/// it is launched under.
fn write_script(dir: &TempDir, body: &str) -> Invocation {
    let path = dir.path().join("stage_probe.sh");
    std::fs::write(&path, body).expect("write script");
    Invocation::new("/bin/sh", [path.as_os_str()])
}

const STAGE_FLAG: &str = "FSD_TEST_STAGE_FLAG";

fn abc_pipeline() -> StageSequence {
    StageSequence::register(vec![
        Stage::new("A"),
        Stage::new("B").with(STAGE_FLAG, true),
        Stage::new("C").with(STAGE_FLAG, false),
    ])
    .expect("valid pipeline")
}

const FAILS_IN_B: &str = r#"
case "$STAGE_NAME" in
  B) echo "boom" >&2; exit 2 ;;
  *) exit 0 ;;
esac
"#;

fn context_for(stage: &str, invocation: Invocation, extra: &[(&str, &str)]) -> HarnessContext {
    let mut env = EnvSnapshot::from_process()
        .with(vars::STAGE_NAME, stage)
        .with(vars::STAGE_ENABLE_DIFF, "1")
        .with(vars::TRY_RUN_ENABLED, "1");
    env.remove(STAGE_FLAG);
    for (key, value) in extra {
        env.set(*key, *value);
    }
    HarnessContext::from_env(env, abc_pipeline(), invocation).expect("valid context")
}

fn counting_case(
    calls: &AtomicUsize,
) -> FnCase<impl Fn(&RunContext<'_>) -> Result<Vec<Value>, CaseError> + '_> {
    FnCase::new("counting", move |_: &RunContext<'_>| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Value::scalar_i64(1)])
    })
}

#[test]
fn failing_stage_skips_its_successor_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let invocation = write_script(&dir, FAILS_IN_B);
    let pipeline = abc_pipeline();
    let runner = SubprocessRunner::new(EnvSnapshot::from_process());
    let gate = SkipGate::new(&pipeline, &runner, &invocation, true);

    let c = gate.should_skip(pipeline.by_name("C").expect("C"));
    assert!(c.skip);
    assert!(c.reason.contains("boom"), "{}", c.reason);
    assert!(c.reason.contains("`B`"));

    let a = gate.should_skip(pipeline.by_name("A").expect("A"));
    assert!(!a.skip);
    assert!(a.reason.is_empty());

    assert!(!gate.should_skip(pipeline.by_name("B").expect("B")).skip);
}

#[test]
fn skipped_stage_reports_reason_through_harness() {
    let dir = tempfile::tempdir().expect("tempdir");
    let invocation = write_script(&dir, FAILS_IN_B);
    let context = context_for("C", invocation, &[]);
    let runner = SubprocessRunner::from_env(context.env());
    let harness = Harness::prepare(context, &runner);

    let calls = AtomicUsize::new(0);
    let outcome = harness.run_case(&counting_case(&calls), &CrashReportLedger::new());
    match outcome {
        CaseOutcome::Skipped { reason } => assert!(reason.contains("boom")),
        other => panic!("expected skip, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn clean_try_run_never_reaches_the_comparator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let invocation = write_script(&dir, "exit 0\n");
    let context = context_for("B", invocation, &[]);
    let runner = SubprocessRunner::from_env(context.env());
    let harness = Harness::prepare(context, &runner);
    assert_eq!(harness.preflight().try_run, TryRunVerdict::Passed);

    let calls = AtomicUsize::new(0);
    let outcome = harness.run_case(&counting_case(&calls), &CrashReportLedger::new());
    assert_eq!(outcome, CaseOutcome::PassedOutOfProcess);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn ordinary_try_run_failure_falls_through_to_in_process_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let invocation = write_script(&dir, "echo 'mismatch' >&2; exit 1\n");
    let context = context_for("A", invocation, &[]);
    let runner = SubprocessRunner::from_env(context.env());
    let harness = Harness::prepare(context, &runner);
    assert_eq!(
        harness.preflight().try_run,
        TryRunVerdict::Failed { exit_code: 1 }
    );

    let calls = AtomicUsize::new(0);
    let outcome = harness.run_case(&counting_case(&calls), &CrashReportLedger::new());
    assert!(matches!(outcome, CaseOutcome::Passed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn in_process_run_sees_the_config_the_child_saw() {
    let dir = tempfile::tempdir().expect("tempdir");
    let record = dir.path().join("child_flag");
    // Ordinary failure, so the case falls through to the in-process run.
    let script = format!(
        "printf '%s' \"${STAGE_FLAG}\" > '{}'\nexit 1\n",
        record.display()
    );
    let invocation = write_script(&dir, &script);
    let context = context_for("B", invocation, &[(vars::STAGE_ENABLE_DIFF, "0")]);
    let runner = SubprocessRunner::from_env(context.env());
    let harness = Harness::prepare(context, &runner);
    assert_eq!(
        harness.preflight().try_run,
        TryRunVerdict::Failed { exit_code: 1 }
    );
    let child_saw = std::fs::read_to_string(&record).expect("child recorded its flag");
    assert_eq!(child_saw, "true");

    let seen = parking_lot::Mutex::new(Vec::new());
    let case = FnCase::new("configured", |run: &RunContext<'_>| {
        seen.lock().push(run.config(STAGE_FLAG).map(str::to_owned));
        Ok(vec![Value::scalar_bool(run.flag(STAGE_FLAG, false))])
    });
    let outcome = harness.run_case(&case, &CrashReportLedger::new());
    assert!(matches!(outcome, CaseOutcome::Passed { .. }), "{outcome}");
    assert_eq!(*seen.lock(), vec![Some(child_saw.clone()), Some(child_saw)]);
}

#[test]
fn crashing_child_yields_crash_outcome_with_stderr_tail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let invocation = write_script(
        &dir,
        "echo 'fatal: illegal memory access' >&2\nkill -SEGV $$\n",
    );
    let context = context_for("A", invocation, &[]);
    let runner = SubprocessRunner::from_env(context.env());
    let harness = Harness::prepare(context, &runner);
    assert!(matches!(
        harness.preflight().try_run,
        TryRunVerdict::Crashed { exit_code: -11, .. }
    ));

    let ledger = CrashReportLedger::new();
    let calls = AtomicUsize::new(0);
    let CaseOutcome::Crashed { message } = harness.run_case(&counting_case(&calls), &ledger) else {
        panic!("expected crash");
    };
    assert!(message.contains("illegal memory access"));
    assert_eq!(ledger.reports(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn try_run_disabled_by_env_runs_in_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("spawned");
    let script = format!("touch '{}'\nexit 0\n", marker.display());
    let invocation = write_script(&dir, &script);
    let context = context_for(
        "A",
        invocation,
        &[(vars::TRY_RUN_ENABLED, "false"), (vars::STAGE_ENABLE_DIFF, "0")],
    );
    let runner = SubprocessRunner::from_env(context.env());
    let harness = Harness::prepare(context, &runner);
    assert_eq!(harness.preflight().try_run, TryRunVerdict::Disabled);
    assert!(!Path::new(&marker).exists());

    let calls = AtomicUsize::new(0);
    assert!(harness.run_case(&counting_case(&calls), &CrashReportLedger::new()).is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn children_never_try_run_recursively() {
    let dir = tempfile::tempdir().expect("tempdir");
    let invocation = write_script(
        &dir,
        r#"[ "$TRY_RUN_ENABLED" = "0" ] && [ "$STAGE_ENABLE_DIFF" = "0" ] || exit 3"#,
    );
    let env = EnvSnapshot::from_process().with(vars::TRY_RUN_ENABLED, "1");
    let result = SubprocessRunner::new(env)
        .run(&Stage::new("A"), &invocation)
        .expect("runs");
    assert_eq!(result.exit_code, 0, "{}", result.stderr);
}
