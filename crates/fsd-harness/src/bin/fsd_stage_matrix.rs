#![forbid(unsafe_code)]

use clap::Parser;
use fsd_core::EnvSnapshot;
use fsd_harness::matrix::run_matrix;
use fsd_runner::{Invocation, SubprocessRunner};
use fsd_stage::{StageSequence, default_pipeline};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "STAGEDIFF_LOG";

/// Run a test executable under every compilation stage and report which stage
/// first breaks it.
#[derive(Parser)]
#[command(name = "fsd-stage-matrix")]
#[command(version)]
struct Cli {
    /// Test executable to run once per stage
    exe: PathBuf,

    /// Only run these stages (comma separated, pipeline order is kept)
    #[arg(long, value_delimiter = ',')]
    stages: Vec<String>,

    /// Per-stage timeout in seconds; 0 disables it
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,

    /// Arguments forwarded to the executable
    #[arg(last = true)]
    args: Vec<OsString>,
}

fn selected_pipeline(names: &[String]) -> Result<StageSequence, String> {
    let pipeline = default_pipeline();
    if names.is_empty() {
        return Ok(pipeline);
    }
    for name in names {
        pipeline.by_name(name).map_err(|err| err.to_string())?;
    }
    let stages = pipeline
        .iter()
        .filter(|stage| names.iter().any(|name| name == stage.name()))
        .cloned()
        .collect();
    StageSequence::register(stages).map_err(|err| err.to_string())
}

fn run(cli: Cli) -> Result<bool, String> {
    let pipeline = selected_pipeline(&cli.stages)?;
    let env = EnvSnapshot::from_process();
    let mut runner = SubprocessRunner::from_env(&env);
    if let Some(secs) = cli.timeout_secs {
        runner = runner.with_timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    let invocation = Invocation::new(cli.exe, cli.args);

    let report = run_matrix(&pipeline, &runner, &invocation).map_err(|err| err.to_string())?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|err| format!("failed to serialize report: {err}"))?;
    match &cli.out {
        Some(path) => std::fs::write(path, json)
            .map_err(|err| format!("failed to write {}: {err}", path.display()))?,
        None => println!("{json}"),
    }

    match &report.first_failing_stage {
        Some(stage) => info!(stage = stage.as_str(), "first failing stage"),
        None => info!("all stages passed"),
    }
    Ok(report.all_passed())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(%err, "stage matrix aborted");
            ExitCode::from(2)
        }
    }
}
