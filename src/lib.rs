#![allow(clippy::result_large_err)]

use std::env;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinError;

use crate::asserter::Asserter;
use crate::asserter::AsserterError;
use crate::asserter::ScenarioReport;
use crate::cli::Cli;
use crate::outputter::OutPutter;
use crate::parser::Kontrakt;
use crate::runner::HttpTransport;
use crate::runner::RunnerError;
use crate::runner::RunnerResult;
use crate::runner::run_scenarios;
use crate::validator::ConfigError;
use crate::validator::IR;
use crate::validator::Validator;

pub mod asserter;
pub mod cli;
pub mod outputter;
pub mod parser;
pub mod runner;
pub mod validator;

#[derive(Error, Debug, Diagnostic)]
pub enum KontraktError {
    #[error("Failed to read suite file")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse suite file")]
    TomlParsing(#[from] toml::de::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    ConfigError(#[from] ConfigError),

    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },

    #[error("run aborted after {seen} of {total} scenarios")]
    Aborted { seen: usize, total: usize },

    #[error("runner stopped early")]
    RunnerStopped(#[from] RunnerError),

    #[error("asserter stopped early")]
    AsserterStopped(#[from] AsserterError),

    #[error("pipeline task failed")]
    TaskJoin(#[from] JoinError),
}

/// Reads the suite file, applies `KONTRAKT_*` environment overrides and
/// validates the result into a run plan.
///
/// # Errors
///
/// Fails when the file cannot be read, is not valid TOML, or breaks one of
/// the suite rules. Rule violations come back as a [`ConfigError`] with a
/// span into the offending part of the file.
pub fn load_and_validate_suite(path: &str) -> Result<IR, KontraktError> {
    let contents = std::fs::read_to_string(path)?;

    let mut kontrakt: Kontrakt = toml::from_str(&contents)?;
    parser::apply_env_overrides(&mut kontrakt, env::vars());

    let mut validator = Validator::new(&kontrakt, &contents, path);

    Ok(validator.validate()?)
}

/// Flips the returned flag once Ctrl-C arrives. The runner checks it
/// between scenarios, so cancellation never cuts off an in-flight request.
fn spawn_cancel_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    rx
}

/// Loads the suite at `cli.path` and runs every scenario against the
/// configured base URL, printing verdicts as they arrive.
///
/// # Errors
///
/// Returns an error when the suite cannot be loaded or validated, when any
/// scenario fails its checks, or when the run is cancelled before every
/// scenario ran. Each of these leaves the process with a non-zero exit
/// status.
///
/// # Concurrency
///
/// Runner, asserter and outputter are separate tasks connected by channels,
/// but scenario execution itself is strictly sequential: the runner awaits
/// each round trip before starting the next.
pub async fn run(cli: Cli) -> Result<(), KontraktError> {
    let ir = load_and_validate_suite(&cli.path)?;
    let n_scenarios = ir.scenarios.len();

    let (runner_tx, runner_rx) = flume::unbounded::<RunnerResult>();
    let (report_tx, report_rx) = flume::unbounded::<ScenarioReport>();

    let cancel_rx = spawn_cancel_watch();

    let outputter_jh = tokio::spawn(async move {
        OutPutter::start(report_rx, &cli.path, n_scenarios, cli.json).await
    });

    let runner_jh = tokio::spawn(async move {
        let transport = HttpTransport::new();
        run_scenarios(ir, &transport, runner_tx, cancel_rx).await
    });

    let asserter_jh = tokio::spawn(async move { Asserter::run(runner_rx, report_tx).await });

    let (runner_res, asserter_res, tally_res) = futures::join!(runner_jh, asserter_jh, outputter_jh);

    runner_res??;
    asserter_res??;
    let tally = tally_res?;

    if tally.failed > 0 {
        return Err(KontraktError::ScenariosFailed {
            failed: tally.failed,
            total: n_scenarios,
        });
    }

    if tally.seen() < n_scenarios {
        return Err(KontraktError::Aborted {
            seen: tally.seen(),
            total: n_scenarios,
        });
    }

    Ok(())
}
