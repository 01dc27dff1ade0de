//! `mood` command surface: log and list daily ratings, compute the blended
//! next-day forecast, and manage provisioning of the external forecaster.
//!
//! The binary wires the CSV store, the forecast policy, and the Prophet
//! adapter together; all command output is pretty-printed JSON so host
//! tooling can consume it directly.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use moodcast_core::{
    compute_forecast, parse_iso_date, ForecastResult, RatingRecord, ReadinessGate, ReadinessState,
    EXTERNAL_MIN_SAMPLES,
};
use moodcast_forecaster_prophet::{probe, provision, ProphetConfig, ProphetForecaster};
use moodcast_store_csv::CsvRatingStore;
use serde::Serialize;
use time::{Date, OffsetDateTime};

#[derive(Debug, Parser)]
#[command(name = "mood")]
#[command(about = "Daily satisfaction log with a blended next-day forecast")]
pub struct Cli {
    /// Rating store location.
    #[arg(long, default_value = "./mood_ratings.csv")]
    csv: PathBuf,

    /// Python interpreter used for the external forecaster.
    #[arg(long, default_value = "python3")]
    python: PathBuf,

    /// Forecaster script invoked out of process.
    #[arg(long, default_value = "scripts/forecast.py")]
    script: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log (or overwrite) the rating for a day and print the new history.
    Log(LogArgs),
    /// Print the full rating history.
    List,
    /// Print the next-day forecast.
    Forecast(ForecastArgs),
    /// Inspect or trigger provisioning of the external forecaster.
    Provision {
        #[command(subcommand)]
        command: ProvisionCommand,
    },
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Satisfaction rating, clamped into [1, 10].
    #[arg(long)]
    rating: f64,

    /// Day being rated as YYYY-MM-DD; defaults to today (UTC).
    #[arg(long)]
    date: Option<String>,
}

#[derive(Debug, Args)]
pub struct ForecastArgs {
    /// Skip the external forecaster regardless of readiness.
    #[arg(long)]
    no_external: bool,
}

#[derive(Debug, Subcommand)]
pub enum ProvisionCommand {
    /// Report the current readiness state without side effects.
    Status,
    /// Idempotently begin (or report) the one-time provisioning attempt.
    Begin,
}

#[derive(Debug, Serialize)]
struct ReadinessPayload {
    state: ReadinessState,
}

/// Executes the parsed CLI command graph.
///
/// # Errors
/// Returns an error for invalid input at the mutation boundary or when the
/// store cannot be read or written. Forecasting itself never fails once the
/// store is readable.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = CsvRatingStore::open(cli.csv);
    store.ensure()?;
    let config = ProphetConfig {
        python: cli.python,
        script: cli.script,
    };
    run_command(cli.command, &store, &config)
}

/// Executes a single command against an existing store handle.
///
/// # Errors
/// Same failure surface as [`run_cli`].
pub fn run_command(command: Command, store: &CsvRatingStore, config: &ProphetConfig) -> Result<()> {
    match command {
        Command::Log(args) => {
            let date = resolve_date(args.date.as_deref())?;
            let history = store.upsert(date, args.rating)?;
            print_json(&history)
        }
        Command::List => print_json(&store.list()?),
        Command::Forecast(args) => {
            let history = store.list()?;
            let result = next_forecast(&history, config, args.no_external);
            print_json(&result)
        }
        Command::Provision { command } => {
            // Each process rebuilds its gate from an environment probe, so a
            // previously provisioned interpreter starts out ready.
            let gate = ReadinessGate::with_state(probe(&config.python));
            let state = match command {
                ProvisionCommand::Status => gate.status(),
                ProvisionCommand::Begin => provision(&gate, config),
            };
            print_json(&ReadinessPayload { state })
        }
    }
}

/// Computes the next-day forecast, snapshotting readiness exactly once.
///
/// The probe is skipped entirely below the sample threshold (the policy
/// would never consult the external forecaster there) and when the caller
/// opted out, so the cheap paths never pay for a subprocess.
#[must_use]
pub fn next_forecast(
    history: &[RatingRecord],
    config: &ProphetConfig,
    no_external: bool,
) -> ForecastResult {
    if no_external || history.len() < EXTERNAL_MIN_SAMPLES {
        return compute_forecast(history, None);
    }

    if probe(&config.python) == ReadinessState::Ready {
        let forecaster = ProphetForecaster::new(config.clone());
        compute_forecast(history, Some(&forecaster))
    } else {
        compute_forecast(history, None)
    }
}

fn resolve_date(raw: Option<&str>) -> Result<Date> {
    match raw {
        Some(value) => Ok(parse_iso_date(value)?),
        None => Ok(OffsetDateTime::now_utc().date()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
