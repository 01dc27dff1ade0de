//! Out-of-process Prophet adapter and its one-time environment provisioner.
//!
//! The adapter satisfies the [`ExternalForecaster`] contract by writing the
//! full history to a scratch CSV and one-shot invoking a Python script that
//! prints a JSON object with a numeric `yhat` field. Every deviation from
//! that contract (missing interpreter, non-zero exit, unparseable output,
//! missing or non-finite prediction) surfaces as a recoverable
//! [`ExternalError`], never a panic.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use moodcast_core::{
    format_iso_date, ExternalError, ExternalForecaster, RatingRecord, ReadinessGate,
    ReadinessState,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Python packages the forecaster script imports.
pub const REQUIRED_PACKAGES: &[&str] = &["prophet", "pandas"];

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ProphetConfig {
    pub python: PathBuf,
    pub script: PathBuf,
}

impl Default for ProphetConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            script: PathBuf::from("scripts/forecast.py"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProphetForecaster {
    config: ProphetConfig,
}

impl ProphetForecaster {
    #[must_use]
    pub fn new(config: ProphetConfig) -> Self {
        Self { config }
    }
}

impl ExternalForecaster for ProphetForecaster {
    fn forecast(&self, history: &[RatingRecord]) -> Result<f64, ExternalError> {
        let scratch = scratch_csv_path();
        write_history_csv(&scratch, history)?;

        let invocation = Command::new(&self.config.python)
            .arg(&self.config.script)
            .arg("--csv")
            .arg(&scratch)
            .output();
        let _ = fs::remove_file(&scratch);

        let output = invocation.map_err(|err| {
            ExternalError::Unavailable(format!(
                "failed to launch {}: {err}",
                self.config.python.display()
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "forecaster invocation failed");
            return Err(ExternalError::Failed(format!(
                "forecaster exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let yhat = parse_forecast_output(&output.stdout)?;
        debug!(yhat, samples = history.len(), "external forecast produced");
        Ok(yhat)
    }
}

/// Extracts the finite numeric `yhat` prediction from forecaster stdout.
///
/// # Errors
/// Returns [`ExternalError::Failed`] for unparseable output or a missing,
/// null, or non-numeric `yhat` field.
pub fn parse_forecast_output(stdout: &[u8]) -> Result<f64, ExternalError> {
    let value: Value = serde_json::from_slice(stdout)
        .map_err(|err| ExternalError::Failed(format!("unparseable forecaster output: {err}")))?;
    let yhat = value
        .get("yhat")
        .and_then(Value::as_f64)
        .ok_or_else(|| ExternalError::Failed("forecaster output missing numeric yhat".to_string()))?;
    if !yhat.is_finite() {
        return Err(ExternalError::Failed(
            "forecaster returned a non-finite yhat".to_string(),
        ));
    }
    Ok(yhat)
}

fn write_history_csv(path: &Path, history: &[RatingRecord]) -> Result<(), ExternalError> {
    let mut body = String::from("date,rating");
    for record in history {
        let date = format_iso_date(record.date)
            .map_err(|err| ExternalError::Failed(err.to_string()))?;
        body.push('\n');
        body.push_str(&date);
        body.push(',');
        body.push_str(&record.rating.to_string());
    }
    if !history.is_empty() {
        body.push('\n');
    }

    fs::write(path, body).map_err(|err| {
        ExternalError::Failed(format!(
            "failed to stage history at {}: {err}",
            path.display()
        ))
    })
}

fn scratch_csv_path() -> PathBuf {
    let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "moodcast-history-{}-{seq}.csv",
        std::process::id()
    ))
}

/// Fast readiness probe: imports the required packages in a throwaway
/// interpreter so a process whose environment was provisioned earlier
/// starts out `ready` without re-installing anything.
#[must_use]
pub fn probe(python: &Path) -> ReadinessState {
    let status = Command::new(python)
        .arg("-c")
        .arg(format!("import {}", REQUIRED_PACKAGES.join(", ")))
        .status();
    match status {
        Ok(code) if code.success() => ReadinessState::Ready,
        Ok(_) | Err(_) => ReadinessState::NotReady,
    }
}

/// Runs the one-time environment provisioning attempt, guarded by the gate's
/// single slot. Idempotent: a concurrent or completed attempt makes this a
/// no-op that reports the current state.
pub fn provision(gate: &ReadinessGate, config: &ProphetConfig) -> ReadinessState {
    if !gate.try_begin() {
        return gate.status();
    }
    let ok = run_installer(&config.python);
    gate.complete(ok);
    gate.status()
}

/// Detached-thread variant of [`provision`] so hosts can keep computing
/// EMA-only forecasts and logging ratings while provisioning runs.
pub fn spawn_provisioning(
    gate: Arc<ReadinessGate>,
    config: ProphetConfig,
) -> JoinHandle<ReadinessState> {
    thread::spawn(move || provision(&gate, &config))
}

fn run_installer(python: &Path) -> bool {
    let status = Command::new(python)
        .args(["-m", "pip", "install", "--user"])
        .args(REQUIRED_PACKAGES)
        .status();
    match status {
        Ok(code) if code.success() => true,
        Ok(code) => {
            warn!(status = %code, "provisioning installer failed");
            false
        }
        Err(err) => {
            warn!(error = %err, "failed to launch provisioning installer");
            false
        }
    }
}
