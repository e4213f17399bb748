//! Subcommand implementations.

use crate::report;
use crate::{EXIT_CHECK_FAILED, EXIT_OK, RunArgs};
use anyhow::{Context, Result};
use appcheck_common::checks::{CheckBattery, CheckReport, icon};
use appcheck_common::config::{ICON_FILE, METADATA_FILE};
use appcheck_common::db::PgDatabase;
use appcheck_common::{AppLauncher, HarnessConfig, HarnessError, LoadedMetadata, Orchestrator, ResetGate};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Full lifecycle: reset, launch, wait for readiness, run the battery, tear down.
pub async fn run(app_dir: &Path, args: &RunArgs, json: bool) -> Result<u8> {
    let config = HarnessConfig::from_env(app_dir).map_err(HarnessError::from)?;
    let expectations = args.expectations();

    let checks_db = PgDatabase::new(config.credentials.connection_string.clone());
    let battery =
        CheckBattery::new(&config, &expectations, &checks_db).map_err(HarnessError::from)?;

    let launcher = Arc::new(AppLauncher::from_config(&config));
    let gate = ResetGate::new(
        PgDatabase::new(config.credentials.connection_string.clone()),
        config.reset_script_path(),
    );
    let mut orchestrator = Orchestrator::new(config.clone(), launcher, gate);

    let run = orchestrator
        .run(|ctx| async move { battery.run(&ctx).await })
        .await
        .context("harness run failed")?;

    report::print_run(&run, json)?;
    Ok(if run.output.passed() {
        EXIT_OK
    } else {
        EXIT_CHECK_FAILED
    })
}

/// Static checks that need neither credentials nor a running instance.
pub fn validate(app_dir: &Path, json: bool) -> Result<u8> {
    let mut checks = CheckReport::default();

    let started = Instant::now();
    let loaded = LoadedMetadata::load(&app_dir.join(METADATA_FILE)).map_err(HarnessError::from)?;
    checks.record::<HarnessError>(
        "metadata",
        started,
        Ok(format!("app '{}'", loaded.metadata.name)),
    );

    let started = Instant::now();
    let result = icon::validate_icon_file(&app_dir.join(ICON_FILE)).map(|info| {
        format!(
            "{} {}x{}, {} bytes",
            info.mime, info.width, info.height, info.file_size
        )
    });
    checks.record("icon_file", started, result);

    report::print_checks(&checks, json)?;
    Ok(if checks.passed() {
        EXIT_OK
    } else {
        EXIT_CHECK_FAILED
    })
}

/// Run the reset script and confirm the app is uninitialized, without launching.
pub async fn reset(app_dir: &Path) -> Result<u8> {
    let config = HarnessConfig::from_env(app_dir).map_err(HarnessError::from)?;
    let loaded = LoadedMetadata::load(&config.metadata_path()).map_err(HarnessError::from)?;
    let gate = ResetGate::new(
        PgDatabase::new(config.credentials.connection_string.clone()),
        config.reset_script_path(),
    );
    gate.reset_and_verify(&loaded.metadata.name)
        .await
        .map_err(HarnessError::from)?;
    info!(app = %loaded.metadata.name, "Database reset, app is uninitialized");
    println!(
        "reset: app '{}' is uninitialized ({})",
        loaded.metadata.name,
        gate.script_path().display()
    );
    Ok(EXIT_OK)
}
