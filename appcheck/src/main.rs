//! appcheck - integration harness for Eliona apps.
//!
//! Resets the app's database state, launches the app (as a local process or a
//! container), waits for it to answer, runs the check battery and always
//! tears the instance down again.

#![forbid(unsafe_code)]

mod commands;
mod report;

use appcheck_common::checks::{AssetTypeExpectation, Expectations, SchemaExpectation};
use appcheck_common::{HarnessError, Phase};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// All checks passed.
pub const EXIT_OK: u8 = 0;
/// A check failed, or the app crashed or never became ready.
pub const EXIT_CHECK_FAILED: u8 = 1;
/// The run never launched: configuration, metadata, reset gate or launch.
pub const EXIT_PRECONDITION: u8 = 2;
/// The instance could not be stopped.
pub const EXIT_TEARDOWN: u8 = 3;

#[derive(Parser)]
#[command(name = "appcheck")]
#[command(author, version, about = "Integration test harness for Eliona apps")]
struct Cli {
    /// Directory containing the app (metadata.json, icon, Dockerfile)
    #[arg(long, env = "APP_LOCATION", default_value = ".", global = true)]
    app: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs and the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset the database, launch the app, run all checks and tear down
    Run(RunArgs),

    /// Validate metadata.json and the icon without launching anything
    Validate,

    /// Run the database reset gate only
    Reset,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Asset type that must exist, optionally with attributes: NAME[:ATTR,...]
    #[arg(long = "asset-type", value_name = "NAME[:ATTR,...]")]
    asset_types: Vec<AssetTypeExpectation>,

    /// Widget type that must exist
    #[arg(long = "widget-type", value_name = "NAME")]
    widget_types: Vec<String>,

    /// Schema that must exist, optionally with tables: NAME[:TABLE,...]
    #[arg(long = "schema", value_name = "NAME[:TABLE,...]")]
    schemas: Vec<SchemaExpectation>,
}

impl RunArgs {
    pub fn expectations(&self) -> Expectations {
        Expectations {
            asset_types: self.asset_types.clone(),
            widget_types: self.widget_types.clone(),
            schemas: self.schemas.clone(),
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    // RUST_LOG wins; otherwise app output (target appcheck::instance) stays visible.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info,appcheck::instance=debug")
        }
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

/// Map a failed command to its process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<HarnessError>().map(HarnessError::phase) {
        Some(Phase::Precondition | Phase::Reset | Phase::Launch) => EXIT_PRECONDITION,
        Some(Phase::Teardown) => EXIT_TEARDOWN,
        _ => EXIT_CHECK_FAILED,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let result = match &cli.command {
        Commands::Run(args) => commands::run(&cli.app, args, cli.json).await,
        Commands::Validate => commands::validate(&cli.app, cli.json),
        Commands::Reset => commands::reset(&cli.app).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let code = exit_code_for(&err);
            error!(exit_code = code, "{err:#}");
            report::print_error(&err, cli.json);
            ExitCode::from(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appcheck_common::{PreconditionError, TeardownError};

    #[test]
    fn cli_parses_run_expectations() {
        let cli = Cli::try_parse_from([
            "appcheck",
            "run",
            "--asset-type",
            "weather_station:temperature,humidity",
            "--widget-type",
            "weather",
            "--schema",
            "weather:config,assets",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let expectations = args.expectations();
        assert_eq!(expectations.asset_types[0].asset_type, "weather_station");
        assert_eq!(
            expectations.asset_types[0].attributes,
            vec!["temperature", "humidity"]
        );
        assert_eq!(expectations.widget_types, vec!["weather"]);
        assert_eq!(expectations.schemas[0].tables, vec!["config", "assets"]);
    }

    #[test]
    fn cli_rejects_empty_expectation_name() {
        assert!(Cli::try_parse_from(["appcheck", "run", "--schema", ":tables"]).is_err());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["appcheck", "validate", "--app", "/srv/app", "--json"]).unwrap();
        assert_eq!(cli.app, PathBuf::from("/srv/app"));
        assert!(cli.json);
    }

    #[test]
    fn exit_codes_follow_failure_phase() {
        let missing: anyhow::Error =
            HarnessError::from(PreconditionError::MissingEnv(vec!["API_TOKEN".into()])).into();
        assert_eq!(exit_code_for(&missing), EXIT_PRECONDITION);

        let fatal: anyhow::Error = HarnessError::FatalLog {
            line: "ERROR: boom".into(),
        }
        .into();
        assert_eq!(exit_code_for(&fatal), EXIT_CHECK_FAILED);

        let teardown: anyhow::Error = HarnessError::from(TeardownError::Abandoned).into();
        assert_eq!(exit_code_for(&teardown), EXIT_TEARDOWN);

        let wrapped = anyhow::Error::from(HarnessError::from(TeardownError::Abandoned))
            .context("run failed");
        assert_eq!(exit_code_for(&wrapped), EXIT_TEARDOWN);

        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), EXIT_CHECK_FAILED);
    }
}
