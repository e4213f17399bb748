//! The black-box check battery run against a ready instance.
//!
//! Every check produces a [`CheckOutcome`]; a failing check never stops the
//! battery, so one run reports everything that is wrong.

pub mod database;
pub mod endpoints;
pub mod icon;

use crate::config::HarnessConfig;
use crate::db::PgDatabase;
use crate::error::PreconditionError;
use crate::lifecycle::ReadyContext;
use endpoints::EndpointChecker;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};

/// Result of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub duration_ms: u64,
}

/// Results of a battery run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }

    pub fn get(&self, name: &str) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn record<E: fmt::Display>(&mut self, name: &str, started: Instant, result: Result<String, E>) {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (passed, detail) = match result {
            Ok(detail) => (true, detail),
            Err(err) => (false, err.to_string()),
        };
        if passed {
            info!(check = name, %detail, "Check passed");
        } else {
            warn!(check = name, %detail, "Check failed");
        }
        self.outcomes.push(CheckOutcome {
            name: name.to_string(),
            passed,
            detail,
            duration_ms,
        });
    }
}

/// `name` or `name:item1,item2`.
fn split_named_list(s: &str) -> Result<(String, Vec<String>), String> {
    let (name, rest) = match s.split_once(':') {
        Some((name, rest)) => (name, Some(rest)),
        None => (s, None),
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name in '{s}'"));
    }
    let items = rest
        .map(|rest| {
            rest.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok((name.to_string(), items))
}

/// An asset type that must exist, with the attributes it must define.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetTypeExpectation {
    pub asset_type: String,
    pub attributes: Vec<String>,
}

impl FromStr for AssetTypeExpectation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (asset_type, attributes) = split_named_list(s)?;
        Ok(Self {
            asset_type,
            attributes,
        })
    }
}

/// A schema that must exist, with the tables it must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaExpectation {
    pub schema: String,
    pub tables: Vec<String>,
}

impl FromStr for SchemaExpectation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (schema, tables) = split_named_list(s)?;
        Ok(Self { schema, tables })
    }
}

/// App-specific database objects the battery asserts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expectations {
    pub asset_types: Vec<AssetTypeExpectation>,
    pub widget_types: Vec<String>,
    pub schemas: Vec<SchemaExpectation>,
}

/// Runs every check against a ready instance.
#[derive(Debug)]
pub struct CheckBattery<'a> {
    config: &'a HarnessConfig,
    expectations: &'a Expectations,
    db: &'a PgDatabase,
    endpoints: EndpointChecker,
}

impl<'a> CheckBattery<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        expectations: &'a Expectations,
        db: &'a PgDatabase,
    ) -> Result<Self, PreconditionError> {
        let endpoints =
            EndpointChecker::new().map_err(|err| PreconditionError::HttpClient(err.to_string()))?;
        Ok(Self {
            config,
            expectations,
            db,
            endpoints,
        })
    }

    pub async fn run(&self, ctx: &ReadyContext) -> CheckReport {
        let mut report = CheckReport::default();
        let metadata = &ctx.metadata.metadata;

        let started = Instant::now();
        let result = match self.db.client().await {
            Ok(client) => database::app_is_initialized(client, ctx.app_name())
                .await
                .map(|at| format!("initialized at {at}")),
            Err(err) => Err(database::DbCheckError::Query(err)),
        };
        report.record("app_initialization", started, result);

        let started = Instant::now();
        let result = self.register_in_store(ctx).await;
        report.record("app_store", started, result);

        let started = Instant::now();
        let result = icon::validate_icon_file(&self.config.icon_path()).map(|info| {
            format!(
                "{} {}x{}, {} bytes",
                info.mime, info.width, info.height, info.file_size
            )
        });
        report.record("icon_file", started, result);

        let started = Instant::now();
        let url = metadata.version_url(&ctx.base_url);
        let result = self
            .endpoints
            .check_version(&url, self.config.requires_build_info())
            .await
            .map(|v| format!("commit '{}' at '{}'", v.commit, v.timestamp));
        report.record("version_endpoint", started, result);

        let started = Instant::now();
        let url = metadata.api_spec_url(&ctx.base_url);
        let result = self
            .endpoints
            .check_api_spec(&url)
            .await
            .map(|_| format!("{url} returned JSON"));
        report.record("api_spec_endpoint", started, result);

        self.run_expectations(&mut report).await;
        report
    }

    async fn register_in_store(&self, ctx: &ReadyContext) -> Result<String, database::DbCheckError> {
        let path = self.config.icon_path();
        let icon_text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| database::DbCheckError::IconRead { path, source })?;
        let client = self.db.client().await?;
        let rows = database::register_in_store(
            client,
            ctx.app_name(),
            &ctx.metadata.raw_text(),
            &icon_text,
        )
        .await?;
        Ok(format!("{rows} store row(s) updated"))
    }

    async fn run_expectations(&self, report: &mut CheckReport) {
        let expectations = self.expectations;
        if expectations.asset_types.is_empty()
            && expectations.widget_types.is_empty()
            && expectations.schemas.is_empty()
        {
            return;
        }
        let client = match self.db.client().await {
            Ok(client) => client,
            Err(err) => {
                let started = Instant::now();
                report.record::<database::DbCheckError>(
                    "database_expectations",
                    started,
                    Err(err.into()),
                );
                return;
            }
        };

        for expected in &expectations.asset_types {
            let started = Instant::now();
            let result = database::asset_type_exists(client, &expected.asset_type, &expected.attributes)
                .await
                .map(|()| format!("{} attribute(s) present", expected.attributes.len()));
            report.record(&format!("asset_type:{}", expected.asset_type), started, result);
        }
        for widget in &expectations.widget_types {
            let started = Instant::now();
            let result = database::widget_type_exists(client, widget)
                .await
                .map(|()| "present".to_string());
            report.record(&format!("widget_type:{widget}"), started, result);
        }
        for expected in &expectations.schemas {
            let started = Instant::now();
            let result = database::schema_exists(client, &expected.schema, &expected.tables)
                .await
                .map(|()| format!("{} table(s) present", expected.tables.len()));
            report.record(&format!("schema:{}", expected.schema), started, result);
        }
    }
}
