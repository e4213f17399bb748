//! Error taxonomy for a harness run.
//!
//! Failures are split by when they happen: preconditions (before any
//! instance exists), launch, runtime (fatal log line, readiness timeout)
//! and teardown. [`HarnessError::phase`] maps each to the phase reported
//! by the CLI.

use crate::config::{EnvError, LaunchMode};
use crate::lifecycle::RunState;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Phase of a run in which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Precondition,
    Reset,
    Launch,
    Readiness,
    Runtime,
    Teardown,
    Internal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition => write!(f, "precondition"),
            Self::Reset => write!(f, "reset"),
            Self::Launch => write!(f, "launch"),
            Self::Readiness => write!(f, "readiness"),
            Self::Runtime => write!(f, "runtime"),
            Self::Teardown => write!(f, "teardown"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures detected before any instance exists. Never retried.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("environment variable(s) not defined: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("invalid harness configuration: {}", join_env_errors(.0))]
    InvalidConfig(Vec<EnvError>),

    #[error("reading metadata file {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decoding metadata file {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid metadata: {0}")]
    MetadataInvalid(String),

    #[error("building HTTP client: {0}")]
    HttpClient(String),

    #[error("another harness run is already active in this process")]
    RunAlreadyActive,

    #[error("reading SQL script {path}: {source}")]
    ResetScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to database: {0}")]
    DatabaseConnect(String),

    #[error("executing SQL script: {0}")]
    ResetScript(String),

    #[error("executing SELECT statement: {0}")]
    InitQuery(String),

    #[error("no eliona_app row for app '{0}'")]
    AppRowMissing(String),

    #[error("app '{app}' is already initialized (initialized_at = {initialized_at}), want NULL")]
    AlreadyInitialized { app: String, initialized_at: String },
}

impl PreconditionError {
    /// Whether this failure came from the database reset gate.
    pub fn is_reset_failure(&self) -> bool {
        matches!(
            self,
            Self::ResetScriptRead { .. }
                | Self::DatabaseConnect(_)
                | Self::ResetScript(_)
                | Self::InitQuery(_)
                | Self::AppRowMissing(_)
                | Self::AlreadyInitialized { .. }
        )
    }
}

/// Failures while bringing an instance up. No instance exists afterwards.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("building image '{image}': {detail}")]
    Build { image: String, detail: String },

    #[error("starting {mode} instance: {detail}")]
    Start { mode: LaunchMode, detail: String },

    #[error("spawning '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("attaching log stream: {0}")]
    Logs(String),
}

/// Failures while stopping an instance.
///
/// Cloneable so every waiter on the shutdown token observes the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TeardownError {
    #[error("stopping instance {instance}: {detail}")]
    StopFailed { instance: String, detail: String },

    #[error("instance {0} is not tracked by this launcher")]
    UnknownInstance(String),

    #[error("teardown task ended without reporting an outcome")]
    Abandoned,
}

/// Readiness polling failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    #[error("app not ready after {deadline:?} ({attempts} attempts)")]
    Timeout { deadline: Duration, attempts: u32 },

    #[error("readiness wait cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// Any failure of a harness run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("instance reported a fatal log line: {line}")]
    FatalLog { line: String },

    #[error("app not ready after {deadline:?} ({attempts} attempts)")]
    ReadinessTimeout { deadline: Duration, attempts: u32 },

    #[error("teardown failed: {0}")]
    Teardown(#[from] TeardownError),

    #[error("invalid run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },
}

impl HarnessError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Precondition(err) if err.is_reset_failure() => Phase::Reset,
            Self::Precondition(_) => Phase::Precondition,
            Self::Launch(_) => Phase::Launch,
            Self::ReadinessTimeout { .. } => Phase::Readiness,
            Self::FatalLog { .. } => Phase::Runtime,
            Self::Teardown(_) => Phase::Teardown,
            Self::InvalidTransition { .. } => Phase::Internal,
        }
    }

    /// Whether the failure happened while an instance was running.
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::FatalLog { .. } | Self::ReadinessTimeout { .. })
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
