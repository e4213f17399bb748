//! Core of the appcheck integration harness.
//!
//! The [`lifecycle::Orchestrator`] resets the database through a
//! [`reset::ResetGate`], starts one application instance through a
//! [`launcher::Launcher`], watches its output with a
//! [`monitor::LogMonitor`], waits for readiness with a
//! [`readiness::ReadinessProber`], runs the caller's tests and tears the
//! instance down exactly once through a [`lifecycle::ShutdownToken`].

pub mod checks;
pub mod config;
pub mod db;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod metadata;
pub mod monitor;
pub mod readiness;
pub mod reset;
pub mod testing;

pub use config::{BuildInfoPolicy, Credentials, HarnessConfig, LaunchMode};
pub use error::{
    HarnessError, HarnessResult, LaunchError, Phase, PreconditionError, ReadinessError,
    TeardownError,
};
pub use launcher::{AppLauncher, InstanceHandle, InstanceId, LaunchRequest, Launcher};
pub use lifecycle::{Orchestrator, ReadyContext, RunReport, RunState, ShutdownReason, ShutdownToken};
pub use metadata::{LoadedMetadata, Metadata};
pub use readiness::{ReadinessPolicy, ReadinessProber, ReadyReport};
pub use reset::{ResetDatabase, ResetGate};
