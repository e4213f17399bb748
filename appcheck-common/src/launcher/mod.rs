//! Instance launchers.
//!
//! A [`Launcher`] starts one application instance and hands back an
//! [`InstanceHandle`] holding its identifier and log stream. The launcher
//! keeps its own registry of live instances; callers only pass the
//! identifier back to [`Launcher::stop`].

mod container;
mod direct;

pub use container::ContainerLauncher;
pub use direct::DirectLauncher;

use crate::config::{Credentials, HarnessConfig, LaunchMode};
use crate::error::{LaunchError, TeardownError};
use crate::monitor::LogStream;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;

/// Opaque identifier of a running instance (process or container).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A started instance and its not yet consumed output.
#[derive(Debug)]
pub struct InstanceHandle {
    pub id: InstanceId,
    pub mode: LaunchMode,
    pub logs: LogStream,
}

/// Everything a launcher needs to know about the instance to start.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Value of `metadata.name`, exported as `APPNAME`.
    pub app_name: String,
    /// Working directory (direct) or build context (container).
    pub app_dir: PathBuf,
    /// Host port the instance must listen on.
    pub port: u16,
    pub credentials: Credentials,
}

impl LaunchRequest {
    pub fn from_config(config: &HarnessConfig, app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_dir: config.app_dir.clone(),
            port: config.port,
            credentials: config.credentials.clone(),
        }
    }
}

/// Starts and stops application instances.
pub trait Launcher: Send + Sync + 'static {
    fn mode(&self) -> LaunchMode;

    /// Start an instance. On error no instance is left running.
    fn start(
        &self,
        request: &LaunchRequest,
    ) -> impl Future<Output = Result<InstanceHandle, LaunchError>> + Send;

    /// Stop a previously started instance and drop it from the registry.
    fn stop(&self, id: &InstanceId) -> impl Future<Output = Result<(), TeardownError>> + Send;

    /// Number of instances currently tracked.
    fn tracked_instances(&self) -> usize;
}

/// Launcher selected once from the configured [`LaunchMode`].
#[derive(Debug)]
pub enum AppLauncher {
    Direct(DirectLauncher),
    Container(ContainerLauncher),
}

impl AppLauncher {
    pub fn from_config(config: &HarnessConfig) -> Self {
        match config.mode {
            LaunchMode::Direct => Self::Direct(DirectLauncher::from_config(config)),
            LaunchMode::Container => Self::Container(ContainerLauncher::from_config(config)),
        }
    }
}

impl Launcher for AppLauncher {
    fn mode(&self) -> LaunchMode {
        match self {
            Self::Direct(launcher) => launcher.mode(),
            Self::Container(launcher) => launcher.mode(),
        }
    }

    async fn start(&self, request: &LaunchRequest) -> Result<InstanceHandle, LaunchError> {
        match self {
            Self::Direct(launcher) => launcher.start(request).await,
            Self::Container(launcher) => launcher.start(request).await,
        }
    }

    async fn stop(&self, id: &InstanceId) -> Result<(), TeardownError> {
        match self {
            Self::Direct(launcher) => launcher.stop(id).await,
            Self::Container(launcher) => launcher.stop(id).await,
        }
    }

    fn tracked_instances(&self) -> usize {
        match self {
            Self::Direct(launcher) => launcher.tracked_instances(),
            Self::Container(launcher) => launcher.tracked_instances(),
        }
    }
}

/// Render the tail of a command's stderr (or stdout) for error messages.
pub(crate) fn command_detail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    let status = match output.status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    };
    if text.is_empty() {
        status
    } else {
        let tail: Vec<&str> = text.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        format!("{status}: {}", tail.join(" | "))
    }
}
