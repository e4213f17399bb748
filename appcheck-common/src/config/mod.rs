//! Harness configuration.
//!
//! A [`HarnessConfig`] is built once per run from the required credentials
//! (`API_ENDPOINT`, `API_TOKEN`, `CONNECTION_STRING`), the launch mode
//! (`START_MODE`) and the optional `APPCHECK_*` tuning variables, then passed
//! by reference to every component.

pub mod env;

use crate::error::PreconditionError;
use crate::readiness::ReadinessPolicy;
pub use env::{ConfigSource, EnvError, EnvParser, Sourced};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 3039;
pub const DEFAULT_CONTAINER_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(1);
pub const DEFAULT_FOLLOWER_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_DOCKER_BINARY: &str = "docker";
pub const DEFAULT_IMAGE: &str = "go-app-test";
pub const DEFAULT_CONTAINER_NAME: &str = "go-app-test-container";
pub const DEFAULT_DIRECT_COMMAND: &str = "go run .";
pub const DEFAULT_RESET_SCRIPT: &str = "reset.sql";
pub const DEFAULT_CONTAINER_LOG_LEVEL: &str = "info";
pub const METADATA_FILE: &str = "metadata.json";
pub const ICON_FILE: &str = "icon";

/// Variables that must be present before anything else happens.
pub const REQUIRED_ENV: [&str; 3] = ["API_ENDPOINT", "API_TOKEN", "CONNECTION_STRING"];

/// How the application instance is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Spawn the application command as a child process.
    Direct,
    /// Build an image and run it as a container.
    #[default]
    Container,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Container => write!(f, "container"),
        }
    }
}

impl FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "container" | "docker" => Ok(Self::Container),
            other => Err(format!("unknown launch mode '{other}'")),
        }
    }
}

/// Whether the version endpoint must report a non-empty commit and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildInfoPolicy {
    /// Required for container launches only; direct builds carry no stamp.
    #[default]
    Auto,
    Always,
    Never,
}

impl BuildInfoPolicy {
    pub fn requires_build_info(self, mode: LaunchMode) -> bool {
        match self {
            Self::Auto => mode == LaunchMode::Container,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl FromStr for BuildInfoPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown build info policy '{other}'")),
        }
    }
}

/// Credentials forwarded to the application instance.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_endpoint: String,
    pub api_token: String,
    pub connection_string: String,
}

impl Credentials {
    pub fn new(
        api_endpoint: impl Into<String>,
        api_token: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> Self {
        Self {
            api_endpoint: api_endpoint.into(),
            api_token: api_token.into(),
            connection_string: connection_string.into(),
        }
    }

    /// Read the required variables, reporting every missing one at once.
    ///
    /// Only presence is checked; a variable set to the empty string counts.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, PreconditionError> {
        let mut values = Vec::with_capacity(REQUIRED_ENV.len());
        let mut missing = Vec::new();
        for name in REQUIRED_ENV {
            match lookup(name) {
                Some(value) => values.push(value),
                None => missing.push(name.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(PreconditionError::MissingEnv(missing));
        }
        let mut values = values.into_iter();
        Ok(Self {
            api_endpoint: values.next().unwrap_or_default(),
            api_token: values.next().unwrap_or_default(),
            connection_string: values.next().unwrap_or_default(),
        })
    }

    /// `KEY=value` pairs in the order they are handed to the instance.
    pub fn env_pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("API_ENDPOINT", self.api_endpoint.as_str()),
            ("API_TOKEN", self.api_token.as_str()),
            ("CONNECTION_STRING", self.connection_string.as_str()),
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_endpoint", &self.api_endpoint)
            .field("api_token", &"***")
            .field("connection_string", &"***")
            .finish()
    }
}

/// Settings for container launches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSettings {
    pub docker_binary: PathBuf,
    pub image: String,
    pub container_name: String,
    pub container_port: u16,
    pub log_level: String,
    /// How long the log follower may keep draining after the container stopped.
    pub follower_grace: Duration,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_binary: PathBuf::from(DEFAULT_DOCKER_BINARY),
            image: DEFAULT_IMAGE.to_string(),
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            container_port: DEFAULT_CONTAINER_PORT,
            log_level: DEFAULT_CONTAINER_LOG_LEVEL.to_string(),
            follower_grace: DEFAULT_FOLLOWER_GRACE,
        }
    }
}

/// Complete configuration for one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub app_dir: PathBuf,
    pub mode: LaunchMode,
    pub credentials: Credentials,
    pub host: String,
    pub port: u16,
    pub readiness: ReadinessPolicy,
    pub cool_down: Duration,
    pub container: ContainerSettings,
    pub direct_command: Vec<String>,
    pub reset_script: PathBuf,
    pub build_info: BuildInfoPolicy,
}

impl HarnessConfig {
    /// Defaults for everything except the application directory, mode and credentials.
    pub fn new(app_dir: impl Into<PathBuf>, mode: LaunchMode, credentials: Credentials) -> Self {
        Self {
            app_dir: app_dir.into(),
            mode,
            credentials,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            readiness: ReadinessPolicy::default(),
            cool_down: DEFAULT_COOL_DOWN,
            container: ContainerSettings::default(),
            direct_command: DEFAULT_DIRECT_COMMAND
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            reset_script: PathBuf::from(DEFAULT_RESET_SCRIPT),
            build_info: BuildInfoPolicy::default(),
        }
    }

    /// Build the configuration from the process environment.
    pub fn from_env(app_dir: impl Into<PathBuf>) -> Result<Self, PreconditionError> {
        Self::from_lookup(app_dir, |name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Required variables are checked first; tuning errors are collected and
    /// reported together.
    pub fn from_lookup<F>(app_dir: impl Into<PathBuf>, lookup: F) -> Result<Self, PreconditionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = Credentials::from_lookup(&lookup)?;
        let mut errors = Vec::new();

        let mode = match lookup("START_MODE").filter(|v| !v.trim().is_empty()) {
            None => LaunchMode::default(),
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                errors.push(EnvError::InvalidValue {
                    var: "START_MODE".to_string(),
                    expected: "direct | container | docker".to_string(),
                    value: raw.clone(),
                });
                LaunchMode::default()
            }),
        };

        let mut config = Self::new(app_dir, mode, credentials);
        let mut parser = EnvParser::new(&lookup);

        config.port = parser.get_u16_range("PORT", DEFAULT_PORT, 1, u16::MAX).into_inner();
        config.container.container_port = parser
            .get_u16_range("CONTAINER_PORT", DEFAULT_CONTAINER_PORT, 1, u16::MAX)
            .into_inner();
        config.readiness.deadline = parser
            .get_duration("READY_TIMEOUT", DEFAULT_READY_TIMEOUT)
            .into_inner();
        config.readiness.interval = parser
            .get_duration("POLL_INTERVAL", DEFAULT_POLL_INTERVAL)
            .into_inner();
        config.readiness.request_timeout = parser
            .get_duration("REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT)
            .into_inner();
        config.cool_down = parser.get_duration("COOL_DOWN", DEFAULT_COOL_DOWN).into_inner();
        config.container.docker_binary = PathBuf::from(
            parser
                .get_string("DOCKER_BINARY", DEFAULT_DOCKER_BINARY)
                .into_inner(),
        );
        config.container.image = parser.get_string("IMAGE", DEFAULT_IMAGE).into_inner();
        config.container.container_name = parser
            .get_string("CONTAINER_NAME", DEFAULT_CONTAINER_NAME)
            .into_inner();
        config.direct_command = parser
            .get_command("DIRECT_COMMAND", DEFAULT_DIRECT_COMMAND)
            .into_inner();
        config.reset_script = PathBuf::from(
            parser
                .get_string("RESET_SCRIPT", DEFAULT_RESET_SCRIPT)
                .into_inner(),
        );
        config.build_info = parser
            .get_parsed("REQUIRE_BUILD_INFO", BuildInfoPolicy::Auto, "auto | always | never")
            .into_inner();

        errors.extend(parser.take_errors());
        if !errors.is_empty() {
            return Err(PreconditionError::InvalidConfig(errors));
        }

        debug!(
            app_dir = %config.app_dir.display(),
            mode = %config.mode,
            port = config.port,
            "Harness configuration loaded"
        );
        Ok(config)
    }

    /// Base URL of the instance, e.g. `http://localhost:3039`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.app_dir.join(METADATA_FILE)
    }

    pub fn icon_path(&self) -> PathBuf {
        self.app_dir.join(ICON_FILE)
    }

    /// Reset script path, resolved against the application directory when relative.
    pub fn reset_script_path(&self) -> PathBuf {
        resolve(&self.app_dir, &self.reset_script)
    }

    /// Whether the version endpoint must carry build information for this run.
    pub fn requires_build_info(&self) -> bool {
        self.build_info.requires_build_info(self.mode)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
