//! Container launcher driving the docker CLI.

use super::{InstanceHandle, InstanceId, LaunchRequest, Launcher, command_detail};
use crate::config::{ContainerSettings, HarnessConfig, LaunchMode};
use crate::error::{LaunchError, TeardownError};
use crate::monitor::LogStream;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Variables whose values are masked when docker commands are logged.
const SENSITIVE_ENV: [&str; 2] = ["API_TOKEN=", "CONNECTION_STRING="];

/// Builds the application image and runs it as a named container.
///
/// The registry maps container names to their `docker logs -f` follower.
#[derive(Debug)]
pub struct ContainerLauncher {
    settings: ContainerSettings,
    followers: Mutex<HashMap<InstanceId, Child>>,
}

impl ContainerLauncher {
    pub fn new(settings: ContainerSettings) -> Self {
        Self {
            settings,
            followers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.container.clone())
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    fn followers(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, Child>> {
        self.followers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.settings.docker_binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run a docker subcommand to completion, returning its output or a
    /// failure detail.
    async fn run_checked(&self, args: &[String]) -> Result<Output, String> {
        debug!(
            docker = %self.settings.docker_binary.display(),
            args = %mask_sensitive_args(args),
            "Running docker command"
        );
        let output = self
            .docker()
            .args(args)
            .output()
            .await
            .map_err(|err| {
                format!(
                    "running {}: {err}",
                    self.settings.docker_binary.display()
                )
            })?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(command_detail(&output))
        }
    }

    fn run_args(&self, request: &LaunchRequest) -> Vec<String> {
        let settings = &self.settings;
        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            settings.container_name.clone(),
            "-d".into(),
            "-i".into(),
            "-p".into(),
            format!("{}:{}", request.port, settings.container_port),
        ];
        for (key, value) in request.credentials.env_pairs() {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            "-e".into(),
            format!("LOG_LEVEL={}", settings.log_level),
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
            settings.image.clone(),
        ]);
        args
    }

    fn follow_logs(&self, name: &str) -> Result<(Child, LogStream), LaunchError> {
        let mut follower = self
            .docker()
            .args(["logs", "-f", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| LaunchError::Logs(format!("docker logs -f {name}: {err}")))?;
        let mut logs = LogStream::new();
        if let Some(stdout) = follower.stdout.take() {
            logs.push("stdout", stdout);
        }
        if let Some(stderr) = follower.stderr.take() {
            logs.push("stderr", stderr);
        }
        Ok((follower, logs))
    }
}

impl Launcher for ContainerLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Container
    }

    async fn start(&self, request: &LaunchRequest) -> Result<InstanceHandle, LaunchError> {
        let name = self.settings.container_name.clone();
        let image = self.settings.image.clone();

        if let Err(detail) = self.run_checked(&["rm".into(), "-f".into(), name.clone()]).await {
            debug!(container = %name, %detail, "No stale container removed");
        }

        info!(%image, context = %request.app_dir.display(), "Building app image");
        let context = request.app_dir.display().to_string();
        self.run_checked(&["build".into(), context, "-t".into(), image.clone()])
            .await
            .map_err(|detail| LaunchError::Build {
                image: image.clone(),
                detail,
            })?;

        info!(container = %name, port = request.port, "Starting app container");
        self.run_checked(&self.run_args(request))
            .await
            .map_err(|detail| LaunchError::Start {
                mode: LaunchMode::Container,
                detail,
            })?;

        let (follower, logs) = match self.follow_logs(&name) {
            Ok(attached) => attached,
            Err(err) => {
                if let Err(detail) = self.run_checked(&["rm".into(), "-f".into(), name.clone()]).await {
                    warn!(container = %name, %detail, "Removing container after log attach failure failed");
                }
                return Err(err);
            }
        };

        let id = InstanceId::new(name);
        self.followers().insert(id.clone(), follower);
        Ok(InstanceHandle {
            id,
            mode: LaunchMode::Container,
            logs,
        })
    }

    async fn stop(&self, id: &InstanceId) -> Result<(), TeardownError> {
        if !self.followers().contains_key(id) {
            return Err(TeardownError::UnknownInstance(id.to_string()));
        }

        info!(container = %id, "Stopping app container");
        // On failure the container may still run, so it stays tracked.
        self.run_checked(&["stop".into(), id.to_string()])
            .await
            .map_err(|detail| TeardownError::StopFailed {
                instance: id.to_string(),
                detail,
            })?;

        let Some(mut follower) = self.followers().remove(id) else {
            return Ok(());
        };
        // The follower exits by itself once the container is gone.
        match tokio::time::timeout(self.settings.follower_grace, follower.wait()).await {
            Ok(Ok(status)) => debug!(container = %id, %status, "Log follower exited"),
            Ok(Err(err)) => warn!(container = %id, error = %err, "Waiting for log follower failed"),
            Err(_) => {
                debug!(container = %id, "Log follower still running, killing it");
                if let Err(err) = follower.kill().await {
                    warn!(container = %id, error = %err, "Killing log follower failed");
                }
            }
        }
        Ok(())
    }

    fn tracked_instances(&self) -> usize {
        self.followers().len()
    }
}

/// Join docker arguments for logging with credential values masked.
fn mask_sensitive_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            SENSITIVE_ENV
                .iter()
                .find(|prefix| arg.starts_with(*prefix))
                .map_or_else(|| arg.clone(), |prefix| format!("{prefix}***"))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn request(dir: &Path) -> LaunchRequest {
        LaunchRequest {
            app_name: "weather".into(),
            app_dir: dir.to_path_buf(),
            port: 3039,
            credentials: Credentials::new("http://api", "token-123", "postgres://secret"),
        }
    }

    #[test]
    fn test_run_args_match_docker_contract() {
        let launcher = ContainerLauncher::new(ContainerSettings::default());
        let args = launcher.run_args(&request(Path::new("/app")));
        assert_eq!(
            args,
            vec![
                "run",
                "--name",
                "go-app-test-container",
                "-d",
                "-i",
                "-p",
                "3039:3000",
                "-e",
                "API_ENDPOINT=http://api",
                "-e",
                "API_TOKEN=token-123",
                "-e",
                "CONNECTION_STRING=postgres://secret",
                "-e",
                "LOG_LEVEL=info",
                "--add-host",
                "host.docker.internal:host-gateway",
                "go-app-test",
            ]
        );
    }

    #[test]
    fn test_mask_sensitive_args() {
        let args: Vec<String> = ["-e", "API_TOKEN=abc", "-e", "API_ENDPOINT=http://x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            mask_sensitive_args(&args),
            "-e API_TOKEN=*** -e API_ENDPOINT=http://x"
        );
    }

    #[cfg(unix)]
    mod fake_docker {
        use super::*;
        use serial_test::serial;
        use std::os::unix::fs::PermissionsExt;

        const SCRIPT: &str = r#"#!/bin/sh
here="$(dirname "$0")"
echo "$*" >> "$here/calls.log"
case "$1" in
  rm) echo "Error: No such container: $3" >&2; exit 1 ;;
  build) [ -f "$here/fail_build" ] && { echo "build step failed" >&2; exit 1; }; exit 0 ;;
  run) [ -f "$here/fail_run" ] && { echo "port is already allocated" >&2; exit 125; }; echo 4f1c2d; exit 0 ;;
  logs) echo "INFO app booting"; echo "WARN using defaults" >&2; exec sleep 30 ;;
  stop) [ -f "$here/fail_stop" ] && { echo "cannot stop container" >&2; exit 1; }; echo "$2"; exit 0 ;;
esac
exit 0
"#;

        fn install(dir: &Path) -> PathBuf {
            let path = dir.join("docker");
            std::fs::write(&path, SCRIPT).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn launcher(dir: &Path) -> ContainerLauncher {
            ContainerLauncher::new(ContainerSettings {
                docker_binary: install(dir),
                follower_grace: Duration::from_millis(200),
                ..ContainerSettings::default()
            })
        }

        fn calls(dir: &Path) -> Vec<String> {
            std::fs::read_to_string(dir.join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        #[tokio::test]
        #[serial]
        async fn test_start_then_stop_leaves_nothing_behind() {
            let bin = tempfile::tempdir().unwrap();
            let app = tempfile::tempdir().unwrap();
            let launcher = launcher(bin.path());

            let handle = launcher.start(&request(app.path())).await.unwrap();
            assert_eq!(handle.id.as_str(), "go-app-test-container");
            assert_eq!(launcher.tracked_instances(), 1);

            let mut lines = handle.logs.into_lines();
            let mut texts = Vec::new();
            for _ in 0..2 {
                let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                texts.push(line.text);
            }
            assert!(texts.contains(&"INFO app booting".to_string()));
            assert!(texts.contains(&"WARN using defaults".to_string()));

            launcher.stop(&handle.id).await.unwrap();
            assert_eq!(launcher.tracked_instances(), 0);

            let calls = calls(bin.path());
            assert!(calls[0].starts_with("rm -f go-app-test-container"));
            assert!(calls[1].starts_with(&format!("build {} -t go-app-test", app.path().display())));
            assert!(calls[2].starts_with("run --name go-app-test-container"));
            assert!(calls.iter().any(|c| c == "logs -f go-app-test-container"));
            assert_eq!(calls.last().map(String::as_str), Some("stop go-app-test-container"));
        }

        #[tokio::test]
        #[serial]
        async fn test_build_failure() {
            let bin = tempfile::tempdir().unwrap();
            std::fs::write(bin.path().join("fail_build"), "").unwrap();
            let launcher = launcher(bin.path());

            let err = launcher
                .start(&request(Path::new("/nonexistent")))
                .await
                .unwrap_err();
            match err {
                LaunchError::Build { image, detail } => {
                    assert_eq!(image, "go-app-test");
                    assert!(detail.contains("build step failed"), "{detail}");
                }
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(launcher.tracked_instances(), 0);
            assert!(!calls(bin.path()).iter().any(|c| c.starts_with("run")));
        }

        #[tokio::test]
        #[serial]
        async fn test_run_failure() {
            let bin = tempfile::tempdir().unwrap();
            std::fs::write(bin.path().join("fail_run"), "").unwrap();
            let launcher = launcher(bin.path());

            let err = launcher
                .start(&request(Path::new("/app")))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                LaunchError::Start {
                    mode: LaunchMode::Container,
                    ..
                }
            ));
            assert!(err.to_string().contains("port is already allocated"));
            assert_eq!(launcher.tracked_instances(), 0);
        }

        #[tokio::test]
        #[serial]
        async fn test_failed_stop_keeps_instance_tracked() {
            let bin = tempfile::tempdir().unwrap();
            let launcher = launcher(bin.path());
            let handle = launcher.start(&request(Path::new("/app"))).await.unwrap();

            std::fs::write(bin.path().join("fail_stop"), "").unwrap();
            let err = launcher.stop(&handle.id).await.unwrap_err();
            match err {
                TeardownError::StopFailed { instance, detail } => {
                    assert_eq!(instance, "go-app-test-container");
                    assert!(detail.contains("cannot stop container"));
                }
                other => panic!("unexpected error: {other}"),
            }
            assert_eq!(launcher.tracked_instances(), 1);

            std::fs::remove_file(bin.path().join("fail_stop")).unwrap();
            launcher.stop(&handle.id).await.unwrap();
            assert_eq!(launcher.tracked_instances(), 0);
        }

        #[tokio::test]
        #[serial]
        async fn test_missing_docker_binary() {
            let launcher = ContainerLauncher::new(ContainerSettings {
                docker_binary: PathBuf::from("/nonexistent/docker"),
                ..ContainerSettings::default()
            });
            let err = launcher
                .start(&request(Path::new("/app")))
                .await
                .unwrap_err();
            assert!(matches!(err, LaunchError::Build { .. }));
        }
    }
}
