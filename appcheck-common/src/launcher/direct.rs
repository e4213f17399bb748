//! Direct-process launcher.

use super::{InstanceHandle, InstanceId, LaunchRequest, Launcher};
use crate::config::{DEFAULT_DIRECT_COMMAND, HarnessConfig, LaunchMode};
use crate::error::{LaunchError, TeardownError};
use crate::monitor::LogStream;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A child process started by [`DirectLauncher`].
#[derive(Debug)]
struct ProcessInfo {
    pid: Option<u32>,
    started_at: Instant,
    child: Child,
}

/// Runs the application command as a child process of the harness.
///
/// The child gets its own process group so a forced stop also reaches
/// anything it spawned (`go run` execs the compiled binary as a grandchild).
#[derive(Debug)]
pub struct DirectLauncher {
    program: String,
    args: Vec<String>,
    managed_processes: Mutex<HashMap<InstanceId, ProcessInfo>>,
}

impl DirectLauncher {
    /// `command[0]` is the program, the rest are its arguments.
    pub fn new(command: Vec<String>) -> Self {
        let mut words = command.into_iter();
        let program = words
            .next()
            .unwrap_or_else(|| DEFAULT_DIRECT_COMMAND.split(' ').next().unwrap_or("go").to_string());
        Self {
            program,
            args: words.collect(),
            managed_processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.direct_command.clone())
    }

    fn processes(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, ProcessInfo>> {
        self.managed_processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&request.app_dir)
            .envs(request.credentials.env_pairs())
            .env("APPNAME", &request.app_name)
            .env("API_SERVER_PORT", request.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl Launcher for DirectLauncher {
    fn mode(&self) -> LaunchMode {
        LaunchMode::Direct
    }

    async fn start(&self, request: &LaunchRequest) -> Result<InstanceHandle, LaunchError> {
        info!(
            program = %self.program,
            args = ?self.args,
            dir = %request.app_dir.display(),
            "Starting app process"
        );
        let mut child = self
            .build_command(request)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let pid = child.id();
        let mut logs = LogStream::new();
        if let Some(stdout) = child.stdout.take() {
            logs.push("stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            logs.push("stderr", stderr);
        }

        let id = InstanceId::new(match pid {
            Some(pid) => format!("pid-{pid}"),
            None => format!("pid-unknown-{}", self.processes().len()),
        });
        self.processes().insert(
            id.clone(),
            ProcessInfo {
                pid,
                started_at: Instant::now(),
                child,
            },
        );
        debug!(instance = %id, "Registered app process");

        Ok(InstanceHandle {
            id,
            mode: LaunchMode::Direct,
            logs,
        })
    }

    async fn stop(&self, id: &InstanceId) -> Result<(), TeardownError> {
        let Some(mut info) = self.processes().remove(id) else {
            return Err(TeardownError::UnknownInstance(id.to_string()));
        };
        debug!(
            instance = %id,
            uptime = ?info.started_at.elapsed(),
            "Killing app process"
        );

        if let Ok(Some(status)) = info.child.try_wait() {
            info!(instance = %id, %status, "App process had already exited");
            return Ok(());
        }

        #[cfg(unix)]
        if let Some(pid) = info.pid {
            kill_process_group(pid).await;
        }

        info.child
            .kill()
            .await
            .map_err(|err| TeardownError::StopFailed {
                instance: id.to_string(),
                detail: err.to_string(),
            })?;
        info!(instance = %id, "App process stopped");
        Ok(())
    }

    fn tracked_instances(&self) -> usize {
        self.processes().len()
    }
}

/// Best-effort SIGKILL to the whole process group led by `pid`.
#[cfg(unix)]
async fn kill_process_group(pid: u32) {
    let result = Command::new("sh")
        .args(["-c", &format!("kill -s KILL -- -{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pid, %status, "Process group kill reported failure"),
        Err(err) => warn!(pid, error = %err, "Could not run kill for process group"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use std::path::Path;
    use std::time::Duration;

    fn request(dir: &Path) -> LaunchRequest {
        LaunchRequest {
            app_name: "weather".into(),
            app_dir: dir.to_path_buf(),
            port: 3039,
            credentials: Credentials::new("http://api", "token", "postgres://db"),
        }
    }

    fn shell(script: &str) -> DirectLauncher {
        DirectLauncher::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = shell("echo started; sleep 30");

        let handle = launcher.start(&request(dir.path())).await.unwrap();
        assert_eq!(handle.mode, LaunchMode::Direct);
        assert_eq!(launcher.tracked_instances(), 1);

        let mut lines = handle.logs.into_lines();
        let first = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.text, "started");

        launcher.stop(&handle.id).await.unwrap();
        assert_eq!(launcher.tracked_instances(), 0);

        // Killing the process closes its pipes.
        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            while lines.next_line().await.is_some() {}
        })
        .await;
        assert!(rest.is_ok(), "log stream should close after stop");
    }

    #[tokio::test]
    async fn test_child_sees_app_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = shell(
            "echo \"$APPNAME $API_SERVER_PORT $API_ENDPOINT\"; pwd; echo oops >&2; sleep 30",
        );
        let handle = launcher.start(&request(dir.path())).await.unwrap();

        let mut lines = handle.logs.into_lines();
        let mut seen = Vec::new();
        while seen.len() < 3 {
            let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push((line.source.to_string(), line.text));
        }
        launcher.stop(&handle.id).await.unwrap();

        assert!(seen.contains(&("stdout".into(), "weather 3039 http://api".into())));
        assert!(seen.contains(&("stderr".into(), "oops".into())));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(
            seen.iter()
                .any(|(_, text)| Path::new(text).canonicalize().ok() == Some(canonical.clone()))
        );
    }

    #[tokio::test]
    async fn test_stop_after_exit_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = shell("exit 0");
        let handle = launcher.start(&request(dir.path())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        launcher.stop(&handle.id).await.unwrap();
        assert_eq!(launcher.tracked_instances(), 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_instance() {
        let launcher = shell("true");
        let err = launcher.stop(&InstanceId::new("pid-0")).await.unwrap_err();
        assert_eq!(err, TeardownError::UnknownInstance("pid-0".into()));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = DirectLauncher::new(vec!["/nonexistent/app-binary".into()]);
        let err = launcher.start(&request(dir.path())).await.unwrap_err();
        assert!(matches!(
            err,
            LaunchError::Spawn { ref program, .. } if program == "/nonexistent/app-binary"
        ));
        assert_eq!(launcher.tracked_instances(), 0);
    }
}
