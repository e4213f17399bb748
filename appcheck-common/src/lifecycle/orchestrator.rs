use super::shutdown::{ShutdownReason, ShutdownToken};
use super::state::{RunSlot, RunState, RunStateMachine, Transition};
use crate::config::{HarnessConfig, LaunchMode};
use crate::error::{HarnessError, HarnessResult, ReadinessError};
use crate::launcher::{InstanceId, LaunchRequest, Launcher};
use crate::metadata::LoadedMetadata;
use crate::monitor::{self, FatalWatch, LogMonitor, MonitorOutcome};
use crate::readiness::{ReadinessProber, ReadyReport};
use crate::reset::{ResetDatabase, ResetGate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long the monitor may keep draining output after teardown finished.
const MONITOR_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What the tests get once the instance is ready.
#[derive(Debug, Clone)]
pub struct ReadyContext {
    pub metadata: Arc<LoadedMetadata>,
    pub base_url: String,
    pub mode: LaunchMode,
    pub instance: InstanceId,
    pub readiness: ReadyReport,
}

impl ReadyContext {
    pub fn app_name(&self) -> &str {
        &self.metadata.metadata.name
    }
}

/// Outcome of a run whose tests completed and whose teardown succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<T> {
    pub final_state: RunState,
    pub output: T,
    pub readiness: ReadyReport,
    pub history: Vec<Transition>,
    pub log_lines: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Drives one run: reset, launch, readiness race, tests, teardown.
pub struct Orchestrator<L, D> {
    config: HarnessConfig,
    launcher: Arc<L>,
    gate: ResetGate<D>,
    state: RunStateMachine,
}

/// Everything produced between launch and the start of teardown.
struct Supervised<T> {
    readiness: Option<ReadyReport>,
    output: Result<T, HarnessError>,
}

impl<L: Launcher, D: ResetDatabase> Orchestrator<L, D> {
    pub fn new(config: HarnessConfig, launcher: Arc<L>, gate: ResetGate<D>) -> Self {
        Self {
            config,
            launcher,
            gate,
            state: RunStateMachine::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state.current()
    }

    pub fn history(&self) -> &[Transition] {
        self.state.history()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn launcher(&self) -> &Arc<L> {
        &self.launcher
    }

    /// Run the whole lifecycle, calling `tests` once the instance is ready.
    ///
    /// The test future is dropped if a fatal log line arrives while it runs.
    /// Teardown happens exactly once whenever an instance was started, and a
    /// teardown failure takes priority over every other result.
    pub async fn run<F, Fut, T>(&mut self, tests: F) -> HarnessResult<RunReport<T>>
    where
        F: FnOnce(ReadyContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let started_at = Utc::now();
        let _slot = RunSlot::acquire()?;

        let prepared = ReadinessProber::new(self.config.readiness)
            .and_then(|prober| LoadedMetadata::load(&self.config.metadata_path()).map(|m| (prober, m)));
        let (prober, loaded) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.state.advance(RunState::Failed)?;
                return Err(err.into());
            }
        };
        let loaded = Arc::new(loaded);
        let app_name = loaded.metadata.name.clone();
        info!(app = %app_name, mode = %self.config.mode, "Starting harness run");

        self.state.advance(RunState::Resetting)?;
        if let Err(err) = self.gate.reset_and_verify(&app_name).await {
            error!(error = %err, "Database reset gate failed");
            self.state.advance(RunState::Failed)?;
            return Err(err.into());
        }

        self.state.advance(RunState::Launching)?;
        let request = LaunchRequest::from_config(&self.config, app_name.as_str());
        let handle = match self.launcher.start(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, "Launch failed");
                self.state.advance(RunState::Failed)?;
                return Err(err.into());
            }
        };
        let instance = handle.id.clone();
        info!(instance = %instance, "Instance started");

        let token = self.teardown_token(instance.clone());
        let (reporter, fatal) = monitor::fatal_signal();
        let monitor = LogMonitor::new(token.clone(), reporter);
        let line_counter = monitor.line_counter();
        let mut monitor = monitor.spawn(handle.logs.into_lines());

        let supervised = self
            .supervise(&prober, &token, &fatal, loaded, instance.clone(), tests)
            .await;

        // Any state error above is an internal bug; teardown still runs.
        let reason = match &supervised.output {
            Err(HarnessError::ReadinessTimeout { .. }) => ShutdownReason::ReadinessTimeout,
            _ => ShutdownReason::Completed,
        };
        if let Err(err) = self.state.advance(RunState::TearingDown) {
            warn!(error = %err, "Unexpected state before teardown");
        }
        let teardown = token.shutdown(reason).await;
        drain_monitor(&mut monitor).await;
        let log_lines = line_counter.load(Ordering::Relaxed);
        if let Err(err) = self.state.advance(RunState::Stopped) {
            warn!(error = %err, "Unexpected state after teardown");
        }

        if let Err(err) = teardown {
            error!(instance = %instance, error = %err, "Teardown failed");
            return Err(err.into());
        }
        if let Some(line) = fatal.current() {
            error!(instance = %instance, %line, "Run failed on fatal log line");
            return Err(HarnessError::FatalLog { line });
        }

        let output = supervised.output?;
        let readiness = supervised.readiness.ok_or(HarnessError::InvalidTransition {
            from: RunState::AwaitingReady,
            to: RunState::TearingDown,
        })?;
        info!(instance = %instance, log_lines, "Harness run finished");
        Ok(RunReport {
            final_state: self.state.current(),
            output,
            readiness,
            history: self.state.history().to_vec(),
            log_lines,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Teardown: stop the instance, then wait the cool-down for trailing
    /// output, then let go of it.
    fn teardown_token(&self, instance: InstanceId) -> ShutdownToken {
        let launcher = Arc::clone(&self.launcher);
        let cool_down = self.config.cool_down;
        ShutdownToken::new(move || async move {
            launcher.stop(&instance).await?;
            debug!(instance = %instance, cool_down = ?cool_down, "Instance stopped, cooling down");
            tokio::time::sleep(cool_down).await;
            debug!(instance = %instance, "Instance released");
            Ok(())
        })
    }

    /// AwaitingReady and Ready, racing both against a shutdown request.
    async fn supervise<F, Fut, T>(
        &mut self,
        prober: &ReadinessProber,
        token: &ShutdownToken,
        fatal: &FatalWatch,
        loaded: Arc<LoadedMetadata>,
        instance: InstanceId,
        tests: F,
    ) -> Supervised<T>
    where
        F: FnOnce(ReadyContext) -> Fut,
        Fut: Future<Output = T>,
    {
        if let Err(err) = self.state.advance(RunState::AwaitingReady) {
            return Supervised {
                readiness: None,
                output: Err(err),
            };
        }

        let base_url = self.config.base_url();
        let url = loaded.metadata.version_url(&base_url);
        let readiness = match prober.wait_ready(&url, token.requested()).await {
            Ok(report) => report,
            Err(ReadinessError::Timeout { deadline, attempts }) => {
                error!(%url, attempts, "Instance did not become ready");
                return Supervised {
                    readiness: None,
                    output: Err(HarnessError::ReadinessTimeout { deadline, attempts }),
                };
            }
            Err(ReadinessError::Cancelled { attempts }) => {
                warn!(%url, attempts, "Readiness wait cancelled by shutdown request");
                return Supervised {
                    readiness: None,
                    output: Err(preempted(fatal)),
                };
            }
        };

        if let Err(err) = self.state.advance(RunState::Ready) {
            return Supervised {
                readiness: Some(readiness),
                output: Err(err),
            };
        }
        let context = ReadyContext {
            metadata: loaded,
            base_url,
            mode: self.launcher.mode(),
            instance,
            readiness,
        };

        info!("Instance ready, running tests");
        let output = tokio::select! {
            output = tests(context) => Ok(output),
            () = token.requested() => {
                warn!("Tests preempted by shutdown request");
                Err(preempted(fatal))
            }
        };
        Supervised {
            readiness: Some(readiness),
            output,
        }
    }
}

fn preempted(fatal: &FatalWatch) -> HarnessError {
    HarnessError::FatalLog {
        line: fatal.current().unwrap_or_default(),
    }
}

/// Wait briefly for the monitor to see the end of the output, then abort it.
async fn drain_monitor(monitor: &mut JoinHandle<MonitorOutcome>) {
    match tokio::time::timeout(MONITOR_DRAIN_GRACE, &mut *monitor).await {
        Ok(Ok(outcome)) => debug!(lines = outcome.lines(), "Log monitor finished"),
        Ok(Err(err)) => warn!(error = %err, "Log monitor task failed"),
        Err(_) => {
            debug!("Log monitor still reading after teardown, aborting it");
            monitor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::error::{LaunchError, PreconditionError};
    use crate::testing::{MemoryDatabase, MockLauncher};
    use serial_test::serial;

    fn app_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("metadata.json"),
            r#"{"name": "weather", "apiUrl": "v1"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("reset.sql"), "SELECT 1;").unwrap();
        dir
    }

    fn config(dir: &std::path::Path) -> HarnessConfig {
        let mut config = HarnessConfig::new(
            dir,
            LaunchMode::Direct,
            Credentials::new("http://api", "token", "postgres://db"),
        );
        config.host = "127.0.0.1".into();
        // Nothing listens on port 1.
        config.port = 1;
        config.cool_down = Duration::from_millis(10);
        config.readiness.deadline = Duration::from_millis(300);
        config.readiness.interval = Duration::from_millis(50);
        config.readiness.request_timeout = Duration::from_millis(25);
        config
    }

    fn orchestrator(
        dir: &std::path::Path,
        launcher: &MockLauncher,
        db: MemoryDatabase,
    ) -> Orchestrator<MockLauncher, MemoryDatabase> {
        let config = config(dir);
        let gate = ResetGate::new(db, config.reset_script_path());
        Orchestrator::new(config, Arc::new(launcher.clone()), gate)
    }

    #[tokio::test]
    #[serial]
    async fn test_initialized_app_never_launches() {
        let dir = app_dir();
        let launcher = MockLauncher::new(LaunchMode::Direct);
        let db = MemoryDatabase::new()
            .with_app("weather", Some("2026-01-01"))
            .keep_initialization_on_reset();
        let mut orchestrator = orchestrator(dir.path(), &launcher, db);

        let err = orchestrator.run(|_| async {}).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Precondition(PreconditionError::AlreadyInitialized { .. })
        ));
        assert_eq!(orchestrator.state(), RunState::Failed);
        assert!(
            !orchestrator
                .history()
                .iter()
                .any(|t| t.state == RunState::Launching)
        );
        assert_eq!(launcher.start_calls(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_launch_failure_needs_no_teardown() {
        let dir = app_dir();
        let launcher = MockLauncher::new(LaunchMode::Container);
        launcher.fail_next_start(LaunchError::Build {
            image: "go-app-test".into(),
            detail: "exit status 1".into(),
        });
        let db = MemoryDatabase::new().with_app("weather", None);
        let mut orchestrator = orchestrator(dir.path(), &launcher, db);

        let err = orchestrator.run(|_| async {}).await.unwrap_err();
        assert!(matches!(err, HarnessError::Launch(LaunchError::Build { .. })));
        assert_eq!(orchestrator.state(), RunState::Failed);
        assert_eq!(launcher.stop_calls(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_readiness_timeout_tears_down_once() {
        let dir = app_dir();
        let launcher = MockLauncher::new(LaunchMode::Direct);
        let db = MemoryDatabase::new().with_app("weather", None);
        let mut orchestrator = orchestrator(dir.path(), &launcher, db);

        let err = orchestrator
            .run(|_| async { "tests ran" })
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::ReadinessTimeout { .. }));
        assert_eq!(orchestrator.state(), RunState::Stopped);
        assert_eq!(launcher.stop_calls(), 1);
        assert_eq!(launcher.tracked_instances(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_metadata_fails_in_idle() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new(LaunchMode::Direct);
        let mut orchestrator = orchestrator(dir.path(), &launcher, MemoryDatabase::new());

        let err = orchestrator.run(|_| async {}).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Precondition(PreconditionError::MetadataRead { .. })
        ));
        assert_eq!(
            orchestrator.history().iter().map(|t| t.state).collect::<Vec<_>>(),
            vec![RunState::Idle, RunState::Failed]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_second_concurrent_run_is_rejected() {
        let dir = app_dir();
        let launcher = MockLauncher::new(LaunchMode::Direct);
        let _held = RunSlot::acquire().unwrap();
        let mut orchestrator = orchestrator(dir.path(), &launcher, MemoryDatabase::new());

        let err = orchestrator.run(|_| async {}).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Precondition(PreconditionError::RunAlreadyActive)
        ));
        assert_eq!(orchestrator.state(), RunState::Idle);
    }
}
