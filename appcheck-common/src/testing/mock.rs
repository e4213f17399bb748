use crate::config::LaunchMode;
use crate::error::{LaunchError, PreconditionError, TeardownError};
use crate::launcher::{InstanceHandle, InstanceId, LaunchRequest, Launcher};
use crate::monitor::LogStream;
use crate::reset::ResetDatabase;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncWriteExt, DuplexStream};

type SharedWriter = Arc<tokio::sync::Mutex<DuplexStream>>;

#[derive(Default)]
struct MockLauncherState {
    starts: AtomicUsize,
    stops: AtomicUsize,
    next_id: AtomicUsize,
    start_failure: Mutex<Option<LaunchError>>,
    stop_failure: Mutex<Option<String>>,
    initial_lines: Mutex<Vec<String>>,
    lines_after_stop: Mutex<Vec<String>>,
    requests: Mutex<Vec<LaunchRequest>>,
    writers: Mutex<HashMap<InstanceId, SharedWriter>>,
}

/// In-process launcher whose instances are in-memory pipes.
///
/// Tests push log lines with [`MockLauncher::emit`]; stopping an instance
/// closes its pipe.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<MockLauncherState>,
    mode: LaunchMode,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockLauncher {
    pub fn new(mode: LaunchMode) -> Self {
        Self {
            state: Arc::default(),
            mode,
        }
    }

    /// Lines written to every new instance's log stream right after start.
    pub fn with_initial_lines<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *lock(&self.state.initial_lines) = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Lines an instance writes while it is being stopped, before its pipe closes.
    pub fn with_lines_after_stop<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *lock(&self.state.lines_after_stop) = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Make the next `start` fail with `err`.
    pub fn fail_next_start(&self, err: LaunchError) {
        *lock(&self.state.start_failure) = Some(err);
    }

    /// Make every `stop` fail with `detail`.
    pub fn fail_stops_with(&self, detail: impl Into<String>) {
        *lock(&self.state.stop_failure) = Some(detail.into());
    }

    pub fn start_calls(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        lock(&self.state.requests).clone()
    }

    /// Write one line to every running instance. Returns how many received it.
    pub async fn emit(&self, line: &str) -> usize {
        let writers: Vec<SharedWriter> = lock(&self.state.writers).values().cloned().collect();
        let mut delivered = 0;
        for writer in writers {
            let mut writer = writer.lock().await;
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Launcher for MockLauncher {
    fn mode(&self) -> LaunchMode {
        self.mode
    }

    async fn start(&self, request: &LaunchRequest) -> Result<InstanceHandle, LaunchError> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.requests).push(request.clone());
        let failure = lock(&self.state.start_failure).take();
        if let Some(err) = failure {
            return Err(err);
        }

        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let id = InstanceId::new(format!("mock-{n}"));
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let initial = lock(&self.state.initial_lines).clone();
        for line in initial {
            writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .map_err(|err| LaunchError::Logs(err.to_string()))?;
        }
        lock(&self.state.writers).insert(id.clone(), Arc::new(tokio::sync::Mutex::new(writer)));

        Ok(InstanceHandle {
            id,
            mode: self.mode,
            logs: LogStream::single("mock", reader),
        })
    }

    async fn stop(&self, id: &InstanceId) -> Result<(), TeardownError> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        let Some(writer) = lock(&self.state.writers).remove(id) else {
            return Err(TeardownError::UnknownInstance(id.to_string()));
        };
        let trailing = lock(&self.state.lines_after_stop).clone();
        let mut writer = writer.lock().await;
        for line in trailing {
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                break;
            }
        }
        drop(writer);
        let failure = lock(&self.state.stop_failure).clone();
        match failure {
            Some(detail) => Err(TeardownError::StopFailed {
                instance: id.to_string(),
                detail,
            }),
            None => Ok(()),
        }
    }

    fn tracked_instances(&self) -> usize {
        lock(&self.state.writers).len()
    }
}

#[derive(Debug, Default)]
struct MemoryDbState {
    apps: HashMap<String, Option<String>>,
    scripts: Vec<String>,
    script_failure: Option<String>,
    keep_initialization: bool,
}

/// In-memory stand-in for the `public.eliona_app` table.
///
/// By default executing any script clears every `initialized_at`.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryDbState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app(self, app_name: &str, initialized_at: Option<&str>) -> Self {
        lock(&self.state)
            .apps
            .insert(app_name.to_string(), initialized_at.map(str::to_string));
        self
    }

    /// Scripts no longer clear the marker, as if `reset.sql` missed it.
    pub fn keep_initialization_on_reset(self) -> Self {
        lock(&self.state).keep_initialization = true;
        self
    }

    pub fn fail_scripts_with(self, message: &str) -> Self {
        lock(&self.state).script_failure = Some(message.to_string());
        self
    }

    /// Mark an app initialized, as the app itself does on startup.
    pub fn mark_initialized(&self, app_name: &str, at: &str) {
        lock(&self.state)
            .apps
            .insert(app_name.to_string(), Some(at.to_string()));
    }

    pub fn scripts(&self) -> Vec<String> {
        lock(&self.state).scripts.clone()
    }

    /// `None` when the row is missing, `Some(None)` when it is uninitialized.
    pub fn initialized(&self, app_name: &str) -> Option<Option<String>> {
        lock(&self.state).apps.get(app_name).cloned()
    }
}

impl ResetDatabase for MemoryDatabase {
    async fn execute_script(&self, script: &str) -> Result<(), PreconditionError> {
        let mut state = lock(&self.state);
        if let Some(message) = state.script_failure.clone() {
            return Err(PreconditionError::ResetScript(message));
        }
        state.scripts.push(script.to_string());
        if !state.keep_initialization {
            for marker in state.apps.values_mut() {
                *marker = None;
            }
        }
        Ok(())
    }

    async fn initialized_at(&self, app_name: &str) -> Result<Option<String>, PreconditionError> {
        lock(&self.state)
            .apps
            .get(app_name)
            .cloned()
            .ok_or_else(|| PreconditionError::AppRowMissing(app_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn request() -> LaunchRequest {
        LaunchRequest {
            app_name: "weather".into(),
            app_dir: "/app".into(),
            port: 3039,
            credentials: Credentials::new("a", "b", "c"),
        }
    }

    #[tokio::test]
    async fn test_mock_launcher_round_trip() {
        let launcher = MockLauncher::new(LaunchMode::Direct).with_initial_lines(["INFO hello"]);
        let handle = launcher.start(&request()).await.unwrap();
        assert_eq!(launcher.tracked_instances(), 1);
        assert_eq!(launcher.emit("INFO second").await, 1);

        let mut lines = handle.logs.into_lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap().text, "INFO hello");
        assert_eq!(lines.next_line().await.unwrap().unwrap().text, "INFO second");

        launcher.stop(&handle.id).await.unwrap();
        assert_eq!(launcher.tracked_instances(), 0);
        assert!(lines.next_line().await.is_none());
        assert_eq!(launcher.start_calls(), 1);
        assert_eq!(launcher.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_lines_after_stop_precede_end_of_stream() {
        let launcher = MockLauncher::new(LaunchMode::Container).with_lines_after_stop(["INFO bye"]);
        let handle = launcher.start(&request()).await.unwrap();
        let mut lines = handle.logs.into_lines();

        launcher.stop(&handle.id).await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap().text, "INFO bye");
        assert!(lines.next_line().await.is_none());
    }
}
