//! Instance log stream and fatal-line monitor.
//!
//! A [`LogStream`] merges any number of byte sources (stdout and stderr of a
//! child, a `docker logs -f` follower, an in-memory pipe) into one lazy line
//! sequence. The [`LogMonitor`] consumes it on a background task, forwards
//! every line to tracing and fires the [`ShutdownToken`] on the first line
//! starting with `FATAL` or `ERROR`.

use crate::lifecycle::{ShutdownReason, ShutdownToken};
use futures::StreamExt;
use futures::stream::{BoxStream, SelectAll};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Literal, case-sensitive prefixes marking a fatal line.
pub const FATAL_MARKERS: [&str; 2] = ["FATAL", "ERROR"];

/// Whether a log line reports a fatal condition.
pub fn is_fatal_line(line: &str) -> bool {
    FATAL_MARKERS.iter().any(|marker| line.starts_with(marker))
}

/// A readable source of instance output.
pub type LogSource = Box<dyn AsyncRead + Send + Unpin>;

/// One line of instance output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Label of the source the line came from (`stdout`, `stderr`, ...).
    pub source: Arc<str>,
    pub text: String,
}

/// Unconsumed set of log sources belonging to one instance.
#[derive(Default)]
pub struct LogStream {
    sources: Vec<(Arc<str>, LogSource)>,
}

impl LogStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(label: &str, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let mut stream = Self::new();
        stream.push(label, reader);
        stream
    }

    pub fn push(&mut self, label: &str, reader: impl AsyncRead + Send + Unpin + 'static) {
        self.sources.push((Arc::from(label), Box::new(reader)));
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Turn the sources into a single merged line sequence.
    pub fn into_lines(self) -> LogLines {
        let mut merged = SelectAll::new();
        for (label, reader) in self.sources {
            merged.push(source_lines(label, reader));
        }
        LogLines { merged }
    }
}

impl fmt::Debug for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.sources.iter().map(|(label, _)| &**label).collect();
        f.debug_struct("LogStream").field("sources", &labels).finish()
    }
}

fn source_lines(label: Arc<str>, reader: LogSource) -> BoxStream<'static, io::Result<LogLine>> {
    let lines = BufReader::new(reader).lines();
    futures::stream::unfold(Some((lines, label)), |state| async move {
        let (mut lines, label) = state?;
        match lines.next_line().await {
            Ok(Some(text)) => {
                let line = LogLine {
                    source: Arc::clone(&label),
                    text,
                };
                Some((Ok(line), Some((lines, label))))
            }
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
    .boxed()
}

/// Lazy, non-restartable line sequence. Ends when every source has closed.
pub struct LogLines {
    merged: SelectAll<BoxStream<'static, io::Result<LogLine>>>,
}

impl LogLines {
    /// Next line from whichever source produces one first.
    ///
    /// A read error is yielded once and ends that source only.
    pub async fn next_line(&mut self) -> Option<io::Result<LogLine>> {
        self.merged.next().await
    }
}

/// How a monitor run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// All sources closed without a fatal line.
    Closed { lines: u64 },
    /// A fatal line was seen; reading stopped there.
    Fatal { line: String, lines: u64 },
}

impl MonitorOutcome {
    pub fn lines(&self) -> u64 {
        match self {
            Self::Closed { lines } | Self::Fatal { lines, .. } => *lines,
        }
    }

    pub fn fatal_line(&self) -> Option<&str> {
        match self {
            Self::Fatal { line, .. } => Some(line),
            Self::Closed { .. } => None,
        }
    }
}

/// Create a linked reporter/watch pair for the first fatal line of a run.
pub fn fatal_signal() -> (FatalReporter, FatalWatch) {
    let (tx, rx) = watch::channel(None);
    (FatalReporter { tx }, FatalWatch { rx })
}

/// Write side of the fatal-line record.
#[derive(Debug)]
pub struct FatalReporter {
    tx: watch::Sender<Option<String>>,
}

impl FatalReporter {
    fn report(&self, line: &str) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(line.to_string());
                true
            } else {
                false
            }
        });
    }
}

/// Read side of the fatal-line record.
#[derive(Debug, Clone)]
pub struct FatalWatch {
    rx: watch::Receiver<Option<String>>,
}

impl FatalWatch {
    /// First fatal line seen so far.
    pub fn current(&self) -> Option<String> {
        self.rx.borrow().clone()
    }
}

/// Watches instance output for fatal lines.
#[derive(Debug)]
pub struct LogMonitor {
    token: ShutdownToken,
    reporter: FatalReporter,
    seen: Arc<AtomicU64>,
}

impl LogMonitor {
    pub fn new(token: ShutdownToken, reporter: FatalReporter) -> Self {
        Self {
            token,
            reporter,
            seen: Arc::default(),
        }
    }

    /// Lines read so far, kept current even if the monitor task is aborted.
    pub fn line_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.seen)
    }

    /// Consume `lines` until they close or a fatal line appears.
    ///
    /// On a fatal line the line is recorded, teardown is requested and the
    /// monitor waits for it to finish before returning.
    pub async fn watch(self, mut lines: LogLines) -> MonitorOutcome {
        let mut seen = 0u64;
        while let Some(next) = lines.next_line().await {
            let line = match next {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "Reading instance output failed, source closed");
                    continue;
                }
            };
            seen += 1;
            self.seen.fetch_add(1, Ordering::Relaxed);
            debug!(target: "appcheck::instance", source = %line.source, "{}", line.text);

            if is_fatal_line(&line.text) {
                warn!(line = %line.text, "Fatal line in instance output");
                self.reporter.report(&line.text);
                if let Err(err) = self
                    .token
                    .shutdown(ShutdownReason::FatalLog(line.text.clone()))
                    .await
                {
                    warn!(error = %err, "Teardown after fatal line failed");
                }
                return MonitorOutcome::Fatal {
                    line: line.text,
                    lines: seen,
                };
            }
        }
        debug!(lines = seen, "Instance output closed");
        MonitorOutcome::Closed { lines: seen }
    }

    pub fn spawn(self, lines: LogLines) -> JoinHandle<MonitorOutcome> {
        tokio::spawn(self.watch(lines))
    }
}
