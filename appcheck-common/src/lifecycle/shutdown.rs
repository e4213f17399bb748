//! One-shot teardown guard.
//!
//! The first caller of [`ShutdownToken::shutdown`] wins an atomic
//! compare-and-swap, records its reason and launches the teardown action on
//! the runtime. Every caller, winner included, then waits on a watch channel
//! for the single outcome, so teardown runs exactly once no matter how many
//! tasks race for it and no matter whether the winner is cancelled.

use crate::error::TeardownError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;
use tracing::{debug, info};

type TeardownAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TeardownError>> + Send>;

/// Why teardown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The log monitor saw a fatal line.
    FatalLog(String),
    /// The readiness deadline elapsed.
    ReadinessTimeout,
    /// The tests finished (or bailed out) on their own.
    Completed,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FatalLog(line) => write!(f, "fatal log line: {line}"),
            Self::ReadinessTimeout => write!(f, "readiness timeout"),
            Self::Completed => write!(f, "run completed"),
        }
    }
}

struct Inner {
    fired: AtomicBool,
    action: Mutex<Option<TeardownAction>>,
    reason: OnceLock<ShutdownReason>,
    requested: watch::Sender<bool>,
    outcome: watch::Sender<Option<Result<(), TeardownError>>>,
}

/// Cloneable handle to a single teardown.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TeardownError>> + Send + 'static,
    {
        let action: TeardownAction = Box::new(move || action().boxed());
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                action: Mutex::new(Some(action)),
                reason: OnceLock::new(),
                requested: watch::Sender::new(false),
                outcome: watch::Sender::new(None),
            }),
        }
    }

    /// Request teardown and wait for it to finish.
    ///
    /// Only the first call runs the action; later calls keep the first reason
    /// and return the same outcome.
    pub async fn shutdown(&self, reason: ShutdownReason) -> Result<(), TeardownError> {
        if self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(%reason, "Shutdown requested");
            let _ = self.inner.reason.set(reason);
            self.inner.requested.send_replace(true);

            let action = self
                .inner
                .action
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let result = match action {
                    Some(action) => action().await,
                    None => Ok(()),
                };
                inner.outcome.send_replace(Some(result));
            });
        } else {
            debug!(%reason, "Shutdown already requested, waiting for outcome");
        }
        self.completed().await
    }

    /// Wait until the teardown action has finished and return its outcome.
    pub async fn completed(&self) -> Result<(), TeardownError> {
        let mut outcome = self.inner.outcome.subscribe();
        match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Err(TeardownError::Abandoned)),
            Err(_) => Err(TeardownError::Abandoned),
        }
    }

    /// Resolves as soon as any caller has requested shutdown.
    pub async fn requested(&self) {
        let mut requested = self.inner.requested.subscribe();
        let _ = requested.wait_for(|fired| *fired).await;
    }

    pub fn is_requested(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// The reason given by the winning caller, if any.
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.inner.reason.get()
    }

    /// Outcome of a finished teardown, without waiting.
    pub fn outcome(&self) -> Option<Result<(), TeardownError>> {
        self.inner.outcome.borrow().clone()
    }
}

impl fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("requested", &self.is_requested())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_token(delay: Duration) -> (ShutdownToken, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let token = ShutdownToken::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(())
        });
        (token, runs)
    }

    #[tokio::test]
    async fn test_concurrent_callers_run_action_once() {
        let (token, runs) = counting_token(Duration::from_millis(50));

        let mut handles = Vec::new();
        for i in 0..8 {
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let reason = if i % 2 == 0 {
                    ShutdownReason::Completed
                } else {
                    ShutdownReason::FatalLog(format!("ERROR {i}"))
                };
                token.shutdown(reason).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(()));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(token.is_requested());
        assert_eq!(token.outcome(), Some(Ok(())));
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let (token, _runs) = counting_token(Duration::ZERO);
        token
            .shutdown(ShutdownReason::FatalLog("FATAL disk full".into()))
            .await
            .unwrap();
        token.shutdown(ShutdownReason::Completed).await.unwrap();
        assert_eq!(
            token.reason(),
            Some(&ShutdownReason::FatalLog("FATAL disk full".into()))
        );
    }

    #[tokio::test]
    async fn test_failure_is_observed_by_every_caller() {
        let token = ShutdownToken::new(|| async {
            Err(TeardownError::StopFailed {
                instance: "go-app-test-container".into(),
                detail: "exit status 1".into(),
            })
        });
        let first = token.shutdown(ShutdownReason::Completed).await;
        let second = token.shutdown(ShutdownReason::ReadinessTimeout).await;
        assert!(matches!(first, Err(TeardownError::StopFailed { .. })));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_requested_resolves_before_action_finishes() {
        let (token, _runs) = counting_token(Duration::from_secs(5));
        assert!(!token.is_requested());

        let waiter = token.clone();
        let requested = tokio::spawn(async move { waiter.requested().await });

        let trigger = token.clone();
        tokio::spawn(async move { trigger.shutdown(ShutdownReason::Completed).await });

        tokio::time::timeout(Duration::from_secs(1), requested)
            .await
            .expect("requested() should resolve promptly")
            .unwrap();
        assert_eq!(token.outcome(), None);
    }

    #[tokio::test]
    async fn test_cancelled_winner_still_completes() {
        let (token, runs) = counting_token(Duration::from_millis(50));

        let winner = token.clone();
        let _ = tokio::time::timeout(
            Duration::from_millis(5),
            winner.shutdown(ShutdownReason::Completed),
        )
        .await;

        assert_eq!(token.completed().await, Ok(()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
