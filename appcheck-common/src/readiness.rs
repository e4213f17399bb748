//! Readiness probing.
//!
//! Polls an HTTP endpoint on a fixed tick until it answers with a success
//! status, the deadline elapses, or the caller cancels.

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{PreconditionError, ReadinessError};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Timing of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Overall time allowed for the instance to become ready.
    pub deadline: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// Timeout of a single probe request.
    pub request_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_READY_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Result of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ReadyReport {
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub status: u16,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

/// HTTP poller for a readiness endpoint.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    policy: ReadinessPolicy,
}

impl ReadinessProber {
    pub fn new(policy: ReadinessPolicy) -> Result<Self, PreconditionError> {
        let client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .map_err(|err| PreconditionError::HttpClient(err.to_string()))?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Poll `url` until it answers with a success status.
    ///
    /// Connection errors and non-success statuses are retried on the next
    /// tick. The wait ends early, with [`ReadinessError::Cancelled`], once
    /// `cancel` resolves.
    pub async fn wait_ready(
        &self,
        url: &str,
        cancel: impl Future<Output = ()>,
    ) -> Result<ReadyReport, ReadinessError> {
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.policy.deadline);
        tokio::pin!(deadline);
        tokio::pin!(cancel);

        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        debug!(%url, deadline = ?self.policy.deadline, "Waiting for readiness");
        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    debug!(%url, attempts, "Readiness wait cancelled");
                    return Err(ReadinessError::Cancelled { attempts });
                }
                _ = &mut deadline => return Err(self.timed_out(attempts)),
                _ = ticker.tick() => {
                    attempts += 1;
                    // A probe in flight must not outlive the deadline or a cancel.
                    let sent = tokio::select! {
                        biased;
                        _ = &mut cancel => {
                            debug!(%url, attempts, "Readiness wait cancelled during probe");
                            return Err(ReadinessError::Cancelled { attempts });
                        }
                        _ = &mut deadline => return Err(self.timed_out(attempts)),
                        sent = self.client.get(url).send() => sent,
                    };
                    match sent {
                        Ok(response) if response.status().is_success() => {
                            let report = ReadyReport {
                                attempts,
                                elapsed: started.elapsed(),
                                status: response.status().as_u16(),
                            };
                            info!(%url, attempts, elapsed = ?report.elapsed, "Instance is ready");
                            return Ok(report);
                        }
                        Ok(response) => {
                            debug!(%url, attempts, status = response.status().as_u16(), "Not ready yet");
                        }
                        Err(err) => {
                            debug!(%url, attempts, error = %err, "Readiness probe failed");
                        }
                    }
                }
            }
        }
    }

    fn timed_out(&self, attempts: u32) -> ReadinessError {
        ReadinessError::Timeout {
            deadline: self.policy.deadline,
            attempts,
        }
    }

    /// [`wait_ready`](Self::wait_ready) bounded only by the deadline.
    pub async fn wait_ready_until_deadline(&self, url: &str) -> Result<ReadyReport, ReadinessError> {
        self.wait_ready(url, std::future::pending()).await
    }
}
