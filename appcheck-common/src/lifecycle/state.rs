//! Run states and the process-wide run slot.

use crate::error::{HarnessError, PreconditionError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// State of a harness run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Resetting,
    Launching,
    AwaitingReady,
    Ready,
    /// Terminal; no instance exists.
    Failed,
    TearingDown,
    /// Terminal; the instance has been torn down.
    Stopped,
}

impl RunState {
    /// Whether moving from `self` to `next` is a legal edge.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Resetting)
                | (Idle, Failed)
                | (Resetting, Launching)
                | (Resetting, Failed)
                | (Launching, AwaitingReady)
                | (Launching, Failed)
                | (AwaitingReady, Ready)
                | (AwaitingReady, TearingDown)
                | (Ready, TearingDown)
                | (TearingDown, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// Whether an instance may exist in this state.
    pub fn has_instance(self) -> bool {
        matches!(self, Self::AwaitingReady | Self::Ready | Self::TearingDown)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Resetting => write!(f, "resetting"),
            Self::Launching => write!(f, "launching"),
            Self::AwaitingReady => write!(f, "awaiting_ready"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::TearingDown => write!(f, "tearing_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub state: RunState,
    /// Time since the run started.
    #[serde(with = "duration_millis")]
    pub at: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Current state plus the transition history, rejecting illegal edges.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
    started: Instant,
    history: Vec<Transition>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Idle,
            started: Instant::now(),
            history: vec![Transition {
                state: RunState::Idle,
                at: Duration::ZERO,
            }],
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// States visited so far, in order.
    pub fn states(&self) -> Vec<RunState> {
        self.history.iter().map(|t| t.state).collect()
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), HarnessError> {
        if !self.current.can_transition_to(next) {
            return Err(HarnessError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        debug!(from = %self.current, to = %next, "Run state transition");
        self.current = next;
        self.history.push(Transition {
            state: next,
            at: self.started.elapsed(),
        });
        Ok(())
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

static RUN_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Exclusive claim on the single run allowed per process. Released on drop.
#[derive(Debug)]
pub struct RunSlot {
    _private: (),
}

impl RunSlot {
    pub fn acquire() -> Result<Self, PreconditionError> {
        RUN_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self { _private: () })
            .map_err(|_| PreconditionError::RunAlreadyActive)
    }

    pub fn is_held() -> bool {
        RUN_ACTIVE.load(Ordering::Acquire)
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        RUN_ACTIVE.store(false, Ordering::Release);
    }
}
