//! Run lifecycle: states, the one-shot shutdown token and the orchestrator
//! that drives reset, launch, readiness, tests and teardown.

mod orchestrator;
mod shutdown;
mod state;

pub use orchestrator::{Orchestrator, ReadyContext, RunReport};
pub use shutdown::{ShutdownReason, ShutdownToken};
pub use state::{RunSlot, RunState, RunStateMachine, Transition};
