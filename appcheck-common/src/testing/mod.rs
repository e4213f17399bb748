//! Test support: logging setup and in-memory doubles for the launcher and
//! the reset database.

mod log;
mod mock;

pub use log::init_test_logging;
pub use mock::{MemoryDatabase, MockLauncher};
