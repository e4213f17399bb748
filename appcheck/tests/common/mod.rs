pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_contains, assert_exit_code};
pub use fixtures::AppFixture;
pub use logging::init_test_logging;
