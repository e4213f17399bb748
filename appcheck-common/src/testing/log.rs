use std::sync::Once;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a test-writer tracing subscriber once per process.
///
/// `APPCHECK_TEST_LOG_LEVEL` sets the level for the appcheck targets
/// (default `debug`); `APPCHECK_TEST_LOG_JSON=1` switches to JSON lines.
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let level = std::env::var("APPCHECK_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "appcheck={level},appcheck_common={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let json = std::env::var("APPCHECK_TEST_LOG_JSON").is_ok_and(|v| v == "1");
        let (json_layer, text_layer) = if json {
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_test_writer()
                        .with_current_span(true),
                ),
                None,
            )
        } else {
            (
                None,
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_test_writer()
                        .with_target(true)
                        .compact(),
                ),
            )
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(text_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
