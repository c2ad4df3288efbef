//! Logging setup for tests.
use tracing_subscriber::EnvFilter;

/// Initialize logging for a test, writing to the output the test harness captures.
///
/// Safe to call from every test; only the first call installs the global subscriber.
pub fn init_test_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ssbatch=debug,info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
