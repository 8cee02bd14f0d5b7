use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Installs a `tracing` subscriber printing through the test harness, so the
/// output of a test is only shown when it fails. Filtered by `RUST_LOG`,
/// warnings and errors by default. The first call wins.
pub(crate) fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .with_target(true)
            .try_init();
    });
}
