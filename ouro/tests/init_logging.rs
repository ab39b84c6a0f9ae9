//! Test-only: installs a tracing subscriber driven by `RUST_LOG`.
//!
//! Include `mod init_logging;` and call `init_logging::init()` at the top of
//! a test so events from the library (e.g. watcher reconcile warnings) show
//! up with `--nocapture`. Safe to call from every test; only the first call
//! installs.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

#[allow(dead_code)]
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
