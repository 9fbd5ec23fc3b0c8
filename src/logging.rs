use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber for library consumers and tests.
///
/// Respects `RUST_LOG`; defaults to `info` for the crate when unset. Safe to
/// call more than once.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("lifesheet=info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
