//! Development helpers for tests and examples.

use std::env;

use tracing_subscriber::EnvFilter;

/// Install a tracing subscriber for test runs.
///
/// `RUST_LOG` takes precedence when set. Otherwise `KEELSON_LOG=<level>`
/// enables just the keelson crates at that level, keeping dependency noise
/// out of loop and channel traces. With neither variable set this is a
/// no-op, and a subscriber installed earlier always wins.
pub fn init_tracing() {
    let filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if let Ok(level) = env::var("KEELSON_LOG") {
        let spec = format!("keelson={level},keelson_core={level},keelson_local={level}");
        match EnvFilter::try_new(spec) {
            Ok(filter) => filter,
            Err(_) => return,
        }
    } else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
