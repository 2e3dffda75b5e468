//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries call [`init`] once.

use crate::config::LoggingConfig;
use std::sync::Once;
use tracing::Level;

static INIT: Once = Once::new();

/// Parse a textual level, falling back to INFO.
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Install a stderr fmt subscriber. Subsequent calls are no-ops.
pub fn init(config: &LoggingConfig, debug: bool) {
    let level = if debug {
        Level::DEBUG
    } else {
        parse_level(&config.level)
    };

    INIT.call_once(|| {
        let result = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
        if let Err(e) = result {
            eprintln!("Warning: logging already initialized: {e}");
        }
    });
}
