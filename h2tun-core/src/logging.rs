//! Logging bootstrap.
//!
//! The level comes from `H2TUN_LOG_LEVEL`, falling back to `LOG_LEVEL`;
//! anything unrecognized means `info`.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn parse_level(raw: &str) -> Level {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Log level selected by the environment.
pub fn env_level() -> Level {
    let raw = std::env::var("H2TUN_LOG_LEVEL")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_default();
    parse_level(&raw)
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let _ = FmtSubscriber::builder()
        .with_max_level(env_level())
        .with_target(false)
        .try_init();
}
