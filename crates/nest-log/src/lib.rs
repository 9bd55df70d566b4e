// ABOUTME: Shared logging setup for all nest binaries
// ABOUTME: Two functions: init() for defaults, init_with_level() for CLI overrides

use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
/// Used by CLI and daemon binaries.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Logging to stderr with an explicit level override (e.g. from --log-level).
/// Falls back to INFO if the level string does not parse.
pub fn init_with_level(level: &str) {
    let default = level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default.into()))
        .init();
}
