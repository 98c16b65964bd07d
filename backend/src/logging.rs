//! Logging configuration
//!
//! Structured logging with tracing.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Targets are the compiled crate names: the binary, the backend library and the adapters.
pub const DEFAULT_DIRECTIVES: &str = "nodescope=info,backend=info,adapters=info";

/// Builds the filter: `RUST_LOG` wins, then the configured level, then the default.
pub fn filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match level {
        Some(level) if !level.trim().is_empty() => EnvFilter::new(format!(
            "nodescope={level},backend={level},adapters={level}",
            level = level.trim()
        )),
        _ => EnvFilter::new(DEFAULT_DIRECTIVES),
    })
}

/// Initialize logging with environment-based filtering
pub fn init(level: Option<&str>) {
    fmt()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
