//! Tracing bootstrap for Strata.
//!
//! Library code only emits `tracing` events; the owning process calls one of
//! the `init*` functions once to install a subscriber.

use strata_config::LoggingConfig;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber at INFO.
///
/// # Examples
///
/// ```
/// use strata_common::logging;
///
/// // Initialize with default log level (INFO)
/// logging::init();
///
/// // Initialize with a specific log level; a second call is a no-op
/// logging::init_with_level(tracing::Level::DEBUG);
/// ```
pub fn init() {
    init_with_level(Level::INFO);
}

/// Initialize the tracing subscriber with a specific log level.
///
/// The level applies to every `strata*` target; `RUST_LOG` directives are
/// honoured on top of it. Calling this more than once is harmless.
pub fn init_with_level(level: Level) {
    let mut filter = EnvFilter::from_default_env();
    match format!("strata={}", level).parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => warn!("Ignoring invalid log directive for level {}: {}", level, e),
    }

    // try_init: a global subscriber may already be installed (tests, host app)
    let result = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true),
        )
        .with(filter)
        .try_init();

    if result.is_ok() {
        info!("Logging initialized at level: {}", level);
    }
}

/// Initialize the tracing subscriber from the `logging` configuration section.
///
/// Unknown level names fall back to INFO with a warning.
pub fn init_from_config(config: &LoggingConfig) {
    match parse_level(&config.level) {
        Some(level) => init_with_level(level),
        None => {
            init_with_level(Level::INFO);
            warn!("Unknown log level '{}', using INFO", config.level);
        }
    }
}

/// Parses a case-insensitive level name (`trace`, `debug`, `info`, `warn`, `error`).
pub fn parse_level(level: &str) -> Option<Level> {
    level.trim().parse::<Level>().ok()
}

/// Log an error with context at the ERROR level.
pub fn log_error<E: std::fmt::Display>(error: E, context: &str) {
    error!("{}: {}", context, error);
}

/// Log a result, with different messages for success and error cases.
///
/// # Returns
///
/// The original result, allowing this function to be used in a chain.
pub fn log_result<T, E: std::fmt::Display>(
    result: Result<T, E>,
    success_message: &str,
    error_context: &str,
) -> Result<T, E> {
    match &result {
        Ok(_) => info!("{}", success_message),
        Err(e) => error!("{}: {}", error_context, e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_any_case() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("WARN"), Some(Level::WARN));
        assert_eq!(parse_level(" info "), Some(Level::INFO));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_log_result_passes_value_through() {
        let ok: Result<u8, String> = log_result(Ok(3), "done", "failed");
        assert_eq!(ok, Ok(3));

        let err: Result<u8, String> = log_result(Err("nope".to_string()), "done", "failed");
        assert_eq!(err, Err("nope".to_string()));
    }

    #[test]
    fn test_init_is_idempotent() {
        init_from_config(&LoggingConfig {
            level: "debug".to_string(),
        });
        init();
    }
}
