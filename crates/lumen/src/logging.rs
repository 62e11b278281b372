//! Logging initialization.
//!
//! Logs go to stderr; stdout carries the status lines of `lumen run`.
//! `RUST_LOG` overrides the configured level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber with `level` as the default filter.
pub fn init(level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Initialize from the `[logging]` section; `--verbose` forces at least debug.
pub fn init_from_config(config: &lumen_core::Config, verbose: bool, json_logs: bool) {
    let level = effective_level(&config.logging.level, verbose);
    let json_format = json_logs || config.logging.format == "json";
    init(level, json_format);
}

fn effective_level(configured: &str, verbose: bool) -> &str {
    if verbose && configured != "trace" {
        "debug"
    } else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_level_to_debug() {
        assert_eq!(effective_level("info", true), "debug");
        assert_eq!(effective_level("trace", true), "trace");
        assert_eq!(effective_level("warn", false), "warn");
    }
}
