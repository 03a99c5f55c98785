//! Structured logging for kiln.
//!
//! Log levels:
//! - ERROR: Failures the user has to act on (store cannot be written)
//! - WARN: Recoverable conditions (corrupt fingerprint store, bad env values)
//! - INFO: Run milestones (tasks started and finished, run summary)
//! - DEBUG: Classification reasons and scheduling decisions
//!
//! Output goes to stderr so the run report on stdout stays clean.
//! `KILN_LOG` takes an `EnvFilter` directive and wins over the CLI level.
//! Debug mode can be enabled with `--debug` or `KILN_DEBUG=1`.

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "KILN_LOG";

/// Environment variable forcing debug output.
pub const DEBUG_ENV: &str = "KILN_DEBUG";

/// Verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Silent => LevelFilter::OFF,
        }
    }
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Pick the effective level from the CLI flags and `KILN_DEBUG`.
pub fn effective_level(level: LogLevel, debug: bool) -> LevelFilter {
    if debug || env_debug() {
        LevelFilter::DEBUG
    } else {
        level.as_filter()
    }
}

/// Install the global subscriber.
///
/// Calling this twice is harmless; the second install is ignored.
pub fn init(level: LogLevel, debug: bool) {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::new(directive),
        _ => EnvFilter::default().add_directive(effective_level(level, debug).into()),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .compact()
        .try_init();
}
