//! Structured logging setup for edgellm
//!
//! Logs always go to stderr: stdout carries command output and, under `serve`, the
//! JSON-RPC stream.
//!
//! ```no_run
//! use edgellm::util::logging;
//!
//! logging::init_from_env();
//! tracing::info!("Runtime started");
//! ```

use std::env;
use std::io;
use std::sync::Once;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Dependencies that are chatty at the runtime's own level
const QUIET_TARGETS: &[&str] = &["h2=warn", "hyper=warn", "hyper_util=warn", "reqwest=warn"];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level for edgellm's own events
    pub level: Level,

    /// One JSON object per event, for devices that ship their logs elsewhere
    pub use_json: bool,

    /// Source file and line on every event
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Reads `EDGELLM_LOG_LEVEL` and `EDGELLM_LOG_JSON`
    pub fn from_env() -> Self {
        let level = env::var("EDGELLM_LOG_LEVEL")
            .map(|value| parse_level(&value))
            .unwrap_or(Level::INFO);
        let use_json = env::var("EDGELLM_LOG_JSON")
            .ok()
            .and_then(|value| value.parse::<bool>().ok())
            .unwrap_or(false);

        Self {
            level,
            use_json,
            include_location: use_json,
        }
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::from_default_env();
        if let Ok(own) = format!("edgellm={}", self.level).parse() {
            filter = filter.add_directive(own);
        }

        // An explicit RUST_LOG decides about dependencies on its own
        if env::var("RUST_LOG").is_err() {
            for directive in QUIET_TARGETS.iter().filter_map(|t| t.parse().ok()) {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// Parses a level name, falling back to INFO with a warning on stderr
pub fn parse_level(level_str: &str) -> Level {
    match level_str.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            eprintln!(
                "Invalid log level '{}', using info (expected trace, debug, info, warn or error)",
                other
            );
            Level::INFO
        }
    }
}

/// Installs the global subscriber. Only the first call has an effect.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let json = config.use_json.then(|| {
            fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_current_span(false)
        });
        let console = (!config.use_json).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
        });

        let installed = tracing_subscriber::registry()
            .with(config.filter())
            .with(json)
            .with(console)
            .try_init();
        if let Err(e) = installed {
            eprintln!("Logging already initialized elsewhere: {}", e);
        }
    });
}

pub fn init_default() {
    init_logging(LoggingConfig::default());
}

pub fn init_from_env() {
    init_logging(LoggingConfig::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use yare::parameterized;

    #[parameterized(
        trace = { "trace", Level::TRACE },
        mixed_case = { "Debug", Level::DEBUG },
        warning_alias = { "warning", Level::WARN },
        padded = { " error ", Level::ERROR },
        unknown = { "loud", Level::INFO },
        empty = { "", Level::INFO },
    )]
    fn test_parse_level(input: &str, expected: Level) {
        assert_eq!(parse_level(input), expected);
    }

    #[test]
    #[serial]
    fn test_from_env_json_includes_location() {
        env::set_var("EDGELLM_LOG_LEVEL", "debug");
        env::set_var("EDGELLM_LOG_JSON", "true");
        let config = LoggingConfig::from_env();
        env::remove_var("EDGELLM_LOG_LEVEL");
        env::remove_var("EDGELLM_LOG_JSON");

        assert_eq!(config.level, Level::DEBUG);
        assert!(config.use_json);
        assert!(config.include_location);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        env::remove_var("EDGELLM_LOG_LEVEL");
        env::remove_var("EDGELLM_LOG_JSON");
        let config = LoggingConfig::from_env();
        assert_eq!(config.level, Level::INFO);
        assert!(!config.use_json);
    }

    #[test]
    fn test_filter_names_own_crate() {
        let filter = LoggingConfig::with_level(Level::DEBUG).filter();
        assert!(filter.to_string().contains("edgellm=debug"));
    }
}
