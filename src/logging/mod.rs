//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `gateway` - server startup, shutdown, background tasks
//! - `ws` - WebSocket connections and session lifecycle
//! - `commands` - command dispatch
//! - `auth` - authentication
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `TERMGATE_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//!
//! # Examples
//!
//! ```no_run
//! use termgate::logging::{init_logging, LogConfig, LogFormat, LogOutput};
//!
//! // Production setup (JSON to stdout)
//! init_logging(LogConfig::production()).unwrap();
//!
//! // Or, with file output:
//! // init_logging(LogConfig {
//! //     format: LogFormat::Json,
//! //     output: LogOutput::File("/var/log/termgate.log".into()),
//! //     default_level: tracing::Level::INFO,
//! // })
//! ```

pub mod audit;

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    /// Write to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout, debug level
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout, info level
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// `TERMGATE_DEV` set to anything truthy selects development output.
    pub fn from_env() -> Self {
        let dev = std::env::var("TERMGATE_DEV")
            .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);
        if dev {
            Self::development()
        } else {
            Self::production()
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks TERMGATE_LOG first, then RUST_LOG, falling back to the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("TERMGATE_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let level = default_level.as_str().to_lowercase();
    let default_filter = format!(
        "{level},{}={level},{}={level},{}={level},{}={level},{}={level}",
        targets::GATEWAY,
        targets::WS,
        targets::COMMANDS,
        targets::AUTH,
        targets::CONFIG,
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => BoxMakeWriter::new(File::create(path)?),
    })
}

/// Initialize the logging subsystem with the given configuration.
///
/// Call once at startup; a second call returns
/// [`LoggingError::AlreadyInitialized`].
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;
    let writer = make_writer(&config.output)?;

    // RFC 3339 timestamp format
    let timer = UtcTime::rfc_3339();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Log target constants for consistent naming across the codebase
pub mod targets {
    pub const GATEWAY: &str = "gateway";
    pub const WS: &str = "ws";
    pub const COMMANDS: &str = "commands";
    pub const AUTH: &str = "auth";
    pub const CONFIG: &str = "config";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Serializes tests that modify env vars.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_log_config_presets() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Plaintext);
        assert_eq!(config.default_level, Level::INFO);

        let config = LogConfig::development();
        assert_eq!(config.format, LogFormat::Plaintext);
        assert_eq!(config.default_level, Level::DEBUG);

        let config = LogConfig::production();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stdout);
    }

    #[test]
    fn test_log_config_from_env() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("TERMGATE_DEV", "1");
        assert_eq!(LogConfig::from_env().format, LogFormat::Plaintext);
        std::env::set_var("TERMGATE_DEV", "false");
        assert_eq!(LogConfig::from_env().format, LogFormat::Json);
        std::env::remove_var("TERMGATE_DEV");
        assert_eq!(LogConfig::from_env().format, LogFormat::Json);
    }

    #[test]
    fn test_env_filter_default() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::remove_var("TERMGATE_LOG");
        std::env::remove_var("RUST_LOG");
        assert!(build_env_filter(Level::INFO).is_ok());
    }

    #[test]
    fn test_env_filter_termgate_log() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("TERMGATE_LOG", "ws=trace,commands=debug");
        assert!(build_env_filter(Level::INFO).is_ok());
        std::env::remove_var("TERMGATE_LOG");
    }

    #[test]
    fn test_env_filter_invalid() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("TERMGATE_LOG", "ws=notalevel");
        let result = build_env_filter(Level::INFO);
        std::env::remove_var("TERMGATE_LOG");
        assert!(matches!(result, Err(LoggingError::FilterParse(_))));
    }

    #[test]
    fn test_file_writer_created() {
        let file = NamedTempFile::new().unwrap();
        let output = LogOutput::File(file.path().to_path_buf());
        assert!(make_writer(&output).is_ok());

        let missing = LogOutput::File(PathBuf::from("/nonexistent/dir/termgate.log"));
        assert!(matches!(
            make_writer(&missing),
            Err(LoggingError::FileCreation(_))
        ));
    }
}
