//! Structured logging setup
//!
//! `RUST_LOG` overrides the configured directive when set.

use tracing_subscriber::EnvFilter;

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output
    Pretty,
    /// Single-line human-readable output
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is not set
    pub directive: String,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            format: LogFormat::Compact,
            directive: "info,certa_cert=warn".to_string(),
            thread_names: true,
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        LoggingConfig {
            format: LogFormat::Json,
            ..LoggingConfig::default()
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log directive: {0}")]
    Directive(String),

    #[error("Global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install the global tracing subscriber
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.directive)
            .map_err(|e| LoggingError::Directive(e.to_string()))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(config.thread_names);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}
