//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once per process
//! - Pick the output format and destination from configuration
//!
//! # Design Decisions
//! - Filters use `EnvFilter` syntax (`info`, `rdvp=debug,tower_http=warn`)
//! - File destinations append and never carry ANSI colors
//! - A second initialization is reported, not fatal

use std::fmt;
use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Default filter.
pub const DEFAULT_FILTER: &str = "info";

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    Json,
    Console,
    #[default]
    Color,
    LightConsole,
    LightColor,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "console" => Ok(LogFormat::Console),
            "color" => Ok(LogFormat::Color),
            "light-console" => Ok(LogFormat::LightConsole),
            "light-color" => Ok(LogFormat::LightColor),
            other => Err(LoggingError::Format(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Json => "json",
            LogFormat::Console => "console",
            LogFormat::Color => "color",
            LogFormat::LightConsole => "light-console",
            LogFormat::LightColor => "light-color",
        })
    }
}

/// Where log lines go: `stderr`, `stdout` or a file path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogDestination {
    #[default]
    Stderr,
    Stdout,
    File(String),
}

impl FromStr for LogDestination {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "stderr" => LogDestination::Stderr,
            "stdout" => LogDestination::Stdout,
            path => LogDestination::File(path.to_string()),
        })
    }
}

impl fmt::Display for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogDestination::Stderr => f.write_str("stderr"),
            LogDestination::Stdout => f.write_str("stdout"),
            LogDestination::File(path) => f.write_str(path),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filters: String,
    pub format: LogFormat,
    pub destination: LogDestination,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filters: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            destination: LogDestination::default(),
        }
    }
}

/// Error type for logging setup.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("unknown log format '{0}': expected json, console, color, light-console or light-color")]
    Format(String),
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("cannot open log file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(format: LogFormat, writer: W, ansi_allowed: bool) -> BoxedLayer
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let base = tracing_subscriber::fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => base.json().with_ansi(false).boxed(),
        LogFormat::Console => base.with_ansi(false).boxed(),
        LogFormat::Color => base.with_ansi(ansi_allowed).boxed(),
        LogFormat::LightConsole => base.compact().with_target(false).with_ansi(false).boxed(),
        LogFormat::LightColor => base
            .compact()
            .with_target(false)
            .with_ansi(ansi_allowed)
            .boxed(),
    }
}

/// Build the filter, failing on syntax errors.
pub fn build_filter(filters: &str) -> Result<EnvFilter, LoggingError> {
    let filters = if filters.trim().is_empty() {
        DEFAULT_FILTER
    } else {
        filters
    };
    EnvFilter::try_new(filters).map_err(|e| LoggingError::Filter(e.to_string()))
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init(config: &LogConfig) -> Result<bool, LoggingError> {
    let filter = build_filter(&config.filters)?;

    let layer = match &config.destination {
        LogDestination::Stderr => format_layer(config.format, std::io::stderr, true),
        LogDestination::Stdout => format_layer(config.format, std::io::stdout, true),
        LogDestination::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            format_layer(config.format, Mutex::new(file), false)
        }
    };

    Ok(tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .is_ok())
}
