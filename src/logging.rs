use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{
    EnvFilter, Registry, filter::LevelFilter, fmt as tracing_fmt, layer::SubscriberExt, reload,
    util::SubscriberInitExt,
};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to install subscriber: {0}")]
    InitError(#[from] tracing_subscriber::util::TryInitError),
    #[error("Failed to change log level: {0}")]
    ReloadError(#[from] reload::Error),
}

/// Verbosity of the swarm's log output. `Critical` is emitted at error level
/// with a `critical` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "RawLogLevel")]
pub enum LogLevel {
    Silent,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Silent => LevelFilter::OFF,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

/// Case-insensitive. Unknown names fall back to `Info`.
impl From<&str> for LogLevel {
    fn from(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "silent" | "notset" | "off" => LogLevel::Silent,
            "debug" | "trace" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" | "fatal" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

impl FromStr for LogLevel {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(LogLevel::from(s))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            LogLevel::Silent => "silent",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.pad(level)
    }
}

/// Config files may give the level by name or by its numeric code.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLogLevel {
    Name(String),
    Code(u8),
}

impl From<RawLogLevel> for LogLevel {
    fn from(raw: RawLogLevel) -> Self {
        match raw {
            RawLogLevel::Name(name) => LogLevel::from(name.as_str()),
            RawLogLevel::Code(0) => LogLevel::Silent,
            RawLogLevel::Code(2) => LogLevel::Debug,
            RawLogLevel::Code(3) => LogLevel::Warning,
            RawLogLevel::Code(4) => LogLevel::Error,
            RawLogLevel::Code(5) => LogLevel::Critical,
            RawLogLevel::Code(_) => LogLevel::Info,
        }
    }
}

pub fn log(message: &str, level: LogLevel) {
    match level {
        LogLevel::Silent => {}
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warning => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
        LogLevel::Critical => tracing::error!(critical = true, "{}", message),
    }
}

/// Changes the level of the subscriber installed by [`init`].
pub struct LogHandle {
    handle: reload::Handle<LevelFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: LogLevel) -> Result<(), LoggingError> {
        self.handle.reload(level.as_filter())?;
        Ok(())
    }

    pub fn level(&self) -> Option<LevelFilter> {
        self.handle.clone_current()
    }
}

/// Install a global fmt subscriber at `level`. `RUST_LOG`, when set, narrows
/// it further.
pub fn init(level: LogLevel) -> Result<LogHandle, LoggingError> {
    let (filter, handle) = reload::Layer::new(level.as_filter());
    tracing_subscriber::registry()
        .with(filter)
        .with(EnvFilter::try_from_default_env().ok())
        .with(
            tracing_fmt::layer()
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;
    Ok(LogHandle { handle })
}
