use std::env;

use thiserror::Error;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
    #[error("unknown LOG_LEVEL: `{0}`")]
    UnknownLevel(String),
}

pub struct Logging;

impl Logging {
    /// Installs the global subscriber. The default level comes from
    /// `LOG_LEVEL` (debug/info/warning/error/critical), ANSI colors from
    /// `LOG_COLORIZED` (0/1); both can still be overridden per-module
    /// through the standard env-filter directives.
    pub fn try_init() -> Result<(), LoggingError> {
        let level = level_from_env()?;
        let colorized = matches!(env::var("LOG_COLORIZED").as_deref(), Ok("1"));

        tracing_subscriber::fmt()
            .with_ansi(colorized)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            )
            .try_init()
            .map_err(|_| {
                LoggingError::TryInitError(
                    "unable to set global logging subscriber".to_string(),
                )
            })
    }
}

fn level_from_env() -> Result<LevelFilter, LoggingError> {
    let raw = env::var("LOG_LEVEL").unwrap_or_else(|_| "warning".to_string());
    match raw.to_lowercase().as_str() {
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warning" => Ok(LevelFilter::WARN),
        "error" | "critical" => Ok(LevelFilter::ERROR),
        _ => Err(LoggingError::UnknownLevel(raw)),
    }
}
