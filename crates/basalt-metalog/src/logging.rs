//! Structured logging setup for embedders.
//!
//! The crate itself only emits `tracing` events; this module is the
//! optional one-call subscriber initialization for servers that do not
//! already install their own. Call [`init_logging`] once at startup.
//!
//! The `RUST_LOG` environment variable, when set, overrides the
//! configured level filter, e.g. `RUST_LOG=basalt_metalog=debug`.

pub use crate::config::LogFormat;

use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Global flag to track if logging has been initialized.
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error). Overridden by the
    /// `RUST_LOG` environment variable when set.
    pub level: String,

    /// Console output format.
    pub format: LogFormat,

    /// Optional log file; when set, JSON lines are appended to it in
    /// addition to console output.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Initialize the global logging subscriber. Call once at startup;
/// subsequent calls return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match (config.format, config.file.as_ref()) {
        (LogFormat::Pretty, None) => registry.with(fmt::layer()).try_init()?,
        (LogFormat::Json, None) => registry.with(fmt::layer().json()).try_init()?,
        (LogFormat::Pretty, Some(path)) => registry
            .with(fmt::layer())
            .with(file_layer(path)?)
            .try_init()?,
        (LogFormat::Json, Some(path)) => registry
            .with(fmt::layer().json())
            .with(file_layer(path)?)
            .try_init()?,
    }

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}

type FileWriter = std::sync::Arc<std::fs::File>;

fn file_layer<S>(path: &std::path::Path) -> Result<impl tracing_subscriber::Layer<S>, LogError>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file: FileWriter = std::sync::Arc::new(
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?,
    );
    Ok(fmt::layer().json().with_ansi(false).with_writer(file))
}
