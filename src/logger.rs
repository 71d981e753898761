// src/logger.rs

use std::{fmt, path::Path, str::FromStr};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt, prelude::*};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Unknown names fall back to `info`.
    pub fn parse_lenient(level: &str) -> Self {
        level.parse().unwrap_or_default()
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the global subscriber:
///
/// - stdout, filtered by `RUST_LOG` or `log_level`
/// - `log_dir/log_file`, daily rolling plain text
/// - `log_dir/event_file`, daily rolling JSON with one line per correlated
///   request (`target: "request"`)
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(log_dir: &Path, log_file: &str, event_file: &str, log_level: LogLevel) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{},rumqttc=warn", log_level.as_str()))
        })
    };

    let stdout_layer = tracing_fmt::layer()
        .with_target(false)
        .with_filter(filter());

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_file);
    let txt_layer = tracing_fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(filter());

    let json_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, event_file);
    let json_layer = tracing_fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default()
        .with(stdout_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("DEBUG".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::parse_lenient("loud"), LogLevel::Info);
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn init_creates_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        // a second install in the same test binary may fail; the directory is
        // created either way
        let _ = init_tracing(&logs, "iotflow.log", "requests.json", LogLevel::Debug);
        assert!(logs.is_dir());
    }
}
