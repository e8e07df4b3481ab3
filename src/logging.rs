//! Tracing subscriber setup for applications embedding the layer.
//!
//! The library only emits `tracing` events. Binaries and test harnesses that
//! want them printed call [`init`] once at startup.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "holdfast.log";

/// Install a global subscriber: stderr always, plus a daily-rolling file when
/// `config.file` is set. `RUST_LOG` overrides `config.level`.
///
/// Keep the returned guard alive for as long as file logging should flush.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = filter(config)?;
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file, guard) = if config.file {
    let directory = log_directory(config)?;
    std::fs::create_dir_all(&directory)?;

    let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn filter(config: &LogConfig) -> Result<EnvFilter> {
  match EnvFilter::try_from_default_env() {
    Ok(filter) => Ok(filter),
    Err(_) => Ok(EnvFilter::try_new(format!("holdfast={},warn", config.level))?),
  }
}

fn log_directory(config: &LogConfig) -> Result<PathBuf> {
  if let Some(directory) = &config.directory {
    return Ok(directory.clone());
  }

  dirs::data_dir()
    .map(|dir| dir.join("holdfast").join("logs"))
    .ok_or_else(|| eyre!("could not determine data directory for log files"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_explicit_directory_wins() {
    let config = LogConfig {
      directory: Some(PathBuf::from("/tmp/holdfast-logs")),
      ..LogConfig::default()
    };
    assert_eq!(
      log_directory(&config).unwrap(),
      PathBuf::from("/tmp/holdfast-logs")
    );
  }

  #[test]
  fn test_configured_level_builds_filter() {
    let config = LogConfig {
      level: "debug".into(),
      ..LogConfig::default()
    };
    assert!(filter(&config).is_ok());
  }
}
