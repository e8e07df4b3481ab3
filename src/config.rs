use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Layer configuration. Every section is optional in YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub fetch: FetchConfig,
  pub cache: CacheConfig,
  pub network: NetworkConfig,
  pub queue: QueueConfig,
  pub logging: LogConfig,
}

/// Resolved per-call configuration.
///
/// The layer-wide value acts as the default; [`FetchOptions::resolve`] produces
/// the copy used by a single `fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  /// Total attempts before giving up
  pub max_retries: u32,
  #[serde(rename = "base_delay_ms", with = "duration_ms")]
  pub base_delay: Duration,
  #[serde(rename = "max_delay_ms", with = "duration_ms")]
  pub max_delay: Duration,
  /// Timeout applied to each attempt separately
  #[serde(rename = "attempt_timeout_ms", with = "duration_ms")]
  pub attempt_timeout: Duration,
  /// Upper bound of the random delay added to each backoff
  #[serde(rename = "jitter_ms", with = "duration_ms")]
  pub jitter: Duration,
  pub cache_enabled: bool,
  #[serde(rename = "cache_ttl_ms", with = "duration_ms")]
  pub cache_ttl: Duration,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_secs(30),
      attempt_timeout: Duration::from_secs(10),
      jitter: Duration::from_millis(1000),
      cache_enabled: true,
      cache_ttl: Duration::from_secs(300),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How often expired entries are swept
  #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
  pub sweep_interval: Duration,
  /// How long an expired entry survives the sweep as a stale fallback
  #[serde(rename = "stale_retention_ms", with = "duration_ms")]
  pub stale_retention: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      sweep_interval: Duration::from_secs(60),
      stale_retention: Duration::ZERO,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  #[serde(rename = "probe_interval_ms", with = "duration_ms")]
  pub probe_interval: Duration,
  #[serde(rename = "probe_timeout_ms", with = "duration_ms")]
  pub probe_timeout: Duration,
  /// Consecutive probe failures that turn Online into Unstable
  pub unstable_after_failures: u32,
  /// URL for the built-in HTTP probe, if the host doesn't supply its own
  pub probe_url: Option<String>,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_interval: Duration::from_secs(10),
      probe_timeout: Duration::from_secs(5),
      unstable_after_failures: 3,
      probe_url: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  #[serde(rename = "drain_interval_ms", with = "duration_ms")]
  pub drain_interval: Duration,
  /// Queued items kept per key; the oldest is dropped on overflow
  pub max_depth_per_key: usize,
  /// Replays an item gets before it is dropped
  pub max_replays: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      drain_interval: Duration::from_secs(5),
      max_depth_per_key: 10,
      max_replays: 3,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is not set
  pub level: String,
  /// Also write a daily rolling log file
  pub file: bool,
  /// Log directory (defaults to $XDG_DATA_HOME/holdfast/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
      directory: None,
    }
  }
}

/// Per-call overrides for [`FetchConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
  /// Skip the cache fast paths and always hit the network
  pub force_refresh: bool,
  pub cache_ttl: Option<Duration>,
  pub max_retries: Option<u32>,
  pub attempt_timeout: Option<Duration>,
  pub cache_enabled: Option<bool>,
  /// Await a queued replay instead of returning `FetchError::Pending`
  pub wait_for_replay: bool,
}

impl FetchOptions {
  pub fn force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.cache_ttl = Some(ttl);
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
    self.attempt_timeout = Some(timeout);
    self
  }

  pub fn without_cache(mut self) -> Self {
    self.cache_enabled = Some(false);
    self
  }

  pub fn wait_for_replay(mut self) -> Self {
    self.wait_for_replay = true;
    self
  }

  /// Apply these overrides on top of the layer defaults.
  pub fn resolve(&self, defaults: &FetchConfig) -> FetchConfig {
    FetchConfig {
      max_retries: self.max_retries.unwrap_or(defaults.max_retries),
      attempt_timeout: self.attempt_timeout.unwrap_or(defaults.attempt_timeout),
      cache_enabled: self.cache_enabled.unwrap_or(defaults.cache_enabled),
      cache_ttl: self.cache_ttl.unwrap_or(defaults.cache_ttl),
      ..defaults.clone()
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./holdfast.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/holdfast/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  /// Parse configuration from a YAML string.
  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("holdfast.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("holdfast").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

/// Durations as integer milliseconds.
mod duration_ms {
  use serde::{Deserialize, Deserializer};
  use std::time::Duration;

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml_str(
      r#"
fetch:
  max_retries: 5
  base_delay_ms: 250
queue:
  max_depth_per_key: 2
"#,
    )
    .unwrap();

    assert_eq!(config.fetch.max_retries, 5);
    assert_eq!(config.fetch.base_delay, Duration::from_millis(250));
    assert_eq!(config.fetch.max_delay, Duration::from_secs(30));
    assert_eq!(config.queue.max_depth_per_key, 2);
    assert_eq!(config.queue.drain_interval, Duration::from_secs(5));
    assert_eq!(config.network, NetworkConfig::default());
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache:\n  stale_retention_ms: 60000").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.cache.stale_retention, Duration::from_secs(60));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_options_override_defaults() {
    let defaults = FetchConfig::default();
    let resolved = FetchOptions::default()
      .with_ttl(Duration::from_secs(5))
      .with_max_retries(1)
      .without_cache()
      .resolve(&defaults);

    assert_eq!(resolved.cache_ttl, Duration::from_secs(5));
    assert_eq!(resolved.max_retries, 1);
    assert!(!resolved.cache_enabled);
    assert_eq!(resolved.base_delay, defaults.base_delay);
  }
}
