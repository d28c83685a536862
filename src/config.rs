use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the netmond daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Data directory holding the store file, config and logs.
    /// Default: "~/.netmond".
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Sampling daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Aggregation and retention configuration.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sampling daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between sampler ticks. Range 1-3600. Default: 5.
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_seconds: u64,

    /// Timeout for one process enumeration. Default: 5s.
    #[serde(default = "default_sampler_timeout", with = "humantime_serde")]
    pub sampler_timeout: Duration,
}

/// HTTP server configuration. The server only ever binds loopback.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen port. Range 1024-65535. Default: 7500.
    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Aggregation and retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Days to keep raw samples. Default: 7.
    #[serde(default = "default_raw_ttl_days")]
    pub raw_ttl_days: u32,

    /// Days to keep hourly aggregates. Default: 90.
    #[serde(default = "default_hour_ttl_days")]
    pub hour_ttl_days: u32,

    /// How often the aggregate-then-prune scheduler runs. Default: 5m.
    #[serde(default = "default_scheduler_interval", with = "humantime_serde")]
    pub scheduler_interval: Duration,

    /// How long shutdown waits for tasks before closing the store. Default: 5s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub level: String,
}

// --- Default value functions ---

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".netmond"),
        None => PathBuf::from(".netmond"),
    }
}

fn default_sampling_interval() -> u64 {
    5
}

fn default_sampler_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_server_port() -> u16 {
    7500
}

fn default_raw_ttl_days() -> u32 {
    7
}

fn default_hour_ttl_days() -> u32 {
    90
}

fn default_scheduler_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_log_level() -> String {
    "info".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            daemon: DaemonConfig::default(),
            server: ServerConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sampling_interval_seconds: default_sampling_interval(),
            sampler_timeout: default_sampler_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_ttl_days: default_raw_ttl_days(),
            hour_ttl_days: default_hour_ttl_days(),
            scheduler_interval: default_scheduler_interval(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Live view of the effective configuration, shared between the query
/// engine, the scheduler and the reload endpoint. TTL changes land on
/// the next retention tick; the sampler interval and port are fixed at
/// startup.
pub struct RuntimeSettings {
    inner: parking_lot::RwLock<Config>,
}

impl RuntimeSettings {
    pub fn new(cfg: Config) -> Self {
        Self {
            inner: parking_lot::RwLock::new(cfg),
        }
    }

    /// Current effective configuration.
    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Swaps in a freshly merged configuration.
    pub fn replace(&self, cfg: Config) {
        *self.inner.write() = cfg;
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Config::default();
            cfg.validate()?;
            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate ranges for every enumerated key.
    pub fn validate(&self) -> Result<()> {
        let interval = self.daemon.sampling_interval_seconds;
        if !(1..=3600).contains(&interval) {
            bail!("daemon.sampling_interval_seconds must be in 1-3600, got {interval}");
        }

        if self.server.port < 1024 {
            bail!("server.port must be in 1024-65535, got {}", self.server.port);
        }

        if self.retention.raw_ttl_days < 1 {
            bail!("retention.raw_ttl_days must be >= 1");
        }

        if self.retention.hour_ttl_days < 1 {
            bail!("retention.hour_ttl_days must be >= 1");
        }

        if self.retention.scheduler_interval.is_zero() {
            bail!("retention.scheduler_interval must be positive");
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("logging.level must be one of trace/debug/info/warn/error, got {other}"),
        }

        Ok(())
    }

    /// Apply flat `section.key` overrides from the settings table.
    /// Database values win over file values; unknown keys and values that
    /// fail range validation are skipped with a warning.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        for (key, value) in overrides {
            let mut candidate = self.clone();
            let applied = match key.as_str() {
                "daemon.sampling_interval_seconds" => value
                    .parse()
                    .map(|v| candidate.daemon.sampling_interval_seconds = v)
                    .is_ok(),
                "server.port" => value.parse().map(|v| candidate.server.port = v).is_ok(),
                "retention.raw_ttl_days" => value
                    .parse()
                    .map(|v| candidate.retention.raw_ttl_days = v)
                    .is_ok(),
                "retention.hour_ttl_days" => value
                    .parse()
                    .map(|v| candidate.retention.hour_ttl_days = v)
                    .is_ok(),
                "logging.level" => {
                    candidate.logging.level = value.clone();
                    true
                }
                _ => {
                    tracing::warn!(key, "unknown config override, skipping");
                    continue;
                }
            };

            if !applied {
                tracing::warn!(key, value, "unparsable config override, skipping");
                continue;
            }

            match candidate.validate() {
                Ok(()) => {
                    tracing::debug!(key, value, "applied config override");
                    *self = candidate;
                }
                Err(e) => {
                    tracing::warn!(key, value, error = %e, "config override out of range, skipping");
                }
            }
        }
    }

    /// Path to the store file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("netmond.db")
    }

    /// Path to the YAML config inside a data directory.
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join("config.yaml")
    }

    /// Path to the logs subdirectory.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Effective values as flat `section.key` pairs, for the config API.
    pub fn flat_values(&self) -> Vec<(String, String)> {
        vec![
            (
                "daemon.sampling_interval_seconds".into(),
                self.daemon.sampling_interval_seconds.to_string(),
            ),
            ("server.port".into(), self.server.port.to_string()),
            (
                "retention.raw_ttl_days".into(),
                self.retention.raw_ttl_days.to_string(),
            ),
            (
                "retention.hour_ttl_days".into(),
                self.retention.hour_ttl_days.to_string(),
            ),
            ("logging.level".into(), self.logging.level.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.daemon.sampling_interval_seconds, 5);
        assert_eq!(cfg.server.port, 7500);
        assert_eq!(cfg.retention.raw_ttl_days, 7);
        assert_eq!(cfg.retention.hour_ttl_days, 90);
        assert_eq!(cfg.retention.scheduler_interval, Duration::from_secs(300));
        assert_eq!(cfg.logging.level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_sections() {
        let cfg: Config = serde_yaml::from_str(
            "daemon:\n  sampling_interval_seconds: 2\nserver:\n  port: 7600\nretention:\n  raw_ttl_days: 3\n",
        )
        .expect("parse");
        assert_eq!(cfg.daemon.sampling_interval_seconds, 2);
        assert_eq!(cfg.server.port, 7600);
        assert_eq!(cfg.retention.raw_ttl_days, 3);
        // Unset sections keep defaults.
        assert_eq!(cfg.retention.hour_ttl_days, 90);
    }

    #[test]
    fn test_validation_rejects_out_of_range_interval() {
        let mut cfg = Config::default();
        cfg.daemon.sampling_interval_seconds = 0;
        assert!(cfg.validate().is_err());

        cfg.daemon.sampling_interval_seconds = 3_601;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sampling_interval_seconds"));
    }

    #[test]
    fn test_validation_rejects_privileged_port() {
        let mut cfg = Config::default();
        cfg.server.port = 80;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("server.port"));
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_overrides_win_over_file_values() {
        let mut cfg = Config::default();
        let overrides = HashMap::from([
            ("retention.raw_ttl_days".to_string(), "14".to_string()),
            (
                "daemon.sampling_interval_seconds".to_string(),
                "1".to_string(),
            ),
        ]);
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.retention.raw_ttl_days, 14);
        assert_eq!(cfg.daemon.sampling_interval_seconds, 1);
    }

    #[test]
    fn test_invalid_override_is_skipped() {
        let mut cfg = Config::default();
        let overrides = HashMap::from([
            ("server.port".to_string(), "80".to_string()),
            ("retention.raw_ttl_days".to_string(), "soon".to_string()),
        ]);
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.server.port, 7500);
        assert_eq!(cfg.retention.raw_ttl_days, 7);
    }
}
