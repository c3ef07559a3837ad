//! Configuration management for the MapReduce engine
//!
//! Settings come from defaults, an optional TOML file and `GMR_*` environment
//! variables, in that order, and are validated before use.

use crate::core::error::{Error, Result};
use crate::execution::scheduler::SchedulerConfig;
use crate::structures::concurrent_map::DEFAULT_BUCKET_COUNT;
use crate::structures::exclusion_gate::GateKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "gated-mapreduce.toml";

/// Upper bound on configured workers
pub const MAX_WORKERS: usize = 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pipeline sizing
    pub pipeline: PipelineConfig,

    /// Scheduler and exclusion gate settings
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Pipeline sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of workers per phase (0 = auto-detect)
    pub workers: usize,

    /// Bucket count of the shuffle map
    pub bucket_count: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, compact, full)
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Record Prometheus metrics
    pub enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0, // Auto-detect
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from the default file (if present) and environment variables
    pub fn load() -> Result<Self> {
        let mut config = if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply `GMR_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("GMR_WORKERS") {
            self.pipeline.workers = workers.parse()
                .map_err(|e| Error::config(format!("Invalid worker count: {}", e)))?;
        }

        if let Some(buckets) = lookup("GMR_BUCKETS") {
            self.pipeline.bucket_count = buckets.parse()
                .map_err(|e| Error::config(format!("Invalid bucket count: {}", e)))?;
        }

        if let Some(gate) = lookup("GMR_GATE") {
            self.scheduler.gate = gate.parse()?;
        }

        if let Some(flag) = lookup("GMR_ENFORCE_HARDWARE_LIMIT") {
            self.scheduler.enforce_hardware_limit = parse_flag(&flag)
                .ok_or_else(|| Error::config(format!("Invalid boolean flag: {}", flag)))?;
        }

        if let Some(interval) = lookup("GMR_QUEUE_POLL_INTERVAL") {
            self.scheduler.queue_poll_interval = duration_str::parse_duration(&interval)
                .map_err(|e| Error::config(format!("Invalid poll interval: {}", e)))?;
        }

        if let Some(level) = lookup("GMR_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("GMR_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(flag) = lookup("GMR_METRICS") {
            self.metrics.enabled = parse_flag(&flag)
                .ok_or_else(|| Error::config(format!("Invalid boolean flag: {}", flag)))?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.bucket_count == 0 {
            return Err(Error::config("Bucket count must be at least 1"));
        }

        if self.pipeline.workers > MAX_WORKERS {
            return Err(Error::config(format!("Too many workers (maximum {})", MAX_WORKERS)));
        }

        if self.scheduler.gate == GateKind::Queue && self.scheduler.queue_poll_interval.is_zero() {
            return Err(Error::config("Queue gate poll interval must be non-zero"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => return Err(Error::config("Invalid log level")),
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "full" => {},
            _ => return Err(Error::config("Invalid log format")),
        }

        Ok(())
    }

    /// Get the effective number of workers
    pub fn optimal_workers(&self) -> usize {
        if self.pipeline.workers == 0 {
            // Auto-detect: use number of CPU cores
            num_cpus::get().max(1)
        } else {
            self.pipeline.workers
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// (De)serialisation of `Duration` as human strings like `50us`, `10ms` or `2s`
pub mod duration_str {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    /// Serialize a duration using the smallest exact unit
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let nanos = value.as_nanos();
        let text = if nanos % 1_000_000_000 == 0 {
            format!("{}s", value.as_secs())
        } else if nanos % 1_000_000 == 0 {
            format!("{}ms", value.as_millis())
        } else if nanos % 1_000 == 0 {
            format!("{}us", value.as_micros())
        } else {
            format!("{}ns", nanos)
        };
        serializer.serialize_str(&text)
    }

    /// Deserialize a duration from a string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string like '50us', '10ms' or '2s'")
            }

            fn visit_str<E>(self, value: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }

    /// Simple duration parser for common formats
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "s"),
        };
        let n: u64 = digits.parse().map_err(|_| format!("Invalid duration format: {}", s))?;
        match unit {
            "ns" => Ok(Duration::from_nanos(n)),
            "us" => Ok(Duration::from_micros(n)),
            "ms" => Ok(Duration::from_millis(n)),
            "s" => Ok(Duration::from_secs(n)),
            "m" => n
                .checked_mul(60)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("Duration out of range: {}", s)),
            _ => Err(format!("Invalid duration unit: {}", unit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.bucket_count, DEFAULT_BUCKET_COUNT);
        assert_eq!(config.scheduler.gate, GateKind::Filter);
        assert!(config.optimal_workers() >= 1);
    }

    #[test]
    fn loads_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pipeline]\nworkers = 4\n\n[scheduler]\ngate = \"queue\"\nqueue_poll_interval = \"20us\"\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.bucket_count, DEFAULT_BUCKET_COUNT);
        assert_eq!(config.scheduler.gate, GateKind::Queue);
        assert_eq!(config.scheduler.queue_poll_interval, Duration::from_micros(20));
        assert_eq!(config.optimal_workers(), 4);
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let vars: HashMap<&str, &str> = [
            ("GMR_WORKERS", "8"),
            ("GMR_GATE", "filter"),
            ("GMR_BUCKETS", "0"),
            ("GMR_ENFORCE_HARDWARE_LIMIT", "yes"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.pipeline.workers, 8);
        assert!(config.scheduler.enforce_hardware_limit);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn bad_env_values_are_config_errors() {
        let mut config = Config::default();
        let err = config
            .apply_overrides_from(|k| (k == "GMR_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = config
            .apply_overrides_from(|k| (k == "GMR_GATE").then(|| "bakery".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = config
            .apply_overrides_from(|k| (k == "GMR_QUEUE_POLL_INTERVAL").then(|| format!("{}m", u64::MAX)))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duration_strings_round_trip() {
        use duration_str::parse_duration;
        assert_eq!(parse_duration("50us").unwrap(), Duration::from_micros(50));
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("5 parsecs").is_err());
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());

        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.scheduler.queue_poll_interval, config.scheduler.queue_poll_interval);
    }
}
