//! Cleaner configuration loaded from environment variables.

use std::net::SocketAddr;

use stores::validate_table_name;

use crate::error::{CleanerError, Result};

const DEFAULT_ZOMBIE_TIMEOUT_MINUTES: i64 = 10;
const DEFAULT_BATCH_LIMIT: usize = 100;
const DEFAULT_TABLES: [&str; 2] = ["minute_kline", "daily_kline"];

/// Knobs for one cleaner instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// PENDING rows older than this are treated as zombies.
    pub zombie_timeout_minutes: i64,

    /// Maximum zombies reconciled per run.
    pub batch_limit: usize,

    /// Compute resolutions and counts, mutate nothing.
    pub dry_run: bool,

    /// Append-only tables visited by the purge pass.
    pub tables: Vec<String>,
}

impl CleanerConfig {
    /// The zombie timeout as a duration.
    pub fn zombie_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.zombie_timeout_minutes)
    }

    /// Rejects settings that would make a run unsafe or pointless.
    pub fn validate(&self) -> Result<()> {
        if self.zombie_timeout_minutes < 1 {
            return Err(CleanerError::Config(format!(
                "zombie timeout must be at least 1 minute, got {}",
                self.zombie_timeout_minutes
            )));
        }
        if self.batch_limit == 0 {
            return Err(CleanerError::Config(
                "batch limit must be greater than 0".to_string(),
            ));
        }
        if i64::try_from(self.batch_limit).is_err() {
            return Err(CleanerError::Config(format!(
                "batch limit {} is too large",
                self.batch_limit
            )));
        }
        for table in &self.tables {
            validate_table_name(table)?;
        }
        Ok(())
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            zombie_timeout_minutes: DEFAULT_ZOMBIE_TIMEOUT_MINUTES,
            batch_limit: DEFAULT_BATCH_LIMIT,
            dry_run: false,
            tables: DEFAULT_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Process configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL` — relational store holding `transaction_log`
/// - `TIMESERIES_DATABASE_URL` — append-only store (default: `DATABASE_URL`)
/// - `CLEANER_ZOMBIE_TIMEOUT_MINUTES` — default `10`
/// - `CLEANER_BATCH_LIMIT` — default `100`
/// - `CLEANER_TABLES` — comma-separated, default `minute_kline,daily_kline`
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `text` or `json` (default: `text`)
/// - `METRICS_LISTEN_ADDR` — serve Prometheus metrics on this address
///   (default: unset, metrics are written to the log after each run)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub timeseries_database_url: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_addr: Option<SocketAddr>,
    pub cleaner: CleanerConfig,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = CleanerConfig::default();

        let tables: Vec<String> = lookup("CLEANER_TABLES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            database_url: lookup("DATABASE_URL"),
            timeseries_database_url: lookup("TIMESERIES_DATABASE_URL"),
            log_level: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            metrics_addr: lookup("METRICS_LISTEN_ADDR").and_then(|v| v.parse().ok()),
            cleaner: CleanerConfig {
                zombie_timeout_minutes: lookup("CLEANER_ZOMBIE_TIMEOUT_MINUTES")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.zombie_timeout_minutes),
                batch_limit: lookup("CLEANER_BATCH_LIMIT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.batch_limit),
                dry_run: false,
                tables: if tables.is_empty() {
                    defaults.tables
                } else {
                    tables
                },
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert!(config.database_url.is_none());
        assert!(config.metrics_addr.is_none());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.cleaner.zombie_timeout_minutes, 10);
        assert_eq!(config.cleaner.batch_limit, 100);
        assert!(!config.cleaner.dry_run);
        assert_eq!(config.cleaner.tables, vec!["minute_kline", "daily_kline"]);
    }

    #[test]
    fn test_values_from_environment() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://pg/meta"),
            ("CLEANER_ZOMBIE_TIMEOUT_MINUTES", "30"),
            ("CLEANER_BATCH_LIMIT", "25"),
            ("CLEANER_TABLES", " tick_data, minute_kline ,,"),
            ("LOG_FORMAT", "json"),
            ("METRICS_LISTEN_ADDR", "0.0.0.0:9464"),
        ]));

        assert_eq!(config.database_url.as_deref(), Some("postgres://pg/meta"));
        assert_eq!(config.cleaner.zombie_timeout_minutes, 30);
        assert_eq!(config.cleaner.batch_limit, 25);
        assert_eq!(config.cleaner.tables, vec!["tick_data", "minute_kline"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.metrics_addr, Some("0.0.0.0:9464".parse().unwrap()));
    }

    #[test]
    fn test_unparsable_values_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("CLEANER_ZOMBIE_TIMEOUT_MINUTES", "ten"),
            ("CLEANER_BATCH_LIMIT", "-1"),
            ("CLEANER_TABLES", " , "),
        ]));

        assert_eq!(config.cleaner, CleanerConfig::default());
    }

    #[test]
    fn test_validate_rejects_unsafe_settings() {
        let zero_timeout = CleanerConfig {
            zombie_timeout_minutes: 0,
            ..CleanerConfig::default()
        };
        let zero_batch = CleanerConfig {
            batch_limit: 0,
            ..CleanerConfig::default()
        };
        let bad_table = CleanerConfig {
            tables: vec!["kline;--".to_string()],
            ..CleanerConfig::default()
        };

        assert!(matches!(zero_timeout.validate(), Err(CleanerError::Config(_))));
        assert!(matches!(zero_batch.validate(), Err(CleanerError::Config(_))));
        assert!(matches!(bad_table.validate(), Err(CleanerError::Store(_))));
        assert!(CleanerConfig::default().validate().is_ok());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_validate_rejects_unrepresentable_batch_limit() {
        let huge = CleanerConfig {
            batch_limit: usize::MAX,
            ..CleanerConfig::default()
        };
        assert!(matches!(huge.validate(), Err(CleanerError::Config(_))));
    }

    #[test]
    fn test_zombie_timeout_duration() {
        assert_eq!(
            CleanerConfig::default().zombie_timeout(),
            chrono::Duration::minutes(10)
        );
    }
}
