//! Application-wide configuration
//!
//! Loaded once at startup from environment variables. Component-specific
//! settings (database credentials, queue URL, state table) are read by the
//! components themselves at construction; this covers only the knobs that
//! shape the pipeline.

use std::time::Duration;

use crate::error::{CdcError, Result};

/// Pipeline configuration from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Logger verbosity (`LOG_LEVEL`, default `info`)
    pub log_level: String,
    /// Flush policy size threshold (`BATCH_SIZE`, default 10)
    pub batch_size: usize,
    /// Flush policy time threshold (`FLUSH_INTERVAL` seconds, default 5.0)
    pub flush_interval: Duration,
    /// Sink implementation selector (`STREAM_TYPE`, default `sqs`)
    pub stream_type: String,
    /// Source implementation selector (`DS_TYPE`, default `mysql`)
    pub datasource_type: String,
    /// Checkpoint implementation selector (`STATE_MANAGER_TYPE`, default `dynamodb`)
    pub state_manager_type: String,
    /// Dot-paths to redact from every message (`FILTER_REDACT_PATHS`, comma-separated)
    pub redact_paths: Vec<String>,
}

impl AppConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an injectable lookup (used by tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let batch_size = match lookup("BATCH_SIZE") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                CdcError::Configuration(format!("BATCH_SIZE must be a positive integer, got '{}'", raw))
            })?,
            None => 10,
        };
        if batch_size == 0 {
            return Err(CdcError::Configuration(
                "BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        let flush_interval = match lookup("FLUSH_INTERVAL") {
            Some(raw) => {
                let secs = raw.parse::<f64>().map_err(|_| {
                    CdcError::Configuration(format!("FLUSH_INTERVAL must be a number of seconds, got '{}'", raw))
                })?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(CdcError::Configuration(
                        "FLUSH_INTERVAL must be greater than zero".to_string(),
                    ));
                }
                Duration::from_secs_f64(secs)
            }
            None => Duration::from_secs_f64(5.0),
        };

        let stream_type = lookup("STREAM_TYPE")
            .unwrap_or_else(|| "sqs".to_string())
            .to_ascii_lowercase();
        let datasource_type = lookup("DS_TYPE")
            .unwrap_or_else(|| "mysql".to_string())
            .to_ascii_lowercase();
        let state_manager_type = lookup("STATE_MANAGER_TYPE")
            .unwrap_or_else(|| "dynamodb".to_string())
            .to_ascii_lowercase();

        let redact_paths = lookup("FILTER_REDACT_PATHS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let config = AppConfig {
            log_level,
            batch_size,
            flush_interval,
            stream_type,
            datasource_type,
            state_manager_type,
            redact_paths,
        };

        log::info!(
            "Config: log_level={} batch_size={} flush_interval={:?} stream={} datasource={} state={}",
            config.log_level,
            config.batch_size,
            config.flush_interval,
            config.stream_type,
            config.datasource_type,
            config.state_manager_type,
        );

        Ok(config)
    }
}

/// Read a required environment variable, failing with a configuration error
/// naming the variable.
pub fn require_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CdcError::Configuration(format!("{} is required", name)))
}

/// Read an optional environment variable with a default.
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.flush_interval, Duration::from_secs_f64(5.0));
        assert_eq!(cfg.stream_type, "sqs");
        assert_eq!(cfg.datasource_type, "mysql");
        assert_eq!(cfg.state_manager_type, "dynamodb");
        assert!(cfg.redact_paths.is_empty());
    }

    #[test]
    fn test_explicit_values() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("LOG_LEVEL", "debug"),
            ("BATCH_SIZE", "3"),
            ("FLUSH_INTERVAL", "0.5"),
            ("STREAM_TYPE", "SQS"),
            ("DS_TYPE", "MySQL"),
            ("STATE_MANAGER_TYPE", "file"),
        ]))
        .unwrap();
        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.flush_interval, Duration::from_secs_f64(0.5));
        // Selectors are normalized to lowercase
        assert_eq!(cfg.stream_type, "sqs");
        assert_eq!(cfg.datasource_type, "mysql");
        assert_eq!(cfg.state_manager_type, "file");
    }

    #[test]
    fn test_invalid_batch_size_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("BATCH_SIZE", "zero")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("BATCH_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_invalid_flush_interval_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("FLUSH_INTERVAL", "-1")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("FLUSH_INTERVAL", "soon")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("FLUSH_INTERVAL", "0")])).is_err());
    }

    #[test]
    fn test_redact_paths_parsed() {
        let cfg = AppConfig::from_lookup(lookup(&[(
            "FILTER_REDACT_PATHS",
            "spec.row.password, spec.row.ssn,,",
        )]))
        .unwrap();
        assert_eq!(cfg.redact_paths, vec!["spec.row.password", "spec.row.ssn"]);
    }
}
