//! Configuration for the shardql CLI
//!
//! Loads configuration from:
//! 1. config.yaml - engine defaults and logging settings
//! 2. .env file - local overrides
//!
//! Environment variables always override config.yaml values. A missing
//! config file means defaults.

use serde::{Deserialize, Serialize};
use shardql_exec::EngineConfig;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stderr, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
            output: "stderr".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&contents)?
        } else {
            Config::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(mb) = env_parse("SHARDQL_MAX_MEMORY_MB")? {
            self.engine.max_memory_mb = mb;
        }
        if let Some(fan_out) = env_parse("SHARDQL_MAX_FAN_OUT")? {
            self.engine.max_fan_out = fan_out;
        }
        if let Some(ms) = env_parse("SHARDQL_TIMEOUT_MS")? {
            self.engine.default_timeout_ms = Some(ms);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }

    /// Set logging environment variables for the logging module
    pub fn apply_logging_env(&self) {
        std::env::set_var("RUST_LOG", &self.logging.level);
        std::env::set_var("LOG_FORMAT", &self.logging.format);
        std::env::set_var("LOG_OUTPUT", &self.logging.output);
        std::env::set_var("LOG_DIR", &self.logging.directory);
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_memory_mb, 1024);
        assert_eq!(config.engine.max_fan_out, 4);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.output, "stderr");
    }

    #[test]
    fn test_load_with_env_overrides() {
        let missing = Config::load("/nonexistent/shardql.yaml").unwrap();
        assert!(missing.engine.default_limit.is_none());

        let config_yaml = r#"
engine:
  max_memory_mb: 64
  max_fan_out: 2
  default_limit: 500
logging:
  level: "info"
"#;
        let temp_file = std::env::temp_dir().join("shardql_test_config.yaml");
        std::fs::write(&temp_file, config_yaml).unwrap();

        std::env::set_var("SHARDQL_MAX_FAN_OUT", "8");
        let config = Config::load(&temp_file).unwrap();
        assert_eq!(config.engine.max_memory_mb, 64);
        assert_eq!(config.engine.max_fan_out, 8); // Overridden
        assert_eq!(config.engine.default_limit, Some(500));
        std::env::remove_var("SHARDQL_MAX_FAN_OUT");

        std::env::set_var("SHARDQL_TIMEOUT_MS", "soon");
        let err = Config::load(&temp_file).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvVar { .. }));
        std::env::remove_var("SHARDQL_TIMEOUT_MS");

        std::fs::remove_file(temp_file).ok();
    }
}
