//! Configuration management for the agent
//!
//! The agent configuration is built once at startup from a TOML file,
//! environment overrides and defaults, validated, and then passed by
//! reference into every component. Nothing in the library reads process
//! globals after that.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Main configuration structure for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base directory holding config/, data/ and instance/
    pub basedir: PathBuf,

    /// Hostname stamped on spooled envelopes
    pub hostname: String,

    /// Remote collector configuration
    pub collector: CollectorConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Remote collector connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Collector address, `host:port`
    pub address: String,

    /// Connect timeout in seconds
    pub connect_timeout: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level directive (`info`, `debug`, `qan_agent=trace`, ...)
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,

    /// Include the event target in human readable output
    pub with_target: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            basedir: PathBuf::from("/var/lib/qan-agent"),
            hostname: default_hostname(),
            collector: CollectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9001".to_string(),
            connect_timeout: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: false,
        }
    }
}

fn default_hostname() -> String {
    sysinfo::System::host_name()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound { path: path.to_string_lossy().to_string() })?;

        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env(mut self) -> Self {
        if let Ok(basedir) = std::env::var("QAN_AGENT_BASEDIR") {
            self.basedir = PathBuf::from(basedir);
        }
        if let Ok(address) = std::env::var("QAN_AGENT_COLLECTOR") {
            self.collector.address = address;
        }
        if let Ok(level) = std::env::var("QAN_AGENT_LOG_LEVEL") {
            self.logging.level = level;
        }
        self
    }

    /// Load configuration with fallback order: file -> env -> defaults
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = AgentConfig::default();

        if let Some(path) = config_path {
            if path.as_ref().exists() {
                config = AgentConfig::from_file(path)?;
            }
        }

        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.basedir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "basedir".to_string(),
                value: String::new(),
            });
        }

        if self.hostname.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "hostname".to_string(),
                value: String::new(),
            });
        }

        if !self.collector.address.contains(':') {
            return Err(ConfigError::InvalidValue {
                field: "collector.address".to_string(),
                value: self.collector.address.clone(),
            });
        }

        if self.collector.connect_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "collector.connect_timeout".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("/etc/qan-agent/agent.toml")
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFailed {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        fs::write(path, content).map_err(|e| ConfigError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.hostname.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig::default();

        config.collector.address = "no-port".to_string();
        assert!(config.validate().is_err());

        config.collector.address = "collector:9001".to_string();
        config.collector.connect_timeout = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");

        let mut config = AgentConfig::default();
        config.basedir = dir.path().to_path_buf();
        config.collector.address = "collector.example:9001".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.basedir, config.basedir);
        assert_eq!(loaded.collector.address, "collector.example:9001");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(&path, "basedir = \"/tmp/qan\"\n[logging]\nlevel = \"debug\"\n").unwrap();

        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.basedir, PathBuf::from("/tmp/qan"));
        assert_eq!(loaded.logging.level, "debug");
        assert_eq!(loaded.collector.connect_timeout, 10);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AgentConfig::load_with_fallback(Some("/nonexistent/agent.toml")).unwrap();
        assert!(config.validate().is_ok());
    }
}
