//! Error handling for the query analytics agent
//!
//! This module provides the error types for every agent component: the
//! spooler, the sender and its transport, configuration, the analyzer,
//! the instance repository, and the database connector.

use std::io;

use thiserror::Error;

/// The main error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Spooler related errors
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Sender related errors
    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),

    /// Transport related errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Query analytics errors
    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    /// Instance repository errors
    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    /// Database connector errors
    #[error("MySQL error: {0}")]
    Mysql(#[from] MysqlError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote command errors
    #[error("Unknown command {cmd} for service {service}")]
    UnknownCommand { service: String, cmd: String },

    /// Generic errors
    #[error("{0}")]
    Generic(String),

    /// A long-lived task died from a panic
    #[error("Crashed: {0}")]
    Crashed(String),
}

/// Spooler errors
#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool write timed out; report dropped")]
    Timeout,

    #[error("spooler is not running")]
    NotRunning,

    #[error("spooler is already running")]
    AlreadyRunning,

    #[error("invalid spool key: {key}")]
    InvalidKey { key: String },

    #[error("spool file not found: {key}")]
    NotFound { key: String },

    #[error("unknown encoding: {encoding}")]
    UnknownEncoding { encoding: String },

    #[error("failed to encode payload: {reason}")]
    Encode { reason: String },

    #[error("failed to decode payload: {reason}")]
    Decode { reason: String },

    #[error("spool I/O failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Sender errors
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("sender is already running")]
    AlreadyRunning,

    #[error("unexpected response code {code}: {message}")]
    UnexpectedResponse { code: u16, message: String },

    #[error("send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("sender task failed: {reason}")]
    Task { reason: String },
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("{op} timed out after {secs:.1}s")]
    Timeout { op: &'static str, secs: f64 },

    #[error("connection closed by remote")]
    Closed,

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration file is empty: {path}")]
    Empty { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },

    #[error("Failed to write configuration {path}: {reason}")]
    WriteFailed { path: String, reason: String },
}

/// Query analytics errors
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("analyzer for {uuid} is already running")]
    DuplicateTool { uuid: String },

    #[error("analyzer {name} is already running")]
    AlreadyRunning { name: String },

    #[error("analyzer {name} is not running")]
    NotRunning { name: String },

    #[error("worker failed: {reason}")]
    Worker { reason: String },

    #[error("interval iterator failed: {reason}")]
    Interval { reason: String },
}

/// Instance repository errors
#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("instance {id} already exists")]
    Duplicate { id: String },

    #[error("instance {id} not found")]
    NotFound { id: String },

    #[error("instance API has no entry link for {name}")]
    NoLink { name: String },

    #[error("instance API request failed: {reason}")]
    Api { reason: String },

    #[error("invalid instance record: {reason}")]
    Invalid { reason: String },
}

/// Database connector errors
#[derive(Error, Debug)]
pub enum MysqlError {
    #[error("cannot connect to {dsn}: {reason}")]
    Connect { dsn: String, reason: String },

    #[error("query failed: {query}: {reason}")]
    Query { query: String, reason: String },

    #[error("verification failed for {query}: expected {expected}, got {actual}")]
    Verify {
        query: String,
        expected: String,
        actual: String,
    },

    #[error("invalid version string: {version}")]
    InvalidVersion { version: String },

    #[error("{distro} {version} is not supported for {source_name}")]
    UnsupportedVersion {
        distro: String,
        version: String,
        source_name: String,
    },

    #[error("unknown collection source: {source_name}")]
    UnknownSource { source_name: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AgentError>;

/// A specialized result type for spool operations
pub type SpoolResult<T> = std::result::Result<T, SpoolError>;

/// A specialized result type for sender operations
pub type SenderResult<T> = std::result::Result<T, SenderError>;

/// A specialized result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for analyzer operations
pub type AnalyzerResult<T> = std::result::Result<T, AnalyzerError>;

/// A specialized result type for instance operations
pub type InstanceResult<T> = std::result::Result<T, InstanceError>;

/// A specialized result type for database operations
pub type MysqlResult<T> = std::result::Result<T, MysqlError>;

impl AgentError {
    /// Check if this error is transient and worth retrying later
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Spool(SpoolError::Timeout) => true,
            AgentError::Spool(SpoolError::InvalidKey { .. }) => false,
            AgentError::Transport(_) => true,
            AgentError::Sender(SenderError::Transport(_)) => true,
            AgentError::Sender(SenderError::UnexpectedResponse { .. }) => false,
            AgentError::Mysql(MysqlError::Connect { .. }) => true,
            AgentError::Mysql(MysqlError::Query { .. }) => true,
            AgentError::Mysql(_) => false,
            AgentError::Config(_) => false,
            AgentError::Analyzer(AnalyzerError::DuplicateTool { .. }) => false,
            AgentError::Instance(InstanceError::Duplicate { .. }) => false,
            AgentError::Instance(InstanceError::NoLink { .. }) => true,
            AgentError::Crashed(_) => false,
            AgentError::Io(io_error) => matches!(
                io_error.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => true,
        }
    }

    /// Check if this error means a long-lived component stopped working
    pub fn is_critical(&self) -> bool {
        matches!(self, AgentError::Crashed(_))
    }

    /// Level to log this error at: transient errors are warnings.
    pub fn log_level(&self) -> tracing::Level {
        if !self.is_critical() && self.is_recoverable() {
            tracing::Level::WARN
        } else {
            tracing::Level::ERROR
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Spool(_) => "spool",
            AgentError::Sender(_) => "sender",
            AgentError::Transport(_) => "transport",
            AgentError::Config(_) => "config",
            AgentError::Analyzer(_) => "analyzer",
            AgentError::Instance(_) => "instance",
            AgentError::Mysql(_) => "mysql",
            AgentError::Io(_) => "io",
            AgentError::Serialization(_) => "serialization",
            AgentError::UnknownCommand { .. } => "command",
            AgentError::Generic(_) => "generic",
            AgentError::Crashed(_) => "crashed",
        }
    }
}

impl From<String> for AgentError {
    fn from(msg: String) -> Self {
        AgentError::Generic(msg)
    }
}

impl From<&str> for AgentError {
    fn from(msg: &str) -> Self {
        AgentError::Generic(msg.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::ParseError { reason: e.to_string() }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::ParseError { reason: e.to_string() }
    }
}
