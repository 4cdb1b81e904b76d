//! Database connector interface
//!
//! The agent never talks SQL directly; it goes through a narrow `Connector`
//! supplied by the embedding application. This module also holds the pure
//! helpers for parsing server versions and classifying distributions.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MysqlError, MysqlResult};

pub const DISTRO_PERCONA_SERVER: &str = "Percona Server";
pub const DISTRO_PERCONA_XTRADB_CLUSTER: &str = "Percona XtraDB Cluster";
pub const DISTRO_MARIADB: &str = "MariaDB";
pub const DISTRO_MYSQL: &str = "MySQL";

/// One statement to apply, optionally followed by a verification query
/// whose single value must equal `expect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MysqlQuery {
    pub set: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verify: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expect: String,
}

impl MysqlQuery {
    pub fn set(stmt: impl Into<String>) -> Self {
        Self {
            set: stmt.into(),
            ..Self::default()
        }
    }
}

/// Connection to one monitored database.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, retrying up to `tries` times.
    async fn connect(&mut self, tries: u32) -> MysqlResult<()>;

    async fn close(&mut self);

    /// `SELECT @@<name>` as a string; `None` if the variable does not exist.
    async fn global_var_string(&mut self, name: &str) -> MysqlResult<Option<String>>;

    /// `SELECT @@<name>` as a number; `None` if the variable does not exist.
    async fn global_var_number(&mut self, name: &str) -> MysqlResult<Option<f64>>;

    /// Apply each query in order, stopping at the first failure.
    async fn set(&mut self, queries: &[MysqlQuery]) -> MysqlResult<()>;

    /// Server uptime in seconds.
    async fn uptime(&mut self) -> MysqlResult<i64>;

    fn dsn(&self) -> String;
}

/// Makes connectors from DSNs.
pub trait ConnectorFactory: Send + Sync {
    fn make(&self, dsn: &str) -> Box<dyn Connector>;
}

/// Parsed `major.minor.patch` server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse strings like `5.6.24-72.2-log` or `10.1.9-MariaDB`.
    pub fn parse(version: &str) -> MysqlResult<Self> {
        let invalid = || MysqlError::InvalidVersion { version: version.to_string() };
        let core = version
            .trim()
            .split(|c: char| c == '-' || c == '+' || c.is_whitespace())
            .next()
            .ok_or_else(invalid)?;

        let mut parts = core.split('.');
        let mut next = |required: bool| -> MysqlResult<u32> {
            match parts.next() {
                Some(p) => p.parse::<u32>().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        Ok(Self { major, minor, patch })
    }

    /// `(major, minor)` release line.
    pub fn series(&self) -> (u32, u32) {
        (self.major, self.minor)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Classify the server from `@@version` and `@@version_comment`.
pub fn detect_distro(version: &str, version_comment: &str) -> &'static str {
    let comment = version_comment.to_lowercase();
    if comment.contains("xtradb cluster") {
        DISTRO_PERCONA_XTRADB_CLUSTER
    } else if comment.contains("percona server") {
        DISTRO_PERCONA_SERVER
    } else if version.to_lowercase().contains("mariadb") || comment.contains("mariadb") {
        DISTRO_MARIADB
    } else {
        DISTRO_MYSQL
    }
}

/// Percona Server and Percona XtraDB Cluster share the extended slow log.
pub fn is_percona_family(distro: &str) -> bool {
    distro == DISTRO_PERCONA_SERVER || distro == DISTRO_PERCONA_XTRADB_CLUSTER
}

/// Connect and read `(distro, version)` from the server.
pub async fn server_info(conn: &mut dyn Connector) -> MysqlResult<(String, String)> {
    let version = conn.global_var_string("version").await?.unwrap_or_default();
    let comment = conn.global_var_string("version_comment").await?.unwrap_or_default();
    Version::parse(&version)?;
    Ok((detect_distro(&version, &comment).to_string(), version))
}
