//! Wire and on-disk types shared by agent components
//!
//! The remote command envelope and its reply, the collector response, the
//! spool envelope wrapped around every buffered report, spool limits and the
//! monitored database instance record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol version stamped on every spooled envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Remote command envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Cmd {
    /// Command name, e.g. `GetConfig`, `StartTool`.
    pub cmd: String,

    /// Target service, e.g. `data`, `qan`, `instance`.
    pub service: String,

    /// Opaque JSON payload.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub data: Vec<u8>,

    /// Caller supplied id echoed back in the reply.
    #[serde(default)]
    pub id: String,
}

impl Cmd {
    pub fn new(service: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    /// Attach a JSON payload.
    pub fn with_json<T: Serialize>(mut self, data: &T) -> serde_json::Result<Self> {
        self.data = serde_json::to_vec(data)?;
        Ok(self)
    }

    /// Build a reply carrying `data` (serialized as JSON) or `err`.
    pub fn reply<T: Serialize>(&self, data: Option<&T>, err: Option<String>) -> Reply {
        let mut reply = Reply {
            id: self.id.clone(),
            cmd: self.cmd.clone(),
            data: Vec::new(),
            error: String::new(),
        };
        if let Some(err) = err {
            reply.error = err;
            return reply;
        }
        if let Some(data) = data {
            match serde_json::to_vec(data) {
                Ok(bytes) => reply.data = bytes,
                Err(e) => reply.error = format!("cannot encode reply: {}", e),
            }
        }
        reply
    }

    /// Reply with an error only.
    pub fn reply_err(&self, err: impl std::fmt::Display) -> Reply {
        let mut msg = err.to_string();
        if msg.is_empty() {
            msg = format!("{} failed", self.cmd);
        }
        self.reply::<()>(None, Some(msg))
    }

    /// Reply with neither data nor error.
    pub fn reply_ok(&self) -> Reply {
        self.reply::<()>(None, None)
    }
}

/// Reply to a remote command. Exactly one of `data`/`error` is meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    #[serde(default)]
    pub id: String,

    pub cmd: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub data: Vec<u8>,

    #[serde(default)]
    pub error: String,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }

    /// Decode the reply payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }
}

/// Configuration of one running (or stopped) service, as returned by `GetConfig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub service: String,

    /// Instance uuid for per-instance services.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,

    /// JSON encoded configuration.
    pub set: String,

    #[serde(default)]
    pub running: bool,
}

/// Collector acknowledgement for one sent item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub code: u16,

    #[serde(default)]
    pub error: String,
}

/// Envelope wrapped around every spooled payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Data {
    pub protocol_version: String,
    pub created: DateTime<Utc>,
    pub hostname: String,
    pub service: String,
    pub content_type: String,
    #[serde(default)]
    pub content_encoding: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Spool eviction limits.
///
/// Zero fields mean "no limit" during periodic purge. The same struct with
/// *all three* fields zero passed to an explicit purge means "purge
/// everything". This overload is part of the contract; callers building
/// limits from user input must not pass an all-zero struct unless they mean
/// a full purge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpoolLimits {
    /// Max age of a spooled item, seconds.
    pub max_age: u64,
    /// Max total size of spooled items, bytes.
    pub max_size: u64,
    /// Max number of spooled items.
    pub max_files: u64,
}

pub const DEFAULT_SPOOL_MAX_AGE: u64 = 86_400;
pub const DEFAULT_SPOOL_MAX_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_SPOOL_MAX_FILES: u64 = 1000;

impl Default for SpoolLimits {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_SPOOL_MAX_AGE,
            max_size: DEFAULT_SPOOL_MAX_SIZE,
            max_files: DEFAULT_SPOOL_MAX_FILES,
        }
    }
}

impl SpoolLimits {
    /// The explicit "remove everything" limits.
    pub const PURGE_ALL: SpoolLimits = SpoolLimits {
        max_age: 0,
        max_size: 0,
        max_files: 0,
    };

    pub fn is_purge_all(&self) -> bool {
        self.max_age == 0 && self.max_size == 0 && self.max_files == 0
    }
}

/// Monitored database instance record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MysqlInstance {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub parent_uuid: String,
    pub dsn: String,
    #[serde(default)]
    pub distro: String,
    #[serde(default)]
    pub version: String,
}

/// Status map reported by components.
pub type StatusMap = HashMap<String, String>;

pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
