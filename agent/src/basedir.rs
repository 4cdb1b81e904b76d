//! On-disk layout of the agent
//!
//! ```text
//! <basedir>/config/<component>[-<uuid>].conf   component configs (JSON)
//! <basedir>/instance/<uuid>.json               instance records
//! <basedir>/data/                              spool
//! <basedir>/data/trash/                        rejected spool items
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ConfigError, ConfigResult};

pub const CONFIG_DIR: &str = "config";
pub const DATA_DIR: &str = "data";
pub const TRASH_DIR: &str = "trash";
pub const INSTANCE_DIR: &str = "instance";

#[derive(Debug, Clone)]
pub struct Basedir {
    root: PathBuf,
}

impl Basedir {
    /// Use `root` as the base directory, creating the standard subdirectories.
    pub fn init(root: impl Into<PathBuf>) -> io::Result<Self> {
        let basedir = Self { root: root.into() };
        for dir in [
            basedir.config_dir(),
            basedir.data_dir(),
            basedir.trash_dir(),
            basedir.instance_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(basedir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.data_dir().join(TRASH_DIR)
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.root.join(INSTANCE_DIR)
    }

    /// Path of the config file for `component`, optionally per instance.
    pub fn config_file(&self, component: &str, uuid: Option<&str>) -> PathBuf {
        self.config_dir().join(config_file_name(component, uuid))
    }

    /// Read and decode a component config. `Ok(None)` if the file does not exist.
    pub fn read_config<T: DeserializeOwned>(
        &self,
        component: &str,
        uuid: Option<&str>,
    ) -> ConfigResult<Option<T>> {
        read_json_file(&self.config_file(component, uuid))
    }

    /// Encode and write a component config atomically.
    pub fn write_config<T: Serialize>(
        &self,
        component: &str,
        uuid: Option<&str>,
        config: &T,
    ) -> ConfigResult<()> {
        write_json_file(&self.config_file(component, uuid), config)
    }

    /// Remove a component config; a missing file is not an error.
    pub fn remove_config(&self, component: &str, uuid: Option<&str>) -> ConfigResult<()> {
        let path = self.config_file(component, uuid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::WriteFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Every per-instance config file of `component`, as `(uuid, path)`.
    pub fn instance_configs(&self, component: &str) -> io::Result<Vec<(String, PathBuf)>> {
        let prefix = format!("{}-", component);
        let mut found = Vec::new();
        for entry in fs::read_dir(self.config_dir())? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(uuid) = rest.strip_suffix(".conf") {
                if !uuid.is_empty() {
                    found.push((uuid.to_string(), path.clone()));
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

/// `<component>.conf` or `<component>-<uuid>.conf`.
pub fn config_file_name(component: &str, uuid: Option<&str>) -> String {
    match uuid {
        Some(uuid) if !uuid.is_empty() => format!("{}-{}.conf", component, uuid),
        _ => format!("{}.conf", component),
    }
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: &Path) -> ConfigResult<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::ParseError {
                reason: format!("{}: {}", path.display(), e),
            })
        }
    };
    if content.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ConfigError::Empty { path: path.display().to_string() });
    }
    let value = serde_json::from_slice(&content).map_err(|e| ConfigError::ParseError {
        reason: format!("{}: {}", path.display(), e),
    })?;
    Ok(Some(value))
}

pub(crate) fn write_json_file<T: Serialize>(path: &Path, value: &T) -> ConfigResult<()> {
    let write_failed = |e: &dyn std::fmt::Display| ConfigError::WriteFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| write_failed(&e))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| write_failed(&e))?;
    fs::rename(&tmp, path).map_err(|e| write_failed(&e))?;
    Ok(())
}
