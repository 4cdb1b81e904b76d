//! Instance repository
//!
//! Instance records are cached in memory, persisted one JSON file per uuid
//! and fetched from the remote API on a cache miss.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::basedir::{read_json_file, write_json_file};
use crate::error::{InstanceError, InstanceResult};
use crate::proto::MysqlInstance;

pub const INSTANCES_LINK: &str = "instances";
pub const LINK_RETRIES: u32 = 3;
pub const LINK_BACKOFF: Duration = Duration::from_secs(1);

/// Remote source of instance records.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Base URL of `resource`, or `None` until the API has announced it.
    fn entry_link(&self, resource: &str) -> Option<String>;

    /// `Ok(None)` if the API has no such instance.
    async fn get_instance(&self, url: &str) -> InstanceResult<Option<MysqlInstance>>;
}

pub struct Repo {
    dir: PathBuf,
    api: Arc<dyn InstanceApi>,
    instances: Mutex<HashMap<String, MysqlInstance>>,
    link_backoff: Duration,
}

impl Repo {
    pub fn new(dir: impl Into<PathBuf>, api: Arc<dyn InstanceApi>) -> Self {
        Self {
            dir: dir.into(),
            api,
            instances: Mutex::new(HashMap::new()),
            link_backoff: LINK_BACKOFF,
        }
    }

    pub fn with_link_backoff(mut self, backoff: Duration) -> Self {
        self.link_backoff = backoff;
        self
    }

    /// Load every `<uuid>.json` in the instance directory. Unreadable
    /// records are logged and skipped.
    pub fn init(&self) -> InstanceResult<usize> {
        fs::create_dir_all(&self.dir).map_err(|e| invalid(&self.dir, e))?;
        let mut loaded = HashMap::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| invalid(&self.dir, e))? {
            let path = entry.map_err(|e| invalid(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json_file::<MysqlInstance>(&path) {
                Ok(Some(instance)) if !instance.uuid.is_empty() => {
                    loaded.insert(instance.uuid.clone(), instance);
                }
                Ok(_) => warn!(file = %path.display(), "skipping instance file without uuid"),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping bad instance file"),
            }
        }
        let count = loaded.len();
        *self.instances.lock().unwrap_or_else(|e| e.into_inner()) = loaded;
        info!(count, dir = %self.dir.display(), "instance repo loaded");
        Ok(count)
    }

    /// Instance by uuid, from cache when `cache` is set, else from the API.
    pub async fn get(&self, uuid: &str, cache: bool) -> InstanceResult<MysqlInstance> {
        if cache {
            if let Some(instance) = self.cached(uuid) {
                return Ok(instance);
            }
        }
        let instance = self.fetch(uuid).await?;
        self.store(instance.clone(), true)?;
        Ok(instance)
    }

    pub fn cached(&self, uuid: &str) -> Option<MysqlInstance> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uuid)
            .cloned()
    }

    /// Add a new instance. Existing uuids are never overwritten.
    pub fn add(&self, instance: MysqlInstance, write_to_disk: bool) -> InstanceResult<()> {
        if instance.uuid.is_empty() {
            return Err(InstanceError::Invalid {
                reason: "instance has no uuid".to_string(),
            });
        }
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(&instance.uuid) {
            return Err(InstanceError::Duplicate { id: instance.uuid });
        }
        self.store_locked(&mut instances, instance, write_to_disk)
    }

    /// Replace an existing instance record.
    pub fn update(&self, instance: MysqlInstance) -> InstanceResult<()> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if !instances.contains_key(&instance.uuid) {
            return Err(InstanceError::NotFound { id: instance.uuid });
        }
        debug!(instance = %instance.uuid, distro = %instance.distro, version = %instance.version, "updating instance");
        self.store_locked(&mut instances, instance, true)
    }

    /// Forget an instance and delete its file; a missing file is fine.
    pub fn remove(&self, uuid: &str) -> InstanceResult<()> {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uuid);
        let path = self.file(uuid);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(invalid(&path, e)),
        }
        info!(instance = %uuid, "instance removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<MysqlInstance> {
        let mut all: Vec<MysqlInstance> = self
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        all
    }

    fn file(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}.json", uuid))
    }

    fn store(&self, instance: MysqlInstance, write_to_disk: bool) -> InstanceResult<()> {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        self.store_locked(&mut instances, instance, write_to_disk)
    }

    /// Write and cache `instance` under an already held map lock.
    fn store_locked(
        &self,
        instances: &mut HashMap<String, MysqlInstance>,
        instance: MysqlInstance,
        write_to_disk: bool,
    ) -> InstanceResult<()> {
        if write_to_disk {
            let path = self.file(&instance.uuid);
            write_json_file(&path, &instance).map_err(|e| InstanceError::Invalid {
                reason: e.to_string(),
            })?;
        }
        instances.insert(instance.uuid.clone(), instance);
        Ok(())
    }

    async fn fetch(&self, uuid: &str) -> InstanceResult<MysqlInstance> {
        let mut link = self.api.entry_link(INSTANCES_LINK);
        let mut attempt = 0;
        while link.is_none() && attempt < LINK_RETRIES {
            attempt += 1;
            debug!(attempt, "instance API link not ready, waiting");
            tokio::time::sleep(self.link_backoff).await;
            link = self.api.entry_link(INSTANCES_LINK);
        }
        let Some(link) = link else {
            return Err(InstanceError::NoLink {
                name: INSTANCES_LINK.to_string(),
            });
        };

        let url = format!("{}/{}", link.trim_end_matches('/'), uuid);
        match self.api.get_instance(&url).await? {
            Some(instance) if instance.uuid == uuid => Ok(instance),
            Some(instance) => Err(InstanceError::Invalid {
                reason: format!("API returned instance {} for {}", instance.uuid, uuid),
            }),
            None => Err(InstanceError::NotFound { id: uuid.to_string() }),
        }
    }
}

fn invalid(path: &Path, e: io::Error) -> InstanceError {
    InstanceError::Invalid {
        reason: format!("{}: {}", path.display(), e),
    }
}
