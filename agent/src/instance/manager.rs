//! `instance` service commands.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::ServiceManager;
use crate::error::{AgentError, InstanceError, Result};
use crate::instance::repo::Repo;
use crate::mysql::{server_info, ConnectorFactory};
use crate::proto::{Cmd, MysqlInstance, Reply, ServiceConfig, StatusMap};
use crate::status::Status;

pub const SERVICE_NAME: &str = "instance";

pub struct InstanceManager {
    repo: Arc<Repo>,
    connectors: Arc<dyn ConnectorFactory>,
    status: Status,
}

impl InstanceManager {
    pub fn new(repo: Arc<Repo>, connectors: Arc<dyn ConnectorFactory>) -> Self {
        Self {
            repo,
            connectors,
            status: Status::new(&[SERVICE_NAME]),
        }
    }

    pub fn repo(&self) -> Arc<Repo> {
        Arc::clone(&self.repo)
    }

    /// Connect to the instance and fill in its distro and version.
    async fn get_info(&self, mut instance: MysqlInstance) -> Result<MysqlInstance> {
        if instance.dsn.is_empty() {
            return Err(InstanceError::Invalid {
                reason: "instance has no DSN".to_string(),
            }
            .into());
        }
        let mut conn = self.connectors.make(&instance.dsn);
        conn.connect(1).await?;
        let fetched = server_info(conn.as_mut()).await;
        conn.close().await;
        let (distro, version) = fetched?;
        instance.distro = distro;
        instance.version = version;
        Ok(instance)
    }
}

/// Command payloads carrying a uuid may be a JSON string or the raw bytes.
pub(crate) fn uuid_payload(data: &[u8]) -> Option<String> {
    let uuid = serde_json::from_slice::<String>(data)
        .unwrap_or_else(|_| String::from_utf8_lossy(data).to_string());
    let uuid = uuid.trim().to_string();
    (!uuid.is_empty()).then_some(uuid)
}

#[async_trait]
impl ServiceManager for InstanceManager {
    async fn start(&self) -> Result<()> {
        let count = self.repo.init()?;
        self.status.update(SERVICE_NAME, "Running");
        info!(count, "instance service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.status.update(SERVICE_NAME, "Stopped");
        Ok(())
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.as_str() {
            "RemoveInstance" => {
                let Some(uuid) = uuid_payload(&cmd.data) else {
                    return cmd.reply_err("RemoveInstance needs an instance uuid");
                };
                match self.repo.remove(&uuid) {
                    Ok(()) => cmd.reply_ok(),
                    Err(e) => cmd.reply_err(e),
                }
            }
            "GetInfo" => {
                let instance: MysqlInstance = match serde_json::from_slice(&cmd.data) {
                    Ok(instance) => instance,
                    Err(e) => return cmd.reply_err(format!("invalid instance: {}", e)),
                };
                match self.get_info(instance).await {
                    Ok(instance) => cmd.reply(Some(&instance), None),
                    Err(e) => {
                        warn!(error = %e, "GetInfo failed");
                        cmd.reply_err(e)
                    }
                }
            }
            "GetConfig" => cmd.reply(Some(&Vec::<ServiceConfig>::new()), None),
            other => cmd.reply_err(AgentError::UnknownCommand {
                service: SERVICE_NAME.to_string(),
                cmd: other.to_string(),
            }),
        }
    }

    fn status(&self) -> StatusMap {
        self.status.all()
    }

    fn get_config(&self) -> (Vec<ServiceConfig>, Vec<String>) {
        (Vec::new(), Vec::new())
    }
}
