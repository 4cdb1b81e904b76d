//! `qan` service: one analyzer per monitored instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::agent::{log_service_error, ServiceManager};
use crate::basedir::{read_json_file, Basedir};
use crate::error::{AgentError, AnalyzerError, ConfigError, Result};
use crate::instance::manager::uuid_payload;
use crate::instance::Repo;
use crate::mrms::RestartMonitor;
use crate::proto::{Cmd, Reply, ServiceConfig, StatusMap};
use crate::qan::mysql_config::mysql_commands;
use crate::qan::{Analyzer, AnalyzerFactory, QanConfig, SERVICE_NAME};
use crate::status::Status;

/// A saved config that could not be read.
struct FailedStart {
    uuid: String,
    reason: String,
}

struct Running {
    analyzer: Arc<dyn Analyzer>,
    subscription: u64,
}

pub struct QanManager {
    basedir: Basedir,
    repo: Arc<Repo>,
    mrms: Arc<dyn RestartMonitor>,
    factory: Arc<dyn AnalyzerFactory>,
    analyzers: Mutex<HashMap<String, Running>>,
    /// Serializes tool start and stop.
    tools: AsyncMutex<()>,
    status: Status,
}

impl QanManager {
    pub fn new(
        basedir: Basedir,
        repo: Arc<Repo>,
        mrms: Arc<dyn RestartMonitor>,
        factory: Arc<dyn AnalyzerFactory>,
    ) -> Self {
        Self {
            basedir,
            repo,
            mrms,
            factory,
            analyzers: Mutex::new(HashMap::new()),
            tools: AsyncMutex::new(()),
            status: Status::new(&[SERVICE_NAME]),
        }
    }

    /// Uuids of the running analyzers, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut uuids: Vec<String> = self
            .analyzers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        uuids.sort();
        uuids
    }

    pub fn analyzer(&self, uuid: &str) -> Option<Arc<dyn Analyzer>> {
        self.analyzers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uuid)
            .map(|r| Arc::clone(&r.analyzer))
    }

    fn is_running(&self, uuid: &str) -> bool {
        self.analyzers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(uuid)
    }

    async fn start_analyzer(&self, config: QanConfig) -> Result<QanConfig> {
        if uuid::Uuid::parse_str(&config.uuid).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "uuid".to_string(),
                value: config.uuid,
            }
            .into());
        }
        if self.is_running(&config.uuid) {
            return Err(AnalyzerError::DuplicateTool { uuid: config.uuid }.into());
        }

        let instance = self.repo.get(&config.uuid, true).await?;
        let mut config = config.with_defaults();
        config.validate()?;
        if !instance.distro.is_empty() && !instance.version.is_empty() {
            let (start, stop, rate_limit) = mysql_commands(&instance.distro, &instance.version, &config)?;
            config.start = start;
            config.stop = stop;
            config.rate_limit = rate_limit;
        }

        let name = if instance.name.is_empty() {
            instance.uuid.clone()
        } else {
            instance.name.clone()
        };
        let uuid = config.uuid.clone();
        let subscription = self.mrms.add(instance.clone());
        let analyzer: Arc<dyn Analyzer> =
            Arc::from(self.factory.make(config.clone(), name, instance, subscription.rx));
        if let Err(e) = analyzer.start().await {
            self.mrms.remove(&uuid, subscription.id);
            return Err(e.into());
        }

        self.analyzers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            uuid.clone(),
            Running {
                analyzer,
                subscription: subscription.id,
            },
        );
        info!(instance = %uuid, collect_from = config.collect_from.as_str(), "analyzer started");
        Ok(config)
    }

    async fn stop_analyzer(&self, uuid: &str) -> Result<()> {
        let running = self.analyzers.lock().unwrap_or_else(|e| e.into_inner()).remove(uuid);
        let Some(running) = running else {
            return Ok(());
        };
        self.mrms.remove(uuid, running.subscription);
        running.analyzer.stop().await?;
        info!(instance = %uuid, "analyzer stopped");
        Ok(())
    }

    async fn start_tool(&self, cmd: &Cmd) -> Result<QanConfig> {
        let config: QanConfig = serde_json::from_slice(&cmd.data).map_err(ConfigError::from)?;
        let _guard = self.tools.lock().await;
        let config = self.start_analyzer(config).await?;
        // The analyzer keeps running when its config cannot be saved.
        self.basedir.write_config(SERVICE_NAME, Some(&config.uuid), &config)?;
        Ok(config)
    }

    async fn stop_tool(&self, cmd: &Cmd) -> Result<()> {
        let uuid = uuid_payload(&cmd.data)
            .ok_or_else(|| AgentError::Generic("StopTool needs an instance uuid".to_string()))?;
        let _guard = self.tools.lock().await;
        if !self.is_running(&uuid) {
            return Ok(());
        }
        self.stop_analyzer(&uuid).await?;
        self.basedir.remove_config(SERVICE_NAME, Some(&uuid))?;
        Ok(())
    }

    /// Configs saved by earlier `StartTool` commands.
    fn saved_configs(&self) -> Vec<std::result::Result<QanConfig, FailedStart>> {
        let files = match self.basedir.instance_configs(SERVICE_NAME) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "cannot list analyzer configs");
                return Vec::new();
            }
        };
        files
            .into_iter()
            .map(|(uuid, path)| match read_json_file::<QanConfig>(&path) {
                Ok(Some(mut config)) => {
                    if config.uuid.is_empty() {
                        config.uuid = uuid;
                    }
                    Ok(config)
                }
                Ok(None) => Err(FailedStart {
                    uuid,
                    reason: "config file vanished".to_string(),
                }),
                Err(e) => Err(FailedStart {
                    uuid,
                    reason: e.to_string(),
                }),
            })
            .collect()
    }
}

#[async_trait]
impl ServiceManager for QanManager {
    /// Start an analyzer for every saved config. A bad config only skips
    /// its own instance.
    async fn start(&self) -> Result<()> {
        let _guard = self.tools.lock().await;
        let mut started = 0;
        for saved in self.saved_configs() {
            let config = match saved {
                Ok(config) => config,
                Err(failed) => {
                    warn!(instance = %failed.uuid, reason = %failed.reason, "skipping analyzer config");
                    continue;
                }
            };
            let uuid = config.uuid.clone();
            match self.start_analyzer(config).await {
                Ok(_) => started += 1,
                Err(e) => warn!(
                    instance = %uuid,
                    category = e.category(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "cannot start analyzer"
                ),
            }
        }
        self.status.update(SERVICE_NAME, "Running");
        info!(started, "qan service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.tools.lock().await;
        for uuid in self.running() {
            if let Err(e) = self.stop_analyzer(&uuid).await {
                warn!(instance = %uuid, error = %e, "error stopping analyzer");
            }
        }
        self.status.update(SERVICE_NAME, "Stopped");
        info!("qan service stopped");
        Ok(())
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.as_str() {
            "StartTool" => match self.start_tool(cmd).await {
                Ok(config) => cmd.reply(Some(&config), None),
                Err(e) => {
                    log_service_error(SERVICE_NAME, "StartTool failed", &e);
                    cmd.reply_err(e)
                }
            },
            "StopTool" => match self.stop_tool(cmd).await {
                Ok(()) => cmd.reply_ok(),
                Err(e) => {
                    log_service_error(SERVICE_NAME, "StopTool failed", &e);
                    cmd.reply_err(e)
                }
            },
            "GetConfig" => {
                let (configs, errs) = self.get_config();
                if errs.is_empty() {
                    cmd.reply(Some(&configs), None)
                } else {
                    cmd.reply(Some(&configs), Some(errs.join("; ")))
                }
            }
            other => cmd.reply_err(AgentError::UnknownCommand {
                service: SERVICE_NAME.to_string(),
                cmd: other.to_string(),
            }),
        }
    }

    fn status(&self) -> StatusMap {
        let analyzers: Vec<Arc<dyn Analyzer>> = self
            .analyzers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|r| Arc::clone(&r.analyzer))
            .collect();
        let mut others: Vec<StatusMap> = analyzers.iter().map(|a| a.status()).collect();
        others.push(self.mrms.status());
        self.status.merge(&others)
    }

    fn get_config(&self) -> (Vec<ServiceConfig>, Vec<String>) {
        let mut configs = Vec::new();
        let mut errs = Vec::new();
        for uuid in self.running() {
            let Some(analyzer) = self.analyzer(&uuid) else {
                continue;
            };
            match serde_json::to_string(&analyzer.config()) {
                Ok(set) => configs.push(ServiceConfig {
                    service: SERVICE_NAME.to_string(),
                    uuid,
                    set,
                    running: true,
                }),
                Err(e) => errs.push(format!("{}: {}", uuid, e)),
            }
        }
        (configs, errs)
    }
}
