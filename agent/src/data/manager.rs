//! Data service: owns the spooler and the sender.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agent::ServiceManager;
use crate::basedir::Basedir;
use crate::data::sender::Sender;
use crate::data::serializer::make_serializer;
use crate::data::spooler::{DiskSpooler, PurgeReport, Spooler};
use crate::data::transport::Transport;
use crate::error::{AgentError, ConfigError, ConfigResult, Result};
use crate::proto::{
    Cmd, Reply, ServiceConfig, SpoolLimits, StatusMap, DEFAULT_SPOOL_MAX_AGE, DEFAULT_SPOOL_MAX_FILES,
    DEFAULT_SPOOL_MAX_SIZE,
};
use crate::status::Status;
use crate::ticker::{tick_channel, Clock, TickSender};

pub const SERVICE_NAME: &str = "data";
pub const DEFAULT_SEND_INTERVAL: u64 = 63;
pub const MAX_SEND_INTERVAL: u64 = 3600;
pub const DEFAULT_ENCODING: &str = "gzip";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataConfig {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Seconds between send cycles; also the time budget of one cycle.
    #[serde(default)]
    pub send_interval: u64,
    #[serde(default)]
    pub blackhole: bool,
    #[serde(default = "zero_limits")]
    pub limits: SpoolLimits,
}

fn default_encoding() -> String {
    DEFAULT_ENCODING.to_string()
}

fn zero_limits() -> SpoolLimits {
    SpoolLimits::PURGE_ALL
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            send_interval: DEFAULT_SEND_INTERVAL,
            blackhole: false,
            limits: SpoolLimits::default(),
        }
    }
}

impl DataConfig {
    /// Fill zero values with defaults and check the rest.
    pub fn validate(mut self) -> ConfigResult<Self> {
        make_serializer(&self.encoding).map_err(|_| ConfigError::InvalidValue {
            field: "encoding".to_string(),
            value: self.encoding.clone(),
        })?;

        if self.send_interval == 0 {
            self.send_interval = DEFAULT_SEND_INTERVAL;
        }
        if self.send_interval > MAX_SEND_INTERVAL {
            return Err(ConfigError::InvalidValue {
                field: "send_interval".to_string(),
                value: self.send_interval.to_string(),
            });
        }

        if self.limits.max_age == 0 {
            self.limits.max_age = DEFAULT_SPOOL_MAX_AGE;
        }
        if self.limits.max_size == 0 {
            self.limits.max_size = DEFAULT_SPOOL_MAX_SIZE;
        }
        if self.limits.max_files == 0 {
            self.limits.max_files = DEFAULT_SPOOL_MAX_FILES;
        }
        Ok(self)
    }
}

pub struct DataManager {
    basedir: Basedir,
    clock: Arc<dyn Clock>,
    spooler: Arc<DiskSpooler>,
    sender: Sender,
    config: Mutex<Option<DataConfig>>,
    tick_tx: Mutex<Option<TickSender>>,
    status: Status,
}

impl DataManager {
    pub fn new(
        basedir: Basedir,
        hostname: impl Into<String>,
        clock: Arc<dyn Clock>,
        transport: Box<dyn Transport>,
    ) -> Self {
        let spooler = DiskSpooler::new(basedir.data_dir(), hostname, SpoolLimits::default());
        Self::with_parts(basedir, clock, spooler, Sender::new(transport))
    }

    /// Build from an already configured spooler and sender.
    pub fn with_parts(basedir: Basedir, clock: Arc<dyn Clock>, spooler: DiskSpooler, sender: Sender) -> Self {
        Self {
            basedir,
            clock,
            spooler: Arc::new(spooler),
            sender,
            config: Mutex::new(None),
            tick_tx: Mutex::new(None),
            status: Status::new(&[SERVICE_NAME]),
        }
    }

    /// The spooler analyzers write reports to.
    pub fn spooler(&self) -> Arc<DiskSpooler> {
        Arc::clone(&self.spooler)
    }

    pub fn config(&self) -> Option<DataConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Remove every spooled item regardless of limits.
    pub fn purge_all(&self) -> (usize, PurgeReport) {
        self.spooler.purge(Utc::now(), SpoolLimits::PURGE_ALL)
    }

    fn load_config(&self) -> ConfigResult<DataConfig> {
        match self.basedir.read_config::<DataConfig>(SERVICE_NAME, None)? {
            Some(config) => config.validate(),
            None => {
                info!("no data config, using defaults");
                Ok(DataConfig::default())
            }
        }
    }

    fn start_spooler(&self, config: &DataConfig) -> Result<()> {
        self.spooler.set_limits(config.limits);
        self.spooler.start(make_serializer(&config.encoding)?)?;
        Ok(())
    }

    fn start_sender(&self, config: &DataConfig) -> Result<()> {
        let (tick_tx, tick_rx) = tick_channel();
        self.clock.add(tick_tx.clone(), config.send_interval, false);
        let spooler: Arc<dyn Spooler> = self.spooler.clone();
        if let Err(e) = self.sender.start(
            spooler,
            tick_rx,
            Duration::from_secs(config.send_interval),
            config.blackhole,
        ) {
            self.clock.remove(&tick_tx);
            return Err(e.into());
        }
        *self.tick_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tick_tx);
        Ok(())
    }

    async fn stop_sender(&self) -> Result<()> {
        let tick_tx = self.tick_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tick_tx) = tick_tx {
            self.clock.remove(&tick_tx);
        }
        self.sender.stop().await?;
        Ok(())
    }

    async fn set_config(&self, cmd: &Cmd) -> Result<DataConfig> {
        let new: DataConfig = serde_json::from_slice(&cmd.data).map_err(ConfigError::from)?;
        let new = new.validate()?;
        let old = self.config().unwrap_or_default();

        if new.encoding != old.encoding {
            info!(from = %old.encoding, to = %new.encoding, "encoding changed, restarting spooler");
            self.spooler.stop().await?;
            self.start_spooler(&new)?;
        } else if new.limits != old.limits {
            self.spooler.set_limits(new.limits);
        }

        if new.send_interval != old.send_interval || new.blackhole != old.blackhole {
            info!(
                send_interval = new.send_interval,
                blackhole = new.blackhole,
                "send settings changed, restarting sender"
            );
            self.stop_sender().await?;
            self.start_sender(&new)?;
        }

        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(new.clone());

        // The running change stands even if it cannot be persisted.
        self.basedir.write_config(SERVICE_NAME, None, &new)?;
        Ok(new)
    }
}

#[async_trait]
impl ServiceManager for DataManager {
    async fn start(&self) -> Result<()> {
        if self.spooler.is_running() {
            return Err(AgentError::Generic("data service is already running".to_string()));
        }
        let config = self.load_config()?;
        self.start_spooler(&config)?;
        if let Err(e) = self.start_sender(&config) {
            let _ = self.spooler.stop().await;
            return Err(e);
        }
        info!(
            encoding = %config.encoding,
            send_interval = config.send_interval,
            blackhole = config.blackhole,
            "data service started"
        );
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config);
        self.status.update(SERVICE_NAME, "Running");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Err(e) = self.stop_sender().await {
            warn!(error = %e, "error stopping sender");
        }
        self.spooler.stop().await?;
        self.status.update(SERVICE_NAME, "Stopped");
        info!("data service stopped");
        Ok(())
    }

    async fn handle(&self, cmd: &Cmd) -> Reply {
        self.status.update(SERVICE_NAME, format!("Handling {}", cmd.cmd));
        let reply = match cmd.cmd.as_str() {
            "GetConfig" => {
                let (configs, errs) = self.get_config();
                if errs.is_empty() {
                    cmd.reply(Some(&configs), None)
                } else {
                    cmd.reply(Some(&configs), Some(errs.join("; ")))
                }
            }
            "SetConfig" => match self.set_config(cmd).await {
                Ok(config) => cmd.reply(Some(&config), None),
                Err(e) => {
                    error!(error = %e, "SetConfig failed");
                    cmd.reply_err(e)
                }
            },
            other => cmd.reply_err(AgentError::UnknownCommand {
                service: SERVICE_NAME.to_string(),
                cmd: other.to_string(),
            }),
        };
        self.status.update(SERVICE_NAME, "Running");
        reply
    }

    fn status(&self) -> StatusMap {
        self.status.merge(&[self.spooler.status(), self.sender.status()])
    }

    fn get_config(&self) -> (Vec<ServiceConfig>, Vec<String>) {
        let Some(config) = self.config() else {
            return (Vec::new(), Vec::new());
        };
        match serde_json::to_string(&config) {
            Ok(set) => (
                vec![ServiceConfig {
                    service: SERVICE_NAME.to_string(),
                    uuid: String::new(),
                    set,
                    running: self.spooler.is_running(),
                }],
                Vec::new(),
            ),
            Err(e) => (Vec::new(), vec![e.to_string()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fills_defaults() {
        let config: DataConfig = serde_json::from_str(r#"{"encoding":"none"}"#).unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.send_interval, DEFAULT_SEND_INTERVAL);
        assert_eq!(config.limits, SpoolLimits::default());
        assert_eq!(config.encoding, "none");

        let config: DataConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.validate().unwrap().encoding, "gzip");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DataConfig::default();
        config.encoding = "bzip2".to_string();
        assert!(config.validate().is_err());

        let mut config = DataConfig::default();
        config.send_interval = MAX_SEND_INTERVAL + 1;
        assert!(config.validate().is_err());

        let mut config = DataConfig::default();
        config.send_interval = MAX_SEND_INTERVAL;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_limits_keep_set_fields() {
        let config: DataConfig =
            serde_json::from_str(r#"{"limits":{"max_age":60,"max_size":0,"max_files":5}}"#).unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.limits.max_age, 60);
        assert_eq!(config.limits.max_size, DEFAULT_SPOOL_MAX_SIZE);
        assert_eq!(config.limits.max_files, 5);
    }
}
