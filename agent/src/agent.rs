//! Remote command routing
//!
//! Every service (`data`, `qan`, `instance`) implements [`ServiceManager`].
//! The [`Agent`] dispatches a [`Cmd`] to the manager named by its `service`
//! field and guarantees the caller a [`Reply`] carrying either data or a
//! non-empty error.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::proto::{Cmd, Reply, ServiceConfig, StatusMap};
use crate::status::Status;

pub const AGENT_SERVICE: &str = "agent";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Handle a command addressed to this service.
    async fn handle(&self, cmd: &Cmd) -> Reply;

    fn status(&self) -> StatusMap;

    /// Current configuration of every running instance of the service, plus
    /// any errors encountered collecting them.
    fn get_config(&self) -> (Vec<ServiceConfig>, Vec<String>);
}

/// Log a service failure at the level its error calls for.
pub fn log_service_error(service: &str, message: &str, e: &AgentError) {
    if e.log_level() == tracing::Level::WARN {
        warn!(service = %service, category = e.category(), error = %e, "{}", message);
    } else {
        error!(
            service = %service,
            category = e.category(),
            critical = e.is_critical(),
            error = %e,
            "{}",
            message
        );
    }
}

/// Routes commands to named service managers.
pub struct Agent {
    services: BTreeMap<String, Arc<dyn ServiceManager>>,
    status: Status,
}

impl Agent {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            status: Status::new(&[AGENT_SERVICE]),
        }
    }

    pub fn with_service(mut self, name: impl Into<String>, manager: Arc<dyn ServiceManager>) -> Self {
        self.services.insert(name.into(), manager);
        self
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn ServiceManager>> {
        self.services.get(name).cloned()
    }

    /// Start every service; one failing service does not stop the others.
    pub async fn start(&self) -> Vec<(String, AgentError)> {
        let mut failed = Vec::new();
        for (name, manager) in &self.services {
            match manager.start().await {
                Ok(()) => info!(service = %name, "service started"),
                Err(e) => {
                    log_service_error(name, "service failed to start", &e);
                    failed.push((name.clone(), e));
                }
            }
        }
        self.status.update(AGENT_SERVICE, "Idle");
        failed
    }

    /// Stop every service in reverse order.
    pub async fn stop(&self) {
        for (name, manager) in self.services.iter().rev() {
            if let Err(e) = manager.stop().await {
                log_service_error(name, "error stopping service", &e);
            }
        }
        self.status.update(AGENT_SERVICE, "Stopped");
    }

    pub async fn handle(&self, cmd: &Cmd) -> Reply {
        debug!(service = %cmd.service, cmd = %cmd.cmd, id = %cmd.id, "handling command");
        if cmd.service == AGENT_SERVICE || cmd.service.is_empty() {
            return self.handle_local(cmd);
        }

        let Some(manager) = self.services.get(&cmd.service) else {
            return cmd.reply_err(AgentError::UnknownCommand {
                service: cmd.service.clone(),
                cmd: cmd.cmd.clone(),
            });
        };

        self.status.update(AGENT_SERVICE, format!("Handling {} {}", cmd.service, cmd.cmd));
        let reply = match std::panic::AssertUnwindSafe(manager.handle(cmd)).catch_unwind().await {
            Ok(reply) => reply,
            Err(_) => {
                error!(service = %cmd.service, cmd = %cmd.cmd, "command handler panicked");
                cmd.reply_err(AgentError::Crashed(format!("{} {}", cmd.service, cmd.cmd)))
            }
        };
        self.status.update(AGENT_SERVICE, "Idle");
        reply
    }

    fn handle_local(&self, cmd: &Cmd) -> Reply {
        match cmd.cmd.as_str() {
            "Status" => cmd.reply(Some(&self.status()), None),
            "Version" => cmd.reply(Some(&VERSION), None),
            "GetAllConfigs" => {
                let mut configs = Vec::new();
                let mut errs = Vec::new();
                for manager in self.services.values() {
                    let (c, e) = manager.get_config();
                    configs.extend(c);
                    errs.extend(e);
                }
                let err = (!errs.is_empty()).then(|| errs.join("; "));
                cmd.reply(Some(&configs), err)
            }
            other => cmd.reply_err(AgentError::UnknownCommand {
                service: AGENT_SERVICE.to_string(),
                cmd: other.to_string(),
            }),
        }
    }

    /// Merged status of the agent and every service.
    pub fn status(&self) -> StatusMap {
        let others: Vec<StatusMap> = self.services.values().map(|m| m.status()).collect();
        self.status.merge(&others)
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new()
    }
}
