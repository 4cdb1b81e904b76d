//! Query analytics agent library
//!
//! Per-instance analyzers cut query activity into contiguous intervals and
//! turn each one into a report. Reports are buffered durably on local disk by
//! the spooler and drained to the remote collector by the sender. Remote
//! commands reach every service through the [`agent::Agent`] router.

pub mod agent;
pub mod basedir;
pub mod config;
pub mod data;
pub mod error;
pub mod fmt;
pub mod instance;
pub mod logging;
pub mod mrms;
pub mod mysql;
pub mod proto;
pub mod qan;
pub mod status;
pub mod ticker;

// Re-export commonly used types
pub use agent::{Agent, ServiceManager};
pub use basedir::Basedir;
pub use config::AgentConfig;
pub use data::{DataManager, DiskSpooler, Sender, Spooler};
pub use error::{AgentError, Result};
pub use instance::{InstanceManager, Repo};
pub use mrms::{RestartMonitor, UptimeMonitor};
pub use qan::{QanManager, RealAnalyzerFactory};
pub use status::Status;
pub use ticker::{Clock, SystemClock};
