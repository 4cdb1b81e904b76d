//! Monitored database instances.

pub mod manager;
pub mod repo;

pub use manager::InstanceManager;
pub use repo::{InstanceApi, Repo};
