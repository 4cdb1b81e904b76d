//! Durable spool-and-send of reports to the collector.

pub mod manager;
pub mod sender;
pub mod serializer;
pub mod spooler;
pub mod stats;
pub mod transport;

pub use manager::{DataConfig, DataManager};
pub use sender::Sender;
pub use serializer::{make_serializer, GzipSerializer, JsonSerializer, Serializer};
pub use spooler::{DiskSpooler, PurgeReport, Spooler};
pub use stats::{SenderStats, SentInfo};
pub use transport::{TcpTransport, Transport};
