//! fleetprobe library
//!
//! Host access, topic API clients, configuration and the acceptance
//! scenarios run by the `fleetprobe` binary.

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod host;
pub mod inventory;
pub mod logging;
pub mod scenarios;

pub use artifacts::ArtifactStore;
pub use backend::{Backend, BackendError, HostCurlTopicSource, HttpTopicSource, ReceiverHealth, TopicQuery, TopicSource};
pub use config::{ConfigError, SuiteConfig, Transport};
pub use host::{Host, HostError, LocalHost, Platform, SshHost};
pub use inventory::{Instance, Inventory, InventoryError};
pub use scenarios::{Report, ScenarioContext, ScenarioKind};
