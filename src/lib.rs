//! Container provisioning engine for a cluster of docker hosts.
pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod logs;
pub mod provisioner;
pub mod remote;
pub mod router;
pub mod runtime;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cluster::{Cluster, ClusterManager, Node, NodeConnector};
pub use config::{Config, load_config};
pub use container::{AppSpec, Container};
pub use error::{AddressError, BerthError, ConfigError};
pub use image::{ImageNamer, ImageReplicator};
pub use logs::{LogEncoder, LogEvent, LogWatcher, follow_logs};
pub use provisioner::Provisioner;
pub use remote::{CommandExecutor, RemoteExec};
pub use router::Router;
pub use runtime::{ContainerRuntime, DockerConnector, DockerRuntime};
pub use store::{ContainerCollection, ContainerStore};
