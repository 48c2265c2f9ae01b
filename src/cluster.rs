//! Shared handle over the configured docker nodes.
//!
//! The handle is built once, on first use, under the write lock and is
//! immutable afterwards. Readers of a built handle only share a read lock.

use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{BerthError, ConfigError};
use crate::runtime::{ContainerID, ContainerInfo, ContainerRuntime, ContainerSpec, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub address: String,
}

impl Node {
    /// Host part of the node address, e.g. `10.10.10.10` for
    /// `http://10.10.10.10:4243`.
    pub fn host(&self) -> &str {
        let rest = self
            .address
            .split_once("://")
            .map_or(self.address.as_str(), |(_, rest)| rest);
        let authority = rest.split('/').next().unwrap_or(rest);
        if let Some(bracketed) = authority.strip_prefix('[') {
            return bracketed.split(']').next().unwrap_or(bracketed);
        }
        authority
            .rsplit_once(':')
            .map_or(authority, |(host, _)| host)
    }
}

/// Builds a runtime client for a node.
pub trait NodeConnector: Send + Sync + 'static {
    type Runtime: ContainerRuntime;

    fn connect(&self, node: &Node) -> Result<Self::Runtime, RuntimeError>;
}

pub struct ClusterNode<R> {
    pub node: Node,
    runtime: R,
}

impl<R> ClusterNode<R> {
    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

/// Immutable set of nodes. Container-scoped calls are routed to whichever
/// node holds the container.
pub struct Cluster<R> {
    nodes: Vec<ClusterNode<R>>,
    next: AtomicUsize,
}

impl<R: ContainerRuntime> Cluster<R> {
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|n| &n.node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterNode<R>> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Creates the container on the next node in round-robin order.
    pub async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<(&Node, ContainerID), RuntimeError> {
        if self.nodes.is_empty() {
            return Err(RuntimeError::Failed("cluster has no nodes".to_string()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        let target = &self.nodes[index];
        let id = target.runtime.create_container(spec).await?;
        debug!("container {id} created on node {}", target.node.id);
        Ok((&target.node, id))
    }

    /// Finds the node holding `id` together with its current runtime state.
    pub async fn locate(&self, id: &str) -> Result<(&ClusterNode<R>, ContainerInfo), RuntimeError> {
        for node in &self.nodes {
            match node.runtime.inspect_container(id).await {
                Ok(info) => return Ok((node, info)),
                Err(RuntimeError::NoSuchContainer(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(RuntimeError::NoSuchContainer(id.to_string()))
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        self.locate(id).await.map(|(_, info)| info)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let (node, _) = self.locate(id).await?;
        node.runtime.start_container(id).await
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let (node, _) = self.locate(id).await?;
        node.runtime.stop_container(id).await
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let (node, _) = self.locate(id).await?;
        node.runtime.remove_container(id).await
    }

    pub async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let (node, _) = self.locate(id).await?;
        node.runtime.wait_container(id).await
    }

    pub async fn commit_container(&self, id: &str, repository: &str) -> Result<String, RuntimeError> {
        let (node, _) = self.locate(id).await?;
        node.runtime.commit_container(id, repository).await
    }

    pub async fn container_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let (node, _) = self.locate(id).await?;
        node.runtime.container_logs(id).await
    }

    /// Removes the image from every node that has it.
    pub async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut removed = false;
        for node in &self.nodes {
            match node.runtime.remove_image(image).await {
                Ok(()) => removed = true,
                Err(RuntimeError::NoSuchImage(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        if removed {
            Ok(())
        } else {
            Err(RuntimeError::NoSuchImage(image.to_string()))
        }
    }
}

/// Owns the lazily-built cluster handle.
pub struct ClusterManager<C: NodeConnector> {
    servers: Vec<String>,
    connector: C,
    cluster: RwLock<Option<Arc<Cluster<C::Runtime>>>>,
}

impl<C: NodeConnector> ClusterManager<C> {
    pub fn new(servers: Vec<String>, connector: C) -> Self {
        Self {
            servers,
            connector,
            cluster: RwLock::new(None),
        }
    }

    /// Returns the cluster handle, building it on first call. Concurrent
    /// first callers wait for a single initialization and share its result.
    pub fn get_cluster(&self) -> Result<Arc<Cluster<C::Runtime>>, BerthError> {
        if let Some(cluster) = self
            .cluster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(cluster.clone());
        }
        let mut guard = self.cluster.write().unwrap_or_else(PoisonError::into_inner);
        // another caller may have built it while we waited for the write lock
        if let Some(cluster) = guard.as_ref() {
            return Ok(cluster.clone());
        }
        if self.servers.is_empty() {
            return Err(ConfigError::NoNodes.into());
        }
        let mut nodes = Vec::with_capacity(self.servers.len());
        for (i, address) in self.servers.iter().enumerate() {
            let node = Node {
                id: format!("server{i}"),
                address: address.clone(),
            };
            let runtime = self.connector.connect(&node)?;
            nodes.push(ClusterNode { node, runtime });
        }
        info!("cluster initialized with {} node(s)", nodes.len());
        let cluster = Arc::new(Cluster {
            nodes,
            next: AtomicUsize::new(0),
        });
        *guard = Some(cluster.clone());
        Ok(cluster)
    }

    /// Drops the cached handle; the next `get_cluster` rebuilds it.
    pub fn reset(&self) {
        let mut guard = self.cluster.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    #[test]
    fn test_node_host() {
        let node = |address: &str| Node {
            id: "server0".to_string(),
            address: address.to_string(),
        };
        assert_eq!(node("http://10.10.10.10:4243").host(), "10.10.10.10");
        assert_eq!(node("http://localhost:4243/").host(), "localhost");
        assert_eq!(node("10.10.10.10").host(), "10.10.10.10");
        assert_eq!(node("http://[::1]:4243").host(), "::1");
    }

    #[test]
    fn test_get_cluster_assigns_ids_in_order() {
        let manager = ClusterManager::new(
            vec![
                "http://localhost:4243".to_string(),
                "http://10.10.10.10:4243".to_string(),
            ],
            FakeConnector::default(),
        );
        let cluster = manager.get_cluster().unwrap();
        let nodes: Vec<Node> = cluster.nodes().cloned().collect();
        assert_eq!(
            nodes,
            vec![
                Node {
                    id: "server0".to_string(),
                    address: "http://localhost:4243".to_string()
                },
                Node {
                    id: "server1".to_string(),
                    address: "http://10.10.10.10:4243".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_get_cluster_without_nodes() {
        let manager = ClusterManager::new(vec![], FakeConnector::default());
        let err = manager.get_cluster().err().unwrap();
        assert!(matches!(err, BerthError::Configuration(ConfigError::NoNodes)));
    }

    #[test]
    fn test_get_cluster_is_cached_until_reset() {
        let connector = FakeConnector::default();
        let manager = ClusterManager::new(vec!["http://localhost:4243".to_string()], connector.clone());
        let first = manager.get_cluster().unwrap();
        let second = manager.get_cluster().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connections(), 1);

        manager.reset();
        let third = manager.get_cluster().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(connector.connections(), 2);
    }

    #[test]
    fn test_built_cluster_is_readable_while_another_reader_holds_it() {
        let connector = FakeConnector::default();
        let manager = ClusterManager::new(vec!["http://localhost:4243".to_string()], connector.clone());
        let first = manager.get_cluster().unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let manager = &manager;
        let second = std::thread::scope(|scope| {
            scope.spawn(move || {
                let _reader = manager.cluster.read().unwrap();
                held_tx.send(()).unwrap();
                let _ = release_rx.recv();
            });
            held_rx.recv().unwrap();
            let second = manager.get_cluster().unwrap();
            release_tx.send(()).unwrap();
            second
        });

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connections(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_callers_share_one_handle() {
        let connector = FakeConnector::default();
        let manager = Arc::new(ClusterManager::new(
            vec![
                "http://localhost:4243".to_string(),
                "http://10.10.10.10:4243".to_string(),
            ],
            connector.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get_cluster().unwrap() }));
        }
        let mut clusters = Vec::new();
        for handle in handles {
            clusters.push(handle.await.unwrap());
        }

        assert!(clusters.iter().all(|c| Arc::ptr_eq(c, &clusters[0])));
        assert_eq!(connector.connections(), 2);
    }
}
