use log::{debug, info};
use std::sync::Arc;

use crate::cluster::{ClusterManager, NodeConnector};
use crate::config::Config;
use crate::container::AppSpec;
use crate::error::BerthError;
use crate::runtime::ContainerRuntime;
use crate::store::{ContainerCollection, ContainerStore};

/// `<registry>/<namespace>/<name>`, or `<namespace>/<name>` without a registry.
pub fn build_image(registry: Option<&str>, namespace: &str, name: &str) -> String {
    match registry {
        Some(registry) if !registry.is_empty() => format!("{registry}/{namespace}/{name}"),
        _ => format!("{namespace}/{name}"),
    }
}

/// Splits `repo:tag` without mistaking a registry port for a tag, e.g.
/// `localhost:3030/base` has no tag.
pub fn split_tag(image: &str) -> (&str, Option<&str>) {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (&image[..at], Some(&image[at + 1..]))
        }
        None => (image, None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageNamer {
    registry: Option<String>,
    namespace: String,
}

impl ImageNamer {
    pub fn new(registry: Option<String>, namespace: impl Into<String>) -> Self {
        Self {
            registry: registry.filter(|r| !r.is_empty()),
            namespace: namespace.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.registry.clone(), config.repository_namespace.clone())
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn build_image(&self, name: &str) -> String {
        build_image(self.registry(), &self.namespace, name)
    }

    /// Drops a leading `<registry>/` from `tag`, if present.
    pub fn strip_registry<'a>(&self, tag: &'a str) -> &'a str {
        self.registry
            .as_deref()
            .and_then(|registry| tag.strip_prefix(registry))
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(tag)
    }

    /// Image previously recorded for the app, else the platform base image.
    pub async fn resolve_image<S: ContainerCollection>(
        &self,
        app: &AppSpec,
        store: &ContainerStore<S>,
    ) -> Result<String, BerthError> {
        if let Some(image) = store.app_image(&app.name).await? {
            debug!("using recorded image {image} for {}", app.name);
            return Ok(image);
        }
        Ok(self.build_image(&app.platform))
    }
}

/// Copies images to the configured registry from every node.
pub struct ImageReplicator<C: NodeConnector> {
    cluster: Arc<ClusterManager<C>>,
    namer: ImageNamer,
}

impl<C: NodeConnector> ImageReplicator<C> {
    pub fn new(cluster: Arc<ClusterManager<C>>, namer: ImageNamer) -> Self {
        Self { cluster, namer }
    }

    /// Pulls `tag` from the registry and pushes it back, node by node.
    /// Without a registry this does nothing. Stops at the first failing node.
    pub async fn replicate(&self, tag: &str) -> Result<(), BerthError> {
        let Some(registry) = self.namer.registry() else {
            debug!("no registry configured, skipping replication of {tag}");
            return Ok(());
        };
        let repository = self.namer.strip_registry(tag);
        let cluster = self.cluster.get_cluster()?;
        for node in cluster.iter() {
            let runtime = node.runtime();
            runtime
                .pull_image(repository, Some(registry))
                .await
                .map_err(|source| BerthError::Replication {
                    node: node.node.id.clone(),
                    source,
                })?;
            runtime
                .push_image(repository, Some(registry))
                .await
                .map_err(|source| BerthError::Replication {
                    node: node.node.id.clone(),
                    source,
                })?;
            debug!("replicated {repository} from node {}", node.node.id);
        }
        info!("image {repository} replicated to {registry}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::store::MemoryCollection;
    use crate::testing::FakeConnector;

    fn setup_replicator(
        servers: &[&str],
        registry: Option<&str>,
    ) -> (ImageReplicator<FakeConnector>, FakeConnector) {
        let connector = FakeConnector::default();
        let servers = servers.iter().map(|s| s.to_string()).collect();
        let cluster = Arc::new(ClusterManager::new(servers, connector.clone()));
        let namer = ImageNamer::new(registry.map(str::to_string), "tsuru");
        (ImageReplicator::new(cluster, namer), connector)
    }

    #[test]
    fn test_build_image_name() {
        let namer = ImageNamer::new(None, "tsuru");
        assert_eq!(namer.build_image("raising"), "tsuru/raising");
    }

    #[test]
    fn test_build_image_name_with_registry() {
        let namer = ImageNamer::new(Some("localhost:3030".to_string()), "tsuru");
        assert_eq!(namer.build_image("raising"), "localhost:3030/tsuru/raising");
    }

    #[test]
    fn test_empty_registry_counts_as_unset() {
        let namer = ImageNamer::new(Some(String::new()), "tsuru");
        assert_eq!(namer.registry(), None);
        assert_eq!(namer.build_image("raising"), "tsuru/raising");
    }

    #[test]
    fn test_strip_registry() {
        let namer = ImageNamer::new(Some("localhost:3030".to_string()), "tsuru");
        assert_eq!(namer.strip_registry("localhost:3030/base"), "base");
        assert_eq!(namer.strip_registry("base"), "base");
        assert_eq!(namer.strip_registry("localhost:30301/base"), "localhost:30301/base");
    }

    #[test]
    fn test_split_tag() {
        assert_eq!(split_tag("tsuru/python"), ("tsuru/python", None));
        assert_eq!(split_tag("tsuru/python:v2"), ("tsuru/python", Some("v2")));
        assert_eq!(split_tag("localhost:3030/base"), ("localhost:3030/base", None));
        assert_eq!(
            split_tag("localhost:3030/base:latest"),
            ("localhost:3030/base", Some("latest"))
        );
    }

    #[tokio::test]
    async fn test_resolve_image_from_platform() {
        let store = ContainerStore::new(MemoryCollection::default());
        let namer = ImageNamer::new(None, "tsuru");
        let app = AppSpec::new("myapp", "python");
        assert_eq!(namer.resolve_image(&app, &store).await.unwrap(), "tsuru/python");

        let namer = ImageNamer::new(Some("localhost:3030".to_string()), "tsuru");
        assert_eq!(
            namer.resolve_image(&app, &store).await.unwrap(),
            "localhost:3030/tsuru/python"
        );
    }

    #[tokio::test]
    async fn test_resolve_image_prefers_recorded_image() {
        let store = ContainerStore::new(MemoryCollection::default());
        store
            .insert(&Container {
                id: "bleble".to_string(),
                kind: "python".to_string(),
                app_name: "myapp".to_string(),
                image: "someimageid".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let namer = ImageNamer::new(None, "tsuru");
        let app = AppSpec::new("myapp", "python");
        assert_eq!(namer.resolve_image(&app, &store).await.unwrap(), "someimageid");
    }

    #[tokio::test]
    async fn test_replicate_without_registry() {
        let (replicator, connector) = setup_replicator(&["http://10.10.10.10:4243"], None);
        replicator.replicate("base").await.unwrap();
        assert!(connector.runtime().calls().is_empty());
        assert_eq!(connector.connections(), 0);
    }

    #[tokio::test]
    async fn test_replicate_image() {
        for tag in ["base", "localhost:3030/base"] {
            let (replicator, connector) =
                setup_replicator(&["http://10.10.10.10:4243"], Some("localhost:3030"));
            replicator.replicate(tag).await.unwrap();

            let runtime = connector.runtime();
            let pulls = runtime.calls_of("pull");
            let pushes = runtime.calls_of("push");
            assert_eq!(pulls.len(), 1, "pulls for {tag}");
            assert_eq!(pushes.len(), 1, "pushes for {tag}");
            assert_eq!(pulls[0].target, "localhost:3030/base");
            assert_eq!(pushes[0].target, "localhost:3030/base");
        }
    }

    #[tokio::test]
    async fn test_replicate_stops_at_first_failing_node() {
        let (replicator, connector) = setup_replicator(
            &["http://10.10.10.10:4243", "http://10.10.10.11:4243"],
            Some("localhost:3030"),
        );
        connector.runtime().fail_node("server0");

        let err = replicator.replicate("base").await.unwrap_err();

        assert!(matches!(err, BerthError::Replication { ref node, .. } if node == "server0"));
        let calls = connector.runtime().calls();
        assert_eq!(calls.len(), 1);
        assert!(calls.iter().all(|c| c.node == "server0"));
    }
}
