use bollard::Docker;
use bollard::models::{ContainerConfig, ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CommitContainerOptionsBuilder, CreateContainerOptions, CreateImageOptions,
    InspectContainerOptions, LogsOptionsBuilder, PushImageOptionsBuilder, RemoveContainerOptions,
    RemoveImageOptions, StartContainerOptions, StopContainerOptionsBuilder, WaitContainerOptions,
};
use futures_util::StreamExt;
use log::{debug, trace};
use std::collections::HashMap;
use thiserror::Error;

use crate::cluster::{Node, NodeConnector};
use crate::image::split_tag;

pub type ContainerID = String;

const STOP_TIMEOUT_SECS: i32 = 10;
const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No such container: {0}")]
    NoSuchContainer(String),
    #[error("No such image: {0}")]
    NoSuchImage(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::NoSuchContainer(_) | RuntimeError::NoSuchImage(_)
        )
    }
}

/// What to run in a new container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// Container-internal port to publish on a random host port.
    pub exposed_port: Option<String>,
}

/// Runtime view of a container, as reported by inspect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub id: ContainerID,
    pub ip: String,
    pub running: bool,
    pub status: String,
    pub exit_code: Option<i64>,
    /// container port (without protocol suffix) -> host port
    pub ports: HashMap<String, String>,
}

impl ContainerInfo {
    pub fn host_port(&self, port: &str) -> Option<&str> {
        let port = port.split('/').next().unwrap_or(port);
        self.ports
            .get(port)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

/// Remote container-runtime API of a single node.
pub trait ContainerRuntime: Send + Sync + 'static {
    fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<ContainerID, RuntimeError>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Stopping a container that is not running succeeds.
    fn stop_container(&self, id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove_container(&self, id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn inspect_container(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ContainerInfo, RuntimeError>> + Send;

    /// Blocks until the container exits and returns its exit code.
    fn wait_container(&self, id: &str) -> impl Future<Output = Result<i64, RuntimeError>> + Send;

    /// Snapshots the container into `repository`, returning the new image ID.
    fn commit_container(
        &self,
        id: &str,
        repository: &str,
    ) -> impl Future<Output = Result<String, RuntimeError>> + Send;

    fn container_logs(&self, id: &str)
    -> impl Future<Output = Result<Vec<u8>, RuntimeError>> + Send;

    fn pull_image(
        &self,
        repository: &str,
        registry: Option<&str>,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn push_image(
        &self,
        repository: &str,
        registry: Option<&str>,
    ) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove_image(&self, image: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;
}

/// Full image name as the registry sees it.
pub fn qualified_name(repository: &str, registry: Option<&str>) -> String {
    match registry {
        Some(registry) if !registry.is_empty() => format!("{registry}/{repository}"),
        _ => repository.to_string(),
    }
}

fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn container_error(e: bollard::errors::Error, id: &str) -> RuntimeError {
    match status_code(&e) {
        Some(404) => RuntimeError::NoSuchContainer(id.to_string()),
        _ => RuntimeError::Docker(e),
    }
}

fn image_error(e: bollard::errors::Error, image: &str) -> RuntimeError {
    match status_code(&e) {
        Some(404) => RuntimeError::NoSuchImage(image.to_string()),
        _ => RuntimeError::Docker(e),
    }
}

/// `ContainerRuntime` backed by a docker daemon reached over HTTP.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect(address: &str) -> Result<Self, RuntimeError> {
        let docker =
            Docker::connect_with_http(address, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerID, RuntimeError> {
        let port_bindings = spec.exposed_port.as_ref().map(|port| {
            HashMap::from([(
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: None,
                }]),
            )])
        });
        let host_config = HostConfig {
            port_bindings,
            ..Default::default()
        };
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container(None::<CreateContainerOptions>, config)
            .await
            .map_err(|e| image_error(e, &spec.image))?;
        debug!("container created with ID: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| container_error(e, id))
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new()
            .t(STOP_TIMEOUT_SECS)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: container already stopped
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(container_error(e, id)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            v: false,
            force: true,
            link: false,
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| container_error(e, id))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| container_error(e, id))?;
        trace!(
            "container details: {}",
            serde_json::to_string_pretty(&details).unwrap_or_default()
        );

        let mut info = ContainerInfo {
            id: details.id.unwrap_or_else(|| id.to_string()),
            ..Default::default()
        };
        if let Some(state) = details.state {
            info.running = state.running.unwrap_or(false);
            info.exit_code = state.exit_code;
            info.status = state.status.map(|s| s.to_string()).unwrap_or_default();
        }
        if let Some(network) = details.network_settings {
            info.ip = network
                .networks
                .unwrap_or_default()
                .into_values()
                .filter_map(|endpoint| endpoint.ip_address)
                .find(|ip| !ip.is_empty())
                .unwrap_or_default();
            for (port, bindings) in network.ports.unwrap_or_default() {
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|binding| binding.host_port.filter(|p| !p.is_empty()));
                if let Some(host_port) = host_port {
                    let port = port.split('/').next().unwrap_or_default().to_string();
                    info.ports.insert(port, host_port);
                }
            }
        }
        Ok(info)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions>);
        let mut code = 0;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => code = response.status_code,
                // bollard reports a non-zero exit as an error
                Err(bollard::errors::Error::DockerContainerWaitError { code: exit, .. }) => {
                    return Ok(exit);
                }
                Err(e) => return Err(container_error(e, id)),
            }
        }
        Ok(code)
    }

    async fn commit_container(&self, id: &str, repository: &str) -> Result<String, RuntimeError> {
        let (repo, tag) = split_tag(repository);
        let mut options = CommitContainerOptionsBuilder::new()
            .container(id)
            .repo(repo);
        if let Some(tag) = tag {
            options = options.tag(tag);
        }
        let response = self
            .docker
            .commit_container(options.build(), ContainerConfig::default())
            .await
            .map_err(|e| container_error(e, id))?;
        Ok(response.id)
    }

    async fn container_logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| container_error(e, id))?;
            output.extend_from_slice(&chunk.into_bytes());
        }
        Ok(output)
    }

    async fn pull_image(&self, repository: &str, registry: Option<&str>) -> Result<(), RuntimeError> {
        let name = qualified_name(repository, registry);
        let (image, tag) = split_tag(&name);
        let options = CreateImageOptions {
            from_image: Some(image.to_owned()),
            tag: Some(tag.unwrap_or("latest").to_owned()),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            let output = result.map_err(|e| image_error(e, &name))?;
            debug!("{output:?}");
        }
        debug!("pulled {name}");
        Ok(())
    }

    async fn push_image(&self, repository: &str, registry: Option<&str>) -> Result<(), RuntimeError> {
        let name = qualified_name(repository, registry);
        let (image, tag) = split_tag(&name);
        let options = PushImageOptionsBuilder::new()
            .tag(tag.unwrap_or("latest"))
            .build();
        let mut push_stream = self.docker.push_image(image, Some(options), None);
        while let Some(result) = push_stream.next().await {
            let output = result.map_err(|e| image_error(e, &name))?;
            debug!("{output:?}");
        }
        debug!("pushed {name}");
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(image, None::<RemoveImageOptions>, None)
            .await
            .map_err(|e| image_error(e, image))?;
        Ok(())
    }
}

/// Connects to each node's docker daemon over HTTP.
#[derive(Clone, Default)]
pub struct DockerConnector;

impl NodeConnector for DockerConnector {
    type Runtime = DockerRuntime;

    fn connect(&self, node: &Node) -> Result<DockerRuntime, RuntimeError> {
        debug!("connecting to node {} at {}", node.id, node.address);
        DockerRuntime::connect(&node.address)
    }
}
