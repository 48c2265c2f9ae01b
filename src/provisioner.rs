//! Container lifecycle: create, start, stop, commit, remove and deploy.
//!
//! A container's transitions are expected to be driven by one owner at a
//! time; nothing here locks a record against concurrent transitions.

use log::{debug, error, info, warn};
use std::io::Write;
use std::sync::Arc;

use crate::cluster::{Cluster, ClusterManager, NodeConnector};
use crate::config::Config;
use crate::container::{AppSpec, Container, STATUS_CREATED, STATUS_RUNNING, STATUS_STOPPED};
use crate::error::BerthError;
use crate::image::{ImageNamer, ImageReplicator};
use crate::remote::{CommandExecutor, RemoteExec};
use crate::router::{Router, RouterError};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::store::{ContainerCollection, ContainerStore};

fn runtime_error(e: RuntimeError) -> BerthError {
    match e {
        RuntimeError::NoSuchContainer(id) => BerthError::NotFound(format!("container {id}")),
        RuntimeError::NoSuchImage(image) => BerthError::NotFound(format!("image {image}")),
        e => BerthError::Runtime(e),
    }
}

/// Removes a container that never made it into the store.
async fn discard<R: ContainerRuntime>(cluster: &Arc<Cluster<R>>, id: &str) {
    if let Err(e) = cluster.remove_container(id).await {
        warn!("failed to discard container {id}: {e}");
    }
}

pub struct Provisioner<C, S, R, E>
where
    C: NodeConnector,
    S: ContainerCollection,
    R: Router,
    E: CommandExecutor,
{
    config: Config,
    cluster: Arc<ClusterManager<C>>,
    store: ContainerStore<S>,
    router: R,
    remote: RemoteExec<E>,
    namer: ImageNamer,
    replicator: ImageReplicator<C>,
}

impl<C, S, R, E> Provisioner<C, S, R, E>
where
    C: NodeConnector,
    S: ContainerCollection,
    R: Router,
    E: CommandExecutor,
{
    pub fn new(
        config: Config,
        cluster: Arc<ClusterManager<C>>,
        collection: S,
        router: R,
        remote: RemoteExec<E>,
    ) -> Self {
        let namer = ImageNamer::from_config(&config);
        let replicator = ImageReplicator::new(cluster.clone(), namer.clone());
        Self {
            config,
            cluster,
            store: ContainerStore::new(collection),
            router,
            remote,
            namer,
            replicator,
        }
    }

    pub fn store(&self) -> &ContainerStore<S> {
        &self.store
    }

    pub fn namer(&self) -> &ImageNamer {
        &self.namer
    }

    pub fn replicator(&self) -> &ImageReplicator<C> {
        &self.replicator
    }

    /// Creates a container for `app` running `cmd`, records it and routes
    /// the app to it. The image is resolved from the app when not given.
    pub async fn create(
        &self,
        app: &AppSpec,
        image: Option<&str>,
        cmd: Vec<String>,
    ) -> Result<Container, BerthError> {
        let image = match image {
            Some(image) => image.to_string(),
            None => self.namer.resolve_image(app, &self.store).await?,
        };
        let port = self.config.port()?.to_string();
        let cluster = self.cluster.get_cluster()?;
        let spec = ContainerSpec {
            image: image.clone(),
            cmd,
            exposed_port: Some(port.clone()),
        };
        let target = format!("{} ({image})", app.name);
        let (node, id) = cluster
            .create_container(&spec)
            .await
            .map_err(|e| BerthError::provision(&target, e))?;
        let info = cluster.inspect_container(&id).await?;

        let mut container = Container {
            id,
            app_name: app.name.clone(),
            kind: app.platform.clone(),
            image,
            ip: info.ip.clone(),
            host_addr: node.host().to_string(),
            port,
            status: STATUS_CREATED.to_string(),
            ..Default::default()
        };
        container.host_port = match container.mapped_port(&info) {
            Ok(host_port) => host_port,
            Err(e) => {
                discard(&cluster, &container.id).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.store.insert(&container).await {
            discard(&cluster, &container.id).await;
            return Err(e);
        }
        if let Err(e) = self.register_route(&container).await {
            if let Err(store_err) = self.store.remove(&container.id).await {
                warn!("failed to drop record of container {}: {store_err}", container.id);
            }
            discard(&cluster, &container.id).await;
            return Err(e);
        }
        info!(
            "container {} created for {} on node {}",
            container.id, container.app_name, node.id
        );
        Ok(container)
    }

    async fn register_route(&self, container: &Container) -> Result<(), BerthError> {
        let address = container.get_address();
        if self.router.has_route(&container.app_name, &address).await {
            return Ok(());
        }
        match self.router.add_route(&container.app_name, &address).await {
            Err(RouterError::BackendNotFound(_)) => {
                self.router.add_backend(&container.app_name).await?;
                self.router.add_route(&container.app_name, &address).await?;
            }
            result => result?,
        }
        debug!("route {address} added to {}", container.app_name);
        Ok(())
    }

    /// `/bin/bash -c "<key provisioning> && <run_cmd.bin>"`
    fn run_command(&self) -> Result<Vec<String>, BerthError> {
        let mut commands = self.remote.provision_commands()?;
        commands.push(self.config.run_bin()?.to_string());
        Ok(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            commands.join(" && "),
        ])
    }

    /// Creates and starts a container serving `app` from `image`. The record
    /// is marked running only once the runtime reports it alive.
    pub async fn start(&self, app: &AppSpec, image: &str) -> Result<Container, BerthError> {
        let cmd = self.run_command()?;
        let mut container = self.create(app, Some(image), cmd).await?;
        match self.run(&mut container).await {
            Ok(()) => {
                info!("container {} running for {}", container.id, app.name);
                Ok(container)
            }
            Err(e) => {
                if let Err(remove_err) = self.remove(&container).await {
                    warn!("failed to discard container {}: {remove_err}", container.id);
                }
                Err(e)
            }
        }
    }

    async fn run(&self, container: &mut Container) -> Result<(), BerthError> {
        let cluster = self.cluster.get_cluster()?;
        let target = format!("{} ({})", container.app_name, container.image);
        cluster
            .start_container(&container.id)
            .await
            .map_err(|e| BerthError::provision(&target, e))?;
        let info = cluster.inspect_container(&container.id).await?;
        if !info.running {
            return Err(BerthError::provision(
                &target,
                RuntimeError::Failed(format!(
                    "container {} is {} after start",
                    container.id, info.status
                )),
            ));
        }
        if !info.ip.is_empty() {
            container.ip = info.ip;
        }
        container.status = STATUS_RUNNING.to_string();
        self.store.update(container).await
    }

    /// Stops the container. Stopping a stopped container succeeds.
    pub async fn stop(&self, container: &mut Container) -> Result<(), BerthError> {
        let cluster = self.cluster.get_cluster()?;
        cluster
            .stop_container(&container.id)
            .await
            .map_err(runtime_error)?;
        self.store.set_status(container, STATUS_STOPPED).await?;
        info!("container {} stopped", container.id);
        Ok(())
    }

    pub async fn stopped(&self, container: &Container) -> Result<bool, BerthError> {
        let cluster = self.cluster.get_cluster()?;
        let info = cluster
            .inspect_container(&container.id)
            .await
            .map_err(runtime_error)?;
        Ok(!info.running)
    }

    /// Removes the container, its record and its route, then revokes its
    /// ssh host key. A container already gone from the runtime is not an
    /// error, and neither is a failed route or key cleanup.
    pub async fn remove(&self, container: &Container) -> Result<(), BerthError> {
        let cluster = self.cluster.get_cluster()?;
        match cluster.remove_container(&container.id).await {
            Ok(()) => debug!("container {} removed from runtime", container.id),
            Err(e) if e.is_not_found() => {
                debug!("container {} already gone from runtime", container.id)
            }
            Err(e) => error!("failed to remove container {}: {e}", container.id),
        }
        self.store.remove(&container.id).await?;

        let address = container.get_address();
        if let Err(e) = self.router.remove_route(&container.app_name, &address).await {
            debug!("route {address} of {} not removed: {e}", container.app_name);
        }
        self.remote.revoke_key(&container.ip).await;
        info!("container {} removed", container.id);
        Ok(())
    }

    /// Snapshots the container into `<namespace>/<app>` and replicates the
    /// image. Returns the image name.
    pub async fn commit(&self, container: &Container) -> Result<String, BerthError> {
        let repository = self.namer.build_image(&container.app_name);
        let cluster = self.cluster.get_cluster()?;
        let image_id = cluster
            .commit_container(&container.id, &repository)
            .await
            .map_err(|e| BerthError::provision(&repository, e))?;
        debug!("container {} committed as {image_id}", container.id);
        self.replicator.replicate(&repository).await?;
        info!("image {repository} committed from {}", container.id);
        Ok(repository)
    }

    /// Builds `version` of `app` in a throwaway container and commits the
    /// result. Build output goes to `output`.
    pub async fn deploy(
        &self,
        app: &AppSpec,
        version: &str,
        output: &mut (dyn Write + Send),
    ) -> Result<String, BerthError> {
        let cmd = vec![self.config.deploy_cmd.clone(), version.to_string()];
        let container = self.create(app, None, cmd).await?;
        let result = self.build(&container, output).await;
        if let Err(e) = self.remove(&container).await {
            warn!("failed to remove build container {}: {e}", container.id);
        }
        let image = result?;
        info!("deployed {version} of {} as {image}", app.name);
        Ok(image)
    }

    async fn build(
        &self,
        container: &Container,
        output: &mut (dyn Write + Send),
    ) -> Result<String, BerthError> {
        let cluster = self.cluster.get_cluster()?;
        let target = format!("{} ({})", container.app_name, container.image);
        cluster
            .start_container(&container.id)
            .await
            .map_err(|e| BerthError::provision(&target, e))?;
        let code = cluster
            .wait_container(&container.id)
            .await
            .map_err(runtime_error)?;
        let logs = cluster
            .container_logs(&container.id)
            .await
            .map_err(runtime_error)?;
        output.write_all(&logs)?;
        if code != 0 {
            return Err(BerthError::provision(
                &target,
                RuntimeError::Failed(format!("build exited with status {code}")),
            ));
        }
        self.commit(container).await
    }

    pub async fn logs(
        &self,
        container: &Container,
        output: &mut (dyn Write + Send),
    ) -> Result<(), BerthError> {
        let cluster = self.cluster.get_cluster()?;
        let logs = cluster
            .container_logs(&container.id)
            .await
            .map_err(runtime_error)?;
        output.write_all(&logs)?;
        Ok(())
    }

    /// Current IP as reported by the runtime.
    pub async fn ip(&self, container: &Container) -> Result<String, BerthError> {
        let cluster = self.cluster.get_cluster()?;
        let info = cluster
            .inspect_container(&container.id)
            .await
            .map_err(runtime_error)?;
        if info.ip.is_empty() {
            return Err(BerthError::NotFound(format!("ip of container {}", container.id)));
        }
        Ok(info.ip)
    }

    /// Host port the runtime currently maps to the container's port.
    pub async fn host_port(&self, container: &Container) -> Result<String, BerthError> {
        if container.port.is_empty() {
            return Err(crate::error::AddressError::NoPortConfigured.into());
        }
        let cluster = self.cluster.get_cluster()?;
        let info = cluster
            .inspect_container(&container.id)
            .await
            .map_err(runtime_error)?;
        Ok(container.mapped_port(&info)?)
    }

    /// Looks up a record whose container is still alive. Records without a
    /// live container are reported as not found.
    pub async fn get_container(&self, id: &str) -> Result<Container, BerthError> {
        let container = self.store.get_container(id).await?;
        let cluster = self.cluster.get_cluster()?;
        cluster.inspect_container(id).await.map_err(runtime_error)?;
        Ok(container)
    }

    pub async fn list_app_containers(&self, app_name: &str) -> Result<Vec<Container>, BerthError> {
        self.store.list_app_containers(app_name).await
    }

    pub async fn remove_image(&self, image: &str) -> Result<(), BerthError> {
        let cluster = self.cluster.get_cluster()?;
        cluster.remove_image(image).await.map_err(runtime_error)
    }

    pub async fn ssh(
        &self,
        container: &Container,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        command: &[&str],
    ) -> Result<(), BerthError> {
        self.remote.ssh(stdout, stderr, &container.ip, command).await
    }
}
