//! Operator CLI for the berth provisioning engine
mod cli;

use berth::cluster::ClusterManager;
use berth::config::load_config;
use berth::image::{ImageNamer, ImageReplicator};
use berth::logs::{DockerLogWatcher, JsonEncoder, follow_logs};
use berth::remote::{LocalFs, RemoteExec, SystemExecutor};
use berth::runtime::DockerConnector;
use env_logger::Env;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::watch;

use crate::cli::{Action, configure_cli};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = configure_cli();
    let config = load_config(&cli.config)?;
    debug!("loaded configuration from {:?}", cli.config);
    let cluster = Arc::new(ClusterManager::new(config.servers.clone(), DockerConnector));

    match cli.action {
        Action::Nodes => {
            for node in cluster.get_cluster()?.nodes() {
                println!("{}\t{}", node.id, node.address);
            }
        }
        Action::Image { app } => {
            println!("{}", ImageNamer::from_config(&config).build_image(&app));
        }
        Action::Replicate { tag } => {
            let replicator = ImageReplicator::new(cluster.clone(), ImageNamer::from_config(&config));
            replicator.replicate(&tag).await?;
        }
        Action::Logs { container, follow } => {
            let handle = cluster.get_cluster()?;
            let (node, _) = handle.locate(&container).await?;
            info!("streaming logs of {container} from node {}", node.node.id);
            let watcher = DockerLogWatcher::new(node.runtime().docker().clone(), &container, follow);

            let (cancel_tx, cancel_rx) = watch::channel(false);
            ctrlc::set_handler(move || {
                info!("Received shutdown signal, closing log stream...");
                let _ = cancel_tx.send(true);
            })?;

            let mut encoder = JsonEncoder::new(std::io::stdout());
            follow_logs(cancel_rx, &container, watcher, &mut encoder).await?;
        }
        Action::Ssh { address, command } => {
            let remote = RemoteExec::new(SystemExecutor, Arc::new(LocalFs), config.ssh.clone());
            let command: Vec<&str> = command.iter().map(String::as_str).collect();
            let (mut stdout, mut stderr) = (std::io::stdout(), std::io::stderr());
            remote
                .ssh(&mut stdout, &mut stderr, &address, &command)
                .await?;
        }
    }
    Ok(())
}
