use clap::{Arg, ArgAction, ArgMatches, Command};
use std::env;
use std::path::PathBuf;

pub(crate) enum Action {
    Nodes,
    Image { app: String },
    Replicate { tag: String },
    Logs { container: String, follow: bool },
    Ssh { address: String, command: Vec<String> },
}

pub(crate) struct Cli {
    pub(crate) config: PathBuf,
    pub(crate) action: Action,
}

impl From<ArgMatches> for Cli {
    fn from(matches: ArgMatches) -> Self {
        let config = matches
            .get_one::<PathBuf>("config")
            .cloned()
            .unwrap_or_default();
        let action = match matches.subcommand() {
            Some(("image", sub)) => Action::Image {
                app: sub.get_one::<String>("app").cloned().unwrap_or_default(),
            },
            Some(("replicate", sub)) => Action::Replicate {
                tag: sub.get_one::<String>("tag").cloned().unwrap_or_default(),
            },
            Some(("logs", sub)) => Action::Logs {
                container: sub
                    .get_one::<String>("container")
                    .cloned()
                    .unwrap_or_default(),
                follow: sub.get_flag("follow"),
            },
            Some(("ssh", sub)) => Action::Ssh {
                address: sub
                    .get_one::<String>("address")
                    .cloned()
                    .unwrap_or_default(),
                command: sub
                    .get_many::<String>("command")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default(),
            },
            _ => Action::Nodes,
        };
        Cli { config, action }
    }
}

pub(crate) fn configure_cli() -> Cli {
    let default_config = env::var("BERTH_CONFIG").unwrap_or_else(|_| "berth.toml".to_string());
    let matches = Command::new("berth")
        .version("0.1")
        .about("provision containers on a cluster of docker hosts")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help(format!("Configuration file (default: {default_config})"))
                .value_name("PATH")
                .default_value(default_config)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand(Command::new("nodes").about("list the cluster nodes"))
        .subcommand(
            Command::new("image")
                .about("print the image name derived for an app")
                .arg(Arg::new("app").required(true)),
        )
        .subcommand(
            Command::new("replicate")
                .about("copy an image to the registry from every node")
                .arg(Arg::new("tag").required(true)),
        )
        .subcommand(
            Command::new("logs")
                .about("print a container's logs as JSON lines")
                .arg(Arg::new("container").required(true))
                .arg(
                    Arg::new("follow")
                        .short('f')
                        .long("follow")
                        .help("keep streaming until interrupted")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("ssh")
                .about("run a command on a container over ssh")
                .arg(Arg::new("address").required(true))
                .arg(Arg::new("command").required(true).num_args(1..).last(true)),
        )
        .get_matches();
    matches.into()
}
