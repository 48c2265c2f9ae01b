use serde::Deserialize;
use std::path::{Path, PathBuf};

use figment2::{
    Figment,
    providers::{Env, Format, Toml},
};

use crate::error::ConfigError;

const DEFAULT_SSHD_PATH: &str = "/usr/sbin/sshd";
const DEFAULT_DEPLOY_CMD: &str = "/var/lib/tsuru/deploy";
const DEFAULT_NAMESPACE: &str = "tsuru";

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunCmd {
    pub bin: Option<String>,
    pub port: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Ssh {
    pub user: Option<String>,
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub add_key_cmd: Option<String>,
    pub sshd_path: Option<String>,
}

impl Ssh {
    /// Configured public key, falling back to `${HOME}/.ssh/id_rsa.pub`.
    pub fn public_key_path(&self) -> PathBuf {
        match &self.public_key {
            Some(path) => path.clone(),
            None => {
                let home = std::env::var("HOME").unwrap_or_default();
                Path::new(&home).join(".ssh").join("id_rsa.pub")
            }
        }
    }

    pub fn sshd_path(&self) -> &str {
        self.sshd_path.as_deref().unwrap_or(DEFAULT_SSHD_PATH)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Docker node addresses, in configuration order.
    #[serde(default)]
    pub servers: Vec<String>,
    pub registry: Option<String>,
    #[serde(default = "default_namespace")]
    pub repository_namespace: String,
    #[serde(default = "default_deploy_cmd")]
    pub deploy_cmd: String,
    #[serde(default)]
    pub run_cmd: RunCmd,
    #[serde(default)]
    pub ssh: Ssh,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_deploy_cmd() -> String {
    DEFAULT_DEPLOY_CMD.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            registry: None,
            repository_namespace: default_namespace(),
            deploy_cmd: default_deploy_cmd(),
            run_cmd: RunCmd::default(),
            ssh: Ssh::default(),
        }
    }
}

impl Config {
    pub fn port(&self) -> Result<&str, ConfigError> {
        self.run_cmd
            .port
            .as_deref()
            .ok_or(ConfigError::MissingSetting("run_cmd.port"))
    }

    pub fn run_bin(&self) -> Result<&str, ConfigError> {
        self.run_cmd
            .bin
            .as_deref()
            .ok_or(ConfigError::MissingSetting("run_cmd.bin"))
    }
}

/// Merges the TOML file at `config_path` with `BERTH_` environment variables.
/// Nested keys use `__`, e.g. `BERTH_SSH__USER`.
pub fn load_config(config_path: &Path) -> Result<Config, ConfigError> {
    Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("BERTH_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Load(Box::new(e)))
}

#[test]
fn test_load_config() {
    use figment2::Jail;
    Jail::expect_with(|jail: &mut Jail| {
        jail.create_file(
            "config-test.toml",
            r#"
            servers = ["http://localhost:4243", "http://10.10.10.10:4243"]
            repository_namespace = "tsuru"

            [run_cmd]
            bin = "/var/lib/tsuru/start"
            port = "8888"

            [ssh]
            user = "ubuntu"
            add_key_cmd = "/var/lib/tsuru/add-key"
            "#,
        )?;

        jail.set_env("BERTH_REGISTRY", "localhost:3030");
        jail.set_env("BERTH_SSH__PRIVATE_KEY", "/opt/me/id_dsa");

        let config = load_config("config-test.toml".as_ref()).unwrap();

        assert_eq!(
            config.servers,
            vec!["http://localhost:4243", "http://10.10.10.10:4243"]
        );
        assert_eq!(config.registry.as_deref(), Some("localhost:3030"));
        assert_eq!(config.port().unwrap(), "8888");
        assert_eq!(config.ssh.user.as_deref(), Some("ubuntu"));
        assert_eq!(
            config.ssh.private_key,
            Some(PathBuf::from("/opt/me/id_dsa"))
        );
        assert_eq!(config.ssh.sshd_path(), "/usr/sbin/sshd");
        assert_eq!(config.deploy_cmd, "/var/lib/tsuru/deploy");

        Ok(())
    });
}

#[test]
fn test_unset_is_distinct_from_empty() {
    use figment2::Jail;
    Jail::expect_with(|jail: &mut Jail| {
        jail.create_file(
            "config-test.toml",
            r#"
            registry = ""
            "#,
        )?;

        let config = load_config("config-test.toml".as_ref()).unwrap();
        assert_eq!(config.registry.as_deref(), Some(""));
        assert!(config.servers.is_empty());
        assert!(matches!(
            config.port(),
            Err(ConfigError::MissingSetting("run_cmd.port"))
        ));
        Ok(())
    });
}
