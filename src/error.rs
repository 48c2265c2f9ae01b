use std::path::PathBuf;
use thiserror::Error;

use crate::remote::CmdError;
use crate::router::RouterError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// Required configuration is absent. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no cluster nodes configured")]
    NoNodes,
    #[error("missing setting `{0}`")]
    MissingSetting(&'static str),
    #[error("public key {path:?} not readable: {source}")]
    KeyNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no add-key command configured")]
    MissingAddKeyCommand,
    #[error("no ssh user configured")]
    NoUserConfigured,
    #[error(transparent)]
    Load(#[from] Box<figment2::Error>),
}

/// The container has no usable host address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Container port {0} is not mapped to any host port")]
    PortNotMapped(String),
    #[error("Container does not contain any mapped port")]
    NoPortConfigured,
}

#[derive(Debug, Error)]
pub enum BerthError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("failed to provision {target}: {source}")]
    Provision {
        target: String,
        #[source]
        source: RuntimeError,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    AddressUnavailable(#[from] AddressError),
    #[error(transparent)]
    RemoteExec(#[from] CmdError),
    #[error("replication failed on node {node}: {source}")]
    Replication {
        node: String,
        #[source]
        source: RuntimeError,
    },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("failed to encode log events: {0}")]
    Encode(#[source] std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BerthError {
    pub(crate) fn provision(target: impl Into<String>, source: RuntimeError) -> Self {
        BerthError::Provision {
            target: target.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BerthError::NotFound(_) => true,
            BerthError::Runtime(e) => e.is_not_found(),
            _ => false,
        }
    }
}
