use serde::{Deserialize, Serialize};

use crate::error::AddressError;
use crate::runtime::ContainerInfo;

pub const STATUS_CREATED: &str = "created";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";

/// The application a container is provisioned for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    /// Platform / language tag, e.g. `python`.
    pub platform: String,
}

impl AppSpec {
    pub fn new(name: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
        }
    }
}

/// Durable metadata of one provisioned container, keyed by the runtime ID.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(rename = "_id")]
    pub id: String,
    pub app_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub image: String,
    pub ip: String,
    pub host_addr: String,
    pub host_port: String,
    /// Container-internal port.
    pub port: String,
    pub status: String,
}

impl Container {
    /// `http://<host_addr>:<host_port>`, computed from the record alone.
    pub fn get_address(&self) -> String {
        format!("http://{}:{}", self.host_addr, self.host_port)
    }

    /// Resolves the host port the runtime mapped for this container's
    /// internal port.
    pub fn mapped_port(&self, info: &ContainerInfo) -> Result<String, AddressError> {
        if self.port.is_empty() {
            return Err(AddressError::NoPortConfigured);
        }
        info.host_port(&self.port)
            .map(str::to_string)
            .ok_or_else(|| AddressError::PortNotMapped(self.port.clone()))
    }
}
