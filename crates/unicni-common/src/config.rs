//! Plugin configuration.
//!
//! The container runtime hands the plugin its network configuration as JSON
//! on stdin. Besides the standard CNI keys (`cniVersion`, `name`, `type`) the
//! plugin reads a handful of keys of its own; every one of them has a default
//! so a bare `{"cniVersion": "1.0.0", "name": "union", "type": "unicni"}` is a
//! valid configuration.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{UnicniError, UnicniResult};

/// Default MTU for topology bridges.
pub const DEFAULT_BRIDGE_MTU: u32 = 1400;

/// Default MTU for veth pairs.
pub const DEFAULT_VETH_MTU: u32 = 1500;

/// Default MTU for macvlan devices.
pub const DEFAULT_MACVLAN_MTU: u32 = 1500;

/// Pod annotation carrying the topology document.
pub const DEFAULT_ANNOTATION_KEY: &str = "network_info";

/// API server override taken from the environment.
pub static API_SERVER_OVERRIDE: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("UNICNI_API_SERVER").ok());

/// Network configuration passed on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    /// CNI specification version of the configuration.
    #[serde(default = "default_cni_version")]
    pub cni_version: String,

    /// Network name.
    #[serde(default)]
    pub name: String,

    /// Plugin type.
    #[serde(default, rename = "type")]
    pub plugin_type: String,

    /// Where pod annotations are fetched from.
    #[serde(default)]
    pub api_server: ApiServer,

    /// Annotation holding the topology document.
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,

    /// MTU applied to topology bridges.
    #[serde(default = "default_bridge_mtu")]
    pub bridge_mtu: u32,

    /// MTU applied to veth pairs.
    #[serde(default = "default_veth_mtu")]
    pub veth_mtu: u32,

    /// MTU applied to macvlan devices.
    #[serde(default = "default_macvlan_mtu")]
    pub macvlan_mtu: u32,

    /// Put topology bridges into promiscuous mode.
    #[serde(default = "default_true")]
    pub promisc_bridge: bool,

    /// Undo partially built topologies when ADD fails.
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,

    /// Log filter directive (overridden by `UNICNI_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_cni_version() -> String {
    "1.0.0".to_string()
}

fn default_annotation_key() -> String {
    DEFAULT_ANNOTATION_KEY.to_string()
}

const fn default_bridge_mtu() -> u32 {
    DEFAULT_BRIDGE_MTU
}

const fn default_veth_mtu() -> u32 {
    DEFAULT_VETH_MTU
}

const fn default_macvlan_mtu() -> u32 {
    DEFAULT_MACVLAN_MTU
}

const fn default_true() -> bool {
    true
}

impl Default for NetConf {
    fn default() -> Self {
        Self {
            cni_version: default_cni_version(),
            name: String::new(),
            plugin_type: String::new(),
            api_server: ApiServer::default(),
            annotation_key: default_annotation_key(),
            bridge_mtu: DEFAULT_BRIDGE_MTU,
            veth_mtu: DEFAULT_VETH_MTU,
            macvlan_mtu: DEFAULT_MACVLAN_MTU,
            promisc_bridge: true,
            rollback_on_failure: true,
            log_level: None,
        }
    }
}

impl NetConf {
    /// Parse the configuration from raw stdin bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid configuration object or
    /// an MTU is zero.
    pub fn from_slice(data: &[u8]) -> UnicniResult<Self> {
        let conf: Self = serde_json::from_slice(data)?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> UnicniResult<()> {
        for (key, mtu) in [
            ("bridgeMtu", self.bridge_mtu),
            ("vethMtu", self.veth_mtu),
            ("macvlanMtu", self.macvlan_mtu),
        ] {
            if mtu == 0 {
                return Err(UnicniError::Config {
                    message: format!("{key} must be greater than zero"),
                });
            }
        }
        Ok(())
    }

    /// Base URL of the API server, honouring `UNICNI_API_SERVER`.
    #[must_use]
    pub fn api_base_url(&self) -> String {
        API_SERVER_OVERRIDE
            .clone()
            .unwrap_or_else(|| self.api_server.base_url())
    }
}

/// API server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiServer {
    /// Host name or address.
    #[serde(default = "default_api_host")]
    pub host: String,
    /// TCP port.
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_api_port() -> u16 {
    8080
}

impl Default for ApiServer {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl ApiServer {
    /// Plain HTTP base URL, e.g. `http://127.0.0.1:8080`.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
