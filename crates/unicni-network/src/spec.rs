//! Topology specification parsing.
//!
//! The document comes from a pod annotation, e.g.
//!
//! ```json
//! {
//!   "credential": "c1",
//!   "group": "g1",
//!   "deviceid": "d7",
//!   "system_channels": {"ctrl": "p0", "data": "p1"},
//!   "external_ports": [
//!     {"host_port": "eth0", "container_port": "net1", "type": "macvlan",
//!      "mode": "bridge", "ipaddr": "10.0.0.5/24"}
//!   ]
//! }
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use unicni_common::{UnicniError, UnicniResult};

use crate::names;

/// How an external port is realized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortKind {
    /// A dedicated host bridge joined to the container by a veth pair.
    Bridge,
    /// A macvlan on a host interface.
    Macvlan {
        /// Parent interface on the host.
        host_port: String,
        /// Macvlan mode; empty selects the default.
        mode: String,
    },
}

/// One external port of the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPortSpec {
    /// Interface name inside the container.
    pub container_port: String,
    /// Address to assign once the port exists.
    pub ip_addr: Option<String>,
    /// How the port is realized.
    pub kind: PortKind,
}

impl ExternalPortSpec {
    /// Whether this port uses a dedicated bridge.
    #[must_use]
    pub const fn is_bridge(&self) -> bool {
        matches!(self.kind, PortKind::Bridge)
    }
}

/// The validated attachment request for one container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTopology")]
pub struct TopologySpec {
    /// Tenant credential; prefix of every derived name.
    pub credential: String,
    /// Group within the credential.
    pub group: String,
    /// Device identifier used in external bridge names; may be empty.
    pub device_id: String,
    /// Channel type to container port name. Iterated in key order.
    pub system_channels: BTreeMap<String, String>,
    /// External ports, realized in list order.
    pub external_ports: Vec<ExternalPortSpec>,
}

impl TopologySpec {
    /// Parse and validate a topology document.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Serialization`] for malformed JSON and
    /// [`UnicniError::MissingRequiredField`] for missing required keys.
    pub fn from_json(data: &str) -> UnicniResult<Self> {
        let raw: RawTopology = serde_json::from_str(data)?;
        Self::try_from(raw)
    }

    /// Bridge name for a system channel.
    #[must_use]
    pub fn channel_bridge_name(&self, channel: &str) -> String {
        names::channel_bridge_name(&self.credential, &self.group, channel)
    }

    /// Bridge name for a bridge-mode external port.
    #[must_use]
    pub fn external_bridge_name(&self, port: &ExternalPortSpec) -> String {
        names::external_bridge_name(
            &self.credential,
            &self.group,
            &self.device_id,
            &port.container_port,
        )
    }
}

#[derive(Debug, Deserialize)]
struct RawTopology {
    #[serde(default)]
    credential: String,
    #[serde(default)]
    group: String,
    #[serde(default, rename = "deviceid")]
    device_id: String,
    #[serde(default)]
    system_channels: Option<BTreeMap<String, String>>,
    #[serde(default, alias = "external_port")]
    external_ports: Vec<RawExternalPort>,
    // Older annotations name exactly two channels.
    #[serde(default)]
    control_port: Option<String>,
    #[serde(default)]
    data_port: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawExternalPort {
    #[serde(default)]
    host_port: String,
    #[serde(default)]
    container_port: String,
    #[serde(default, rename = "type")]
    port_type: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    ipaddr: String,
}

fn required(field: &str, value: &str) -> UnicniResult<()> {
    if value.is_empty() {
        return Err(UnicniError::MissingRequiredField {
            field: field.to_string(),
        });
    }
    Ok(())
}

impl TryFrom<RawTopology> for TopologySpec {
    type Error = UnicniError;

    fn try_from(raw: RawTopology) -> Result<Self, Self::Error> {
        required("credential", &raw.credential)?;
        required("group", &raw.group)?;

        let system_channels = raw.system_channels.unwrap_or_else(|| {
            let mut legacy = BTreeMap::new();
            if let Some(port) = raw.control_port.filter(|p| !p.is_empty()) {
                legacy.insert("ctrl".to_string(), port);
            }
            if let Some(port) = raw.data_port.filter(|p| !p.is_empty()) {
                legacy.insert("data".to_string(), port);
            }
            legacy
        });
        for (channel, port) in &system_channels {
            required(&format!("system_channels.{channel}"), port)?;
            names::check_ifname(port)?;
        }

        let external_ports = raw
            .external_ports
            .into_iter()
            .enumerate()
            .map(|(i, port)| {
                required(&format!("external_ports[{i}].container_port"), &port.container_port)?;
                names::check_ifname(&port.container_port)?;
                let kind = if port.port_type == "macvlan" {
                    required(&format!("external_ports[{i}].host_port"), &port.host_port)?;
                    names::check_ifname(&port.host_port)?;
                    PortKind::Macvlan {
                        host_port: port.host_port,
                        mode: port.mode,
                    }
                } else {
                    PortKind::Bridge
                };
                Ok(ExternalPortSpec {
                    container_port: port.container_port,
                    ip_addr: Some(port.ipaddr).filter(|a| !a.is_empty()),
                    kind,
                })
            })
            .collect::<UnicniResult<Vec<_>>>()?;

        Ok(Self {
            credential: raw.credential,
            group: raw.group,
            device_id: raw.device_id,
            system_channels,
            external_ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_document() {
        let spec = TopologySpec::from_json(
            r#"{
                "credential": "c1", "group": "g1", "deviceid": "d7",
                "system_channels": {"data": "p1", "ctrl": "p0"},
                "external_ports": [
                    {"host_port": "eth0", "container_port": "net1", "type": "macvlan",
                     "mode": "bridge", "ipaddr": "10.0.0.5/24"},
                    {"container_port": "net2"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.device_id, "d7");
        let channels: Vec<_> = spec.system_channels.keys().cloned().collect();
        assert_eq!(channels, vec!["ctrl", "data"]);
        assert_eq!(spec.channel_bridge_name("ctrl"), "c1-g1-ctrl");

        let macvlan = &spec.external_ports[0];
        assert_eq!(
            macvlan.kind,
            PortKind::Macvlan {
                host_port: "eth0".into(),
                mode: "bridge".into()
            }
        );
        assert_eq!(macvlan.ip_addr.as_deref(), Some("10.0.0.5/24"));

        let bridged = &spec.external_ports[1];
        assert!(bridged.is_bridge());
        assert_eq!(bridged.ip_addr, None);
        assert_eq!(spec.external_bridge_name(bridged), "c1g1d7net2");
    }

    #[test]
    fn missing_credential_or_group() {
        for doc in [r#"{"group":"g1"}"#, r#"{"credential":"c1","group":""}"#] {
            assert!(matches!(
                TopologySpec::from_json(doc),
                Err(UnicniError::MissingRequiredField { .. })
            ));
        }
    }

    #[test]
    fn container_port_is_required() {
        let err = TopologySpec::from_json(
            r#"{"credential":"c1","group":"g1","external_ports":[{"host_port":"eth0"}]}"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, UnicniError::MissingRequiredField { ref field } if field == "external_ports[0].container_port")
        );
    }

    #[test]
    fn macvlan_needs_host_port() {
        let err = TopologySpec::from_json(
            r#"{"credential":"c1","group":"g1",
                "external_ports":[{"container_port":"net1","type":"macvlan"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, UnicniError::MissingRequiredField { .. }));
    }

    #[test]
    fn port_names_must_be_interface_names() {
        let err = TopologySpec::from_json(
            r#"{"credential":"c1","group":"g1",
                "external_ports":[{"container_port":"net1-far-too-long"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, UnicniError::TooLong { ref name, .. } if name == "net1-far-too-long"));

        let err = TopologySpec::from_json(
            r#"{"credential":"c1","group":"g1","system_channels":{"ctrl":"p/0"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, UnicniError::InvalidName { .. }));
    }

    #[test]
    fn unknown_type_means_bridge() {
        let spec = TopologySpec::from_json(
            r#"{"credential":"c1","group":"g1",
                "external_ports":[{"container_port":"net1","type":"vxlan"}]}"#,
        )
        .unwrap();
        assert!(spec.external_ports[0].is_bridge());
    }

    #[test]
    fn legacy_control_and_data_ports() {
        let spec = TopologySpec::from_json(
            r#"{"credential":"c1","group":"g1","control_port":"dc0","data_port":"ddc0",
                "external_port":[{"container_port":"net1"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.system_channels.get("ctrl").map(String::as_str), Some("dc0"));
        assert_eq!(spec.system_channels.get("data").map(String::as_str), Some("ddc0"));
        assert_eq!(spec.external_ports.len(), 1);
    }

    #[test]
    fn deserialize_through_serde() {
        let spec: TopologySpec =
            serde_json::from_str(r#"{"credential":"c1","group":"g1"}"#).unwrap();
        assert!(spec.system_channels.is_empty());
        assert!(spec.external_ports.is_empty());
    }
}
