//! Linux bridge management.
//!
//! Bridges live in the host namespace and are shared by name: two events for
//! the same group may race to create one, so creation treats "already
//! exists" as success and verifies what it found instead.

use unicni_common::{UnicniError, UnicniResult};

use crate::link::{Link, LinkChange, LinkKind, Netlink, NewLink};
use crate::netns::Netns;

/// A bridge device in the host namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    link: Link,
}

impl Bridge {
    /// Create the bridge if absent, then apply `mtu`, promiscuous mode and
    /// bring it up. Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::WrongDeviceType`] if `name` exists but is not a
    /// bridge, or the kernel's refusal of any step other than promiscuous mode.
    pub fn ensure<N: Netlink>(nl: &N, name: &str, mtu: u32, promisc: bool) -> UnicniResult<Self> {
        tracing::debug!(name, mtu, promisc, "Ensuring bridge");

        match nl.add_link(
            &Netns::Current,
            &NewLink::Bridge {
                name: name.to_string(),
                mtu,
            },
        ) {
            Ok(()) => tracing::debug!(name, "Bridge added"),
            Err(UnicniError::AlreadyExists { .. }) => {
                tracing::debug!(name, "Bridge already exists, verifying");
            }
            Err(e) => return Err(e),
        }

        let bridge = Self::get(nl, name)?;
        let index = bridge.index();

        if bridge.link.mtu != mtu {
            nl.set_link(&Netns::Current, index, &LinkChange::Mtu(mtu))?;
        }
        if promisc {
            if let Err(e) = nl.set_link(&Netns::Current, index, &LinkChange::Promisc(true)) {
                tracing::warn!(name, error = %e, "Failed to set bridge promiscuous mode");
            }
        }
        nl.set_link(&Netns::Current, index, &LinkChange::Up)?;

        let bridge = Self::get(nl, name)?;
        tracing::info!(name, mac = %bridge.link.mac_string(), "Bridge ready");
        Ok(bridge)
    }

    /// Look up an existing bridge.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent or [`UnicniError::WrongDeviceType`] if
    /// the device is not a bridge.
    pub fn get<N: Netlink>(nl: &N, name: &str) -> UnicniResult<Self> {
        let link = nl.link_by_name(&Netns::Current, name)?;
        if link.kind != LinkKind::Bridge {
            return Err(UnicniError::WrongDeviceType {
                name: name.to_string(),
                expected: LinkKind::Bridge.to_string(),
                actual: link.kind.to_string(),
            });
        }
        Ok(Self { link })
    }

    /// Bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Interface index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.link.index
    }

    /// Hardware address in `aa:bb:cc:dd:ee:ff` form.
    #[must_use]
    pub fn mac(&self) -> String {
        self.link.mac_string()
    }

    /// Live link attributes as of the last lookup.
    #[must_use]
    pub const fn link(&self) -> &Link {
        &self.link
    }

    /// Enslave `link` to this bridge and bring it up.
    ///
    /// # Errors
    ///
    /// Returns the kernel's refusal of either step.
    pub fn add_interface<N: Netlink>(&self, nl: &N, link: &Link) -> UnicniResult<()> {
        tracing::debug!(bridge = %self.name(), interface = %link.name, "Adding interface to bridge");

        nl.set_link(&Netns::Current, link.index, &LinkChange::Master(self.index()))?;
        nl.set_link(&Netns::Current, link.index, &LinkChange::Up)?;

        tracing::debug!(bridge = %self.name(), interface = %link.name, "Interface added successfully");
        Ok(())
    }

    /// Names of the interfaces currently enslaved to this bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the host links cannot be listed.
    pub fn ports<N: Netlink>(&self, nl: &N) -> UnicniResult<Vec<String>> {
        nl.bridge_ports(&Netns::Current, &self.link)
    }
}

/// Bring the bridge down and delete it.
///
/// # Errors
///
/// Returns `NotFound` if there is no such device.
pub fn delete_bridge<N: Netlink>(nl: &N, name: &str) -> UnicniResult<()> {
    tracing::debug!(name, "Deleting bridge");

    let link = nl.link_by_name(&Netns::Current, name)?;
    nl.set_link(&Netns::Current, link.index, &LinkChange::Down)?;
    nl.delete_link(&Netns::Current, link.index)?;

    tracing::info!(name, "Bridge deleted");
    Ok(())
}

/// Delete the bridge only if no interface is attached to it.
///
/// Returns whether the bridge was deleted; a bridge with ports is left alone
/// and that is not an error.
///
/// # Errors
///
/// Returns `NotFound` if the bridge is absent, or a deletion failure.
pub fn delete_if_empty<N: Netlink>(nl: &N, name: &str) -> UnicniResult<bool> {
    let bridge = Bridge::get(nl, name)?;
    let ports = bridge.ports(nl)?;
    if !ports.is_empty() {
        tracing::debug!(name, ?ports, "Bridge still has ports, keeping it");
        return Ok(false);
    }
    delete_bridge(nl, name)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetlink;

    #[test]
    fn ensure_is_idempotent() {
        let nl = MemoryNetlink::new();

        let first = Bridge::ensure(&nl, "c1-g1-ctrl", 1400, true).unwrap();
        let second = Bridge::ensure(&nl, "c1-g1-ctrl", 1400, true).unwrap();

        assert_eq!(first.name(), "c1-g1-ctrl");
        assert_eq!(first.name(), second.name());
        assert_eq!(first.index(), second.index());
        assert!(second.link().up);
        assert!(second.link().promisc);
        assert_eq!(nl.link_count(), 1);
    }

    #[test]
    fn ensure_reapplies_mtu() {
        let nl = MemoryNetlink::new();
        Bridge::ensure(&nl, "br0", 1500, false).unwrap();
        let bridge = Bridge::ensure(&nl, "br0", 1400, false).unwrap();
        assert_eq!(bridge.link().mtu, 1400);
        assert!(!bridge.link().promisc);
    }

    #[test]
    fn ensure_rejects_other_device_kinds() {
        let nl = MemoryNetlink::new();
        nl.add_device(&Netns::Current, "eth0").unwrap();

        let err = Bridge::ensure(&nl, "eth0", 1400, true).unwrap_err();
        assert!(matches!(err, UnicniError::WrongDeviceType { .. }));
    }

    #[test]
    fn ensure_surfaces_create_failures() {
        let nl = MemoryNetlink::new();
        nl.inject_failure("add", "br0");
        assert!(matches!(
            Bridge::ensure(&nl, "br0", 1400, true),
            Err(UnicniError::Netlink { .. })
        ));
    }

    #[test]
    fn promisc_failure_is_a_warning() {
        let nl = MemoryNetlink::new();
        nl.inject_failure("promisc", "br0");
        let bridge = Bridge::ensure(&nl, "br0", 1400, true).unwrap();
        assert!(bridge.link().up);
    }

    #[test]
    fn attach_sets_master_and_up() {
        let nl = MemoryNetlink::new();
        let bridge = Bridge::ensure(&nl, "br0", 1400, true).unwrap();
        let dev = nl.add_device(&Netns::Current, "eth1").unwrap();
        nl.set_link(&Netns::Current, dev.index, &LinkChange::Down).unwrap();

        bridge.add_interface(&nl, &dev).unwrap();

        let dev = nl.link_by_name(&Netns::Current, "eth1").unwrap();
        assert_eq!(dev.master, Some(bridge.index()));
        assert!(dev.up);
        assert_eq!(bridge.ports(&nl).unwrap(), vec!["eth1".to_string()]);
    }

    #[test]
    fn delete_missing_bridge_is_not_found() {
        let nl = MemoryNetlink::new();
        assert!(delete_bridge(&nl, "br0").unwrap_err().is_not_found());
        assert!(delete_if_empty(&nl, "br0").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_if_empty_removes_empty_bridge() {
        let nl = MemoryNetlink::new();
        Bridge::ensure(&nl, "br0", 1400, true).unwrap();

        assert!(delete_if_empty(&nl, "br0").unwrap());
        assert_eq!(nl.link_count(), 0);
    }

    #[test]
    fn delete_if_empty_keeps_busy_bridge() {
        let nl = MemoryNetlink::new();
        let bridge = Bridge::ensure(&nl, "br0", 1400, true).unwrap();
        let dev = nl.add_device(&Netns::Current, "eth1").unwrap();
        bridge.add_interface(&nl, &dev).unwrap();

        assert!(!delete_if_empty(&nl, "br0").unwrap());
        assert!(Bridge::get(&nl, "br0").is_ok());
    }
}
