//! Kernel link model and the [`Netlink`] backend trait.
//!
//! Every operation names the namespace it acts in. Backends are free to
//! implement that with a namespace switch (see [`crate::rtnl`]) or by keying
//! their own state on it (see [`crate::memory`]); callers never rely on an
//! ambient "current namespace".

use std::fmt;

use serde::Serialize;
use unicni_common::UnicniResult;

use crate::addr::Cidr;
use crate::macvlan::MacvlanMode;
use crate::netns::Netns;

/// Kind of a link as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// Linux bridge.
    Bridge,
    /// One end of a veth pair.
    Veth,
    /// Macvlan device.
    Macvlan,
    /// Physical devices and anything else.
    Other(String),
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Veth => write!(f, "veth"),
            Self::Macvlan => write!(f, "macvlan"),
            Self::Other(kind) if kind.is_empty() => write!(f, "device"),
            Self::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// Live attributes of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface index, unique within its namespace.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Device kind.
    pub kind: LinkKind,
    /// Hardware address bytes (empty when the device has none).
    pub mac: Vec<u8>,
    /// MTU.
    pub mtu: u32,
    /// Index of the bridge this link is enslaved to.
    pub master: Option<u32>,
    /// Administratively up.
    pub up: bool,
    /// Promiscuous mode enabled.
    pub promisc: bool,
}

impl Link {
    /// Hardware address in `aa:bb:cc:dd:ee:ff` form.
    #[must_use]
    pub fn mac_string(&self) -> String {
        format_mac(&self.mac)
    }
}

/// Format hardware address bytes as colon-separated hex.
#[must_use]
pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// A link to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewLink {
    /// A bridge device.
    Bridge {
        /// Bridge name.
        name: String,
        /// MTU.
        mtu: u32,
    },
    /// A veth pair; both ends are created in the same namespace.
    Veth {
        /// Name of the first end.
        name: String,
        /// Name of the peer end.
        peer: String,
        /// MTU of both ends.
        mtu: u32,
    },
    /// A macvlan device whose parent lives in the namespace of the call.
    Macvlan {
        /// Device name.
        name: String,
        /// Parent interface index.
        parent: u32,
        /// Forwarding mode.
        mode: MacvlanMode,
        /// MTU.
        mtu: u32,
        /// Namespace the device is created in.
        netns: Netns,
    },
}

impl NewLink {
    /// Name of the (first) device being created.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Bridge { name, .. } | Self::Veth { name, .. } | Self::Macvlan { name, .. } => {
                name
            }
        }
    }
}

/// A single attribute change applied to an existing link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    /// Bring the link up.
    Up,
    /// Bring the link down.
    Down,
    /// Enable or disable promiscuous mode.
    Promisc(bool),
    /// Set the MTU.
    Mtu(u32),
    /// Enslave the link to the bridge with this index.
    Master(u32),
    /// Rename the link.
    Name(String),
}

/// Kernel link operations.
///
/// Creation reports a name clash as [`unicni_common::UnicniError::AlreadyExists`]
/// and lookups report absence as [`unicni_common::UnicniError::NotFound`];
/// callers build their idempotent behavior on those two conditions.
pub trait Netlink {
    /// Look a link up by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no link has that name in `ns`.
    fn link_by_name(&self, ns: &Netns, name: &str) -> UnicniResult<Link>;

    /// List every link in `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or the kernel cannot be queried.
    fn links(&self, ns: &Netns) -> UnicniResult<Vec<Link>>;

    /// Create a link in `ns`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on a name clash.
    fn add_link(&self, ns: &Netns, link: &NewLink) -> UnicniResult<()>;

    /// Apply one change to the link with `index` in `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is gone or the kernel refuses the change.
    fn set_link(&self, ns: &Netns, index: u32, change: &LinkChange) -> UnicniResult<()>;

    /// Move the link with `index` from `ns` into `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be opened or already has a link
    /// with the same name.
    fn move_link(&self, ns: &Netns, index: u32, target: &Netns) -> UnicniResult<()>;

    /// Delete the link with `index` in `ns`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the link is already gone.
    fn delete_link(&self, ns: &Netns, index: u32) -> UnicniResult<()>;

    /// Add an address to the link with `index` in `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the address.
    fn add_address(&self, ns: &Netns, index: u32, addr: &Cidr) -> UnicniResult<()>;

    /// Names of the links enslaved to `bridge` in `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the links cannot be listed.
    fn bridge_ports(&self, ns: &Netns, bridge: &Link) -> UnicniResult<Vec<String>> {
        Ok(self
            .links(ns)?
            .into_iter()
            .filter(|l| l.master == Some(bridge.index))
            .map(|l| l.name)
            .collect())
    }
}

/// One realized interface, as reported back to the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    /// Interface name.
    pub name: String,
    /// Hardware address.
    pub mac: String,
    /// Namespace path; absent for host interfaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

impl InterfaceDescriptor {
    /// Describe `link` as living in `ns`.
    #[must_use]
    pub fn new(link: &Link, ns: &Netns) -> Self {
        Self {
            name: link.name.clone(),
            mac: link.mac_string(),
            sandbox: ns.sandbox(),
        }
    }
}
