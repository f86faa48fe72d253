//! Macvlan attachments.
//!
//! A macvlan port shares the link layer of a physical parent on the host but
//! lives inside the container namespace. The device is created directly in
//! the target namespace under a temporary name and renamed there, so the
//! requested name never has to be free on the host.

use std::fmt;
use std::str::FromStr;

use unicni_common::{UnicniError, UnicniResult};

use crate::link::{Link, LinkChange, Netlink, NewLink};
use crate::names::random_ifname;
use crate::netns::Netns;

/// Macvlan forwarding mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MacvlanMode {
    /// Ports on the same parent talk to each other directly.
    Bridge,
    /// Ports on the same parent cannot talk to each other.
    Private,
    /// All traffic goes out through the parent (needs a reflective switch).
    #[default]
    Vepa,
    /// A single port takes over the parent.
    Passthru,
}

impl MacvlanMode {
    /// Kernel spelling of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Private => "private",
            Self::Vepa => "vepa",
            Self::Passthru => "passthru",
        }
    }
}

impl FromStr for MacvlanMode {
    type Err = UnicniError;

    /// Parse a mode; the empty string selects the default, `vepa`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::default()),
            "bridge" => Ok(Self::Bridge),
            "private" => Ok(Self::Private),
            "vepa" => Ok(Self::Vepa),
            "passthru" => Ok(Self::Passthru),
            other => Err(UnicniError::InvalidMode {
                mode: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create a macvlan on `host_port` named `container_port` inside `ns`.
///
/// The device comes back up and in promiscuous mode. If any step after
/// creation fails the device is deleted again, under whichever name it has.
///
/// # Errors
///
/// Returns [`UnicniError::InvalidMode`] for an unknown mode, `NotFound` if
/// the parent does not exist, or the first kernel failure.
pub fn create_in_netns<N: Netlink>(
    nl: &N,
    host_port: &str,
    container_port: &str,
    mode: &str,
    mtu: u32,
    ns: &Netns,
) -> UnicniResult<Link> {
    let mode: MacvlanMode = mode.parse()?;
    let parent = nl.link_by_name(&Netns::Current, host_port)?;
    let tmp_name = random_ifname("mvl");

    tracing::debug!(
        parent = host_port,
        name = %tmp_name,
        %mode,
        netns = %ns,
        "Creating macvlan"
    );

    nl.add_link(
        &Netns::Current,
        &NewLink::Macvlan {
            name: tmp_name.clone(),
            parent: parent.index,
            mode,
            mtu,
            netns: ns.clone(),
        },
    )?;

    let tmp = nl.link_by_name(ns, &tmp_name)?;
    match finish(nl, tmp.index, container_port, ns) {
        Ok(link) => {
            tracing::info!(parent = host_port, name = container_port, %mode, netns = %ns, "Macvlan created");
            Ok(link)
        }
        Err(e) => {
            if let Err(del) = nl.delete_link(ns, tmp.index) {
                tracing::warn!(name = %tmp_name, error = %del, "Failed to delete unfinished macvlan");
            }
            Err(e)
        }
    }
}

/// Rename the new device, bring it up and make it promiscuous.
fn finish<N: Netlink>(nl: &N, index: u32, name: &str, ns: &Netns) -> UnicniResult<Link> {
    nl.set_link(ns, index, &LinkChange::Name(name.to_string()))?;
    nl.set_link(ns, index, &LinkChange::Up)?;
    if let Err(e) = nl.set_link(ns, index, &LinkChange::Promisc(true)) {
        tracing::warn!(name, error = %e, "Failed to enable promiscuous mode");
    }
    nl.link_by_name(ns, name)
}
