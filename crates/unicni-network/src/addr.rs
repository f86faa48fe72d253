//! Address assignment.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use unicni_common::{UnicniError, UnicniResult};

use crate::link::Netlink;
use crate::netns::Netns;

/// An address with its prefix length, e.g. `10.0.0.5/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    /// Interface address.
    pub addr: IpAddr,
    /// Prefix length.
    pub prefix_len: u8,
}

impl FromStr for Cidr {
    type Err = UnicniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UnicniError::InvalidAddress {
            address: s.to_string(),
        };

        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(invalid());
        }

        Ok(Self { addr, prefix_len })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Assign `cidr` to `link_name` inside `ns`.
///
/// Existing addresses on the link are left alone.
///
/// # Errors
///
/// Returns [`UnicniError::InvalidAddress`] for a malformed address,
/// `NotFound` if the link does not exist in `ns`, or the kernel's refusal.
pub fn add_address<N: Netlink>(nl: &N, link_name: &str, cidr: &str, ns: &Netns) -> UnicniResult<()> {
    let cidr: Cidr = cidr.parse()?;
    let link = nl.link_by_name(ns, link_name)?;

    nl.add_address(ns, link.index, &cidr)?;

    tracing::info!(link = link_name, address = %cidr, netns = %ns, "Address assigned");
    Ok(())
}
