//! Virtual ethernet pair management.

use unicni_common::{UnicniError, UnicniResult};

use crate::link::{Link, LinkChange, Netlink, NewLink};
use crate::names::random_ifname;
use crate::netns::Netns;

/// How many random peer names are tried before giving up.
pub const MAX_PEER_NAME_ATTEMPTS: usize = 10;

/// Prefix of generated peer names.
pub const PEER_NAME_PREFIX: &str = "veth";

/// Virtual ethernet pair, both ends as created in the host namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// The end carrying the requested name.
    pub named: Link,
    /// The other end.
    pub peer: Link,
}

/// Create a veth pair `name` <-> `peer` in the current namespace.
///
/// # Errors
///
/// Returns `AlreadyExists` if either name is taken, or the kernel's refusal.
/// A pair that was created but cannot be looked up is deleted again.
pub fn create_pair<N: Netlink>(nl: &N, name: &str, peer: &str, mtu: u32) -> UnicniResult<VethPair> {
    tracing::debug!(name, peer, mtu, "Creating veth pair");

    nl.add_link(
        &Netns::Current,
        &NewLink::Veth {
            name: name.to_string(),
            peer: peer.to_string(),
            mtu,
        },
    )?;

    let pair = nl
        .link_by_name(&Netns::Current, name)
        .and_then(|named| {
            let peer = nl.link_by_name(&Netns::Current, peer)?;
            Ok(VethPair { named, peer })
        });

    if let Err(e) = &pair {
        // Either end takes the other with it.
        let removed = [name, peer].iter().any(|end| delete_link(nl, end).is_ok());
        if !removed {
            tracing::warn!(name, peer, error = %e, "Failed to delete unverified veth pair");
        }
    }
    pair
}

/// Create a veth pair `name` <-> `vethXXXXXXXX` with a random peer name.
///
/// # Errors
///
/// See [`create_pair_with_peer_names`].
pub fn create_pair_with_random_peer<N: Netlink>(
    nl: &N,
    name: &str,
    mtu: u32,
) -> UnicniResult<VethPair> {
    create_pair_with_peer_names(nl, name, mtu, || random_ifname(PEER_NAME_PREFIX))
}

/// Create a veth pair for `name`, drawing peer names from `next_candidate`.
///
/// A candidate that already exists is skipped without touching the kernel.
/// When creation reports a clash the requested name is checked: if it is
/// taken the call fails with [`UnicniError::NameTaken`] straight away,
/// otherwise the candidate lost a race and another one is drawn.
///
/// # Errors
///
/// Returns [`UnicniError::NameTaken`], or [`UnicniError::NoUniqueName`] after
/// [`MAX_PEER_NAME_ATTEMPTS`] candidates, or the kernel's refusal.
pub fn create_pair_with_peer_names<N, F>(
    nl: &N,
    name: &str,
    mtu: u32,
    mut next_candidate: F,
) -> UnicniResult<VethPair>
where
    N: Netlink,
    F: FnMut() -> String,
{
    for attempt in 1..=MAX_PEER_NAME_ATTEMPTS {
        let candidate = next_candidate();

        if candidate == name || exists(nl, &candidate)? {
            tracing::debug!(attempt, candidate = %candidate, "Peer name candidate taken");
            continue;
        }

        match create_pair(nl, name, &candidate, mtu) {
            Ok(pair) => {
                tracing::info!(name, peer = %candidate, "Veth pair created");
                return Ok(pair);
            }
            Err(UnicniError::AlreadyExists { .. }) => {
                if exists(nl, name)? {
                    return Err(UnicniError::NameTaken {
                        name: name.to_string(),
                    });
                }
                tracing::debug!(attempt, candidate = %candidate, "Peer name appeared concurrently, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(UnicniError::NoUniqueName {
        attempts: MAX_PEER_NAME_ATTEMPTS,
    })
}

fn exists<N: Netlink>(nl: &N, name: &str) -> UnicniResult<bool> {
    match nl.link_by_name(&Netns::Current, name) {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Move the host link `name` into `ns` and bring it up there.
///
/// With [`Netns::Current`] the link stays where it is and is only brought up.
/// Returns the link as seen from inside `ns`.
///
/// # Errors
///
/// Returns `NotFound` if the link is missing on either side of the move,
/// a namespace error, or the kernel's refusal.
pub fn join_netns<N: Netlink>(nl: &N, name: &str, ns: &Netns) -> UnicniResult<Link> {
    let link = nl.link_by_name(&Netns::Current, name)?;

    if !ns.is_current() {
        tracing::debug!(interface = name, netns = %ns, "Moving to netns");
        nl.move_link(&Netns::Current, link.index, ns)?;
    }

    let link = nl.link_by_name(ns, name)?;
    nl.set_link(ns, link.index, &LinkChange::Up)?;

    nl.link_by_name(ns, name)
}

/// Delete the host link `name`.
///
/// # Errors
///
/// Returns `NotFound` if it is already gone, so teardown can ignore that.
pub fn delete_link<N: Netlink>(nl: &N, name: &str) -> UnicniResult<()> {
    delete_link_in_netns(nl, name, &Netns::Current)
}

/// Delete the link `name` inside `ns`. Deleting either end of a veth pair
/// removes both.
///
/// # Errors
///
/// Returns `NotFound` if it is already gone, so teardown can ignore that.
pub fn delete_link_in_netns<N: Netlink>(nl: &N, name: &str, ns: &Netns) -> UnicniResult<()> {
    tracing::debug!(name, netns = %ns, "Deleting link");

    let link = nl.link_by_name(ns, name)?;
    nl.delete_link(ns, link.index)?;

    tracing::debug!(name, netns = %ns, "Link deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkKind;
    use crate::memory::MemoryNetlink;

    #[test]
    fn pair_in_current_namespace() {
        let nl = MemoryNetlink::new();
        let pair = create_pair(&nl, "p0", "veth0", 1500).unwrap();
        assert_eq!(pair.named.name, "p0");
        assert_eq!(pair.peer.name, "veth0");
        assert_eq!(pair.named.kind, LinkKind::Veth);
        assert_eq!(pair.named.mtu, 1500);
    }

    #[test]
    fn unverified_pair_is_removed() {
        let nl = MemoryNetlink::new();
        nl.inject_failure("lookup", "p0");

        let err = create_pair(&nl, "p0", "veth0", 1500).unwrap_err();

        assert!(matches!(err, UnicniError::Netlink { .. }));
        assert_eq!(nl.link_count(), 0);
    }

    #[test]
    fn random_peer() {
        let nl = MemoryNetlink::new();
        let pair = create_pair_with_random_peer(&nl, "p0", 1500).unwrap();
        assert!(pair.peer.name.starts_with(PEER_NAME_PREFIX));
        assert_eq!(pair.peer.name.len(), 12);
        assert_eq!(
            nl.peer_of(&Netns::Current, "p0").map(|(n, _)| n),
            Some(pair.peer.name)
        );
    }

    #[test]
    fn colliding_candidates_are_skipped() {
        let nl = MemoryNetlink::new();
        nl.add_device(&Netns::Current, "vethtaken1").unwrap();
        nl.add_device(&Netns::Current, "vethtaken2").unwrap();

        let mut names = ["vethtaken1", "vethtaken2", "vethfree"].into_iter();
        let pair =
            create_pair_with_peer_names(&nl, "p0", 1500, || names.next().unwrap().to_string())
                .unwrap();
        assert_eq!(pair.peer.name, "vethfree");
    }

    #[test]
    fn retry_budget_is_bounded() {
        let nl = MemoryNetlink::new();
        for i in 0..MAX_PEER_NAME_ATTEMPTS {
            nl.add_device(&Netns::Current, &format!("vethc{i}")).unwrap();
        }
        let before = nl.link_count();

        let mut drawn = 0;
        let err = create_pair_with_peer_names(&nl, "p0", 1500, || {
            let name = format!("vethc{drawn}");
            drawn += 1;
            name
        })
        .unwrap_err();

        assert!(matches!(err, UnicniError::NoUniqueName { attempts: 10 }));
        assert_eq!(drawn, MAX_PEER_NAME_ATTEMPTS);
        assert_eq!(nl.link_count(), before);
        assert!(nl.link_by_name(&Netns::Current, "p0").unwrap_err().is_not_found());
    }

    #[test]
    fn taken_name_is_not_retried() {
        let nl = MemoryNetlink::new();
        nl.add_device(&Netns::Current, "p0").unwrap();

        let mut drawn = 0;
        let err = create_pair_with_peer_names(&nl, "p0", 1500, || {
            drawn += 1;
            format!("vethn{drawn}")
        })
        .unwrap_err();

        assert!(matches!(err, UnicniError::NameTaken { .. }));
        assert_eq!(drawn, 1);
    }

    #[test]
    fn join_moves_and_brings_up() {
        let nl = MemoryNetlink::new();
        let ns = Netns::new("/var/run/ns/test");
        nl.add_netns(&ns);
        create_pair(&nl, "p0", "veth0", 1500).unwrap();

        let link = join_netns(&nl, "p0", &ns).unwrap();

        assert!(link.up);
        assert!(nl.link_by_name(&ns, "p0").is_ok());
        assert!(nl.link_by_name(&Netns::Current, "p0").unwrap_err().is_not_found());
    }

    #[test]
    fn join_current_only_brings_up() {
        let nl = MemoryNetlink::new();
        create_pair(&nl, "p0", "veth0", 1500).unwrap();
        let link = join_netns(&nl, "p0", &Netns::Current).unwrap();
        assert!(link.up);
    }

    #[test]
    fn join_missing_link() {
        let nl = MemoryNetlink::new();
        assert!(join_netns(&nl, "p0", &Netns::Current).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_reports_not_found() {
        let nl = MemoryNetlink::new();
        let ns = Netns::new("/var/run/ns/test");
        nl.add_netns(&ns);
        create_pair(&nl, "p0", "veth0", 1500).unwrap();
        join_netns(&nl, "p0", &ns).unwrap();

        delete_link_in_netns(&nl, "p0", &ns).unwrap();
        assert_eq!(nl.link_count(), 0);
        assert!(delete_link_in_netns(&nl, "p0", &ns).unwrap_err().is_not_found());
        assert!(delete_link(&nl, "veth0").unwrap_err().is_not_found());
    }
}
