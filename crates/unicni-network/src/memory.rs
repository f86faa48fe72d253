//! In-memory [`Netlink`] backend.
//!
//! Models the parts of the kernel the plugin depends on: per-namespace name
//! uniqueness, veth peering (deleting one end removes the other), bridge
//! membership, macvlan parents, and the fact that moving a link to another
//! namespace brings it down and detaches it from its bridge. Used for
//! `--dry-run` and by the test suites.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use unicni_common::{UnicniError, UnicniResult};

use crate::addr::Cidr;
use crate::link::{Link, LinkChange, LinkKind, Netlink, NewLink};
use crate::netns::Netns;

#[derive(Debug, Clone)]
struct Entry {
    link: Link,
    netns: Netns,
    peer: Option<u32>,
    addrs: Vec<Cidr>,
}

#[derive(Debug, Default)]
struct State {
    next_index: u32,
    links: BTreeMap<u32, Entry>,
    namespaces: BTreeSet<Netns>,
    failures: HashSet<(String, String)>,
}

impl State {
    fn check_netns(&self, ns: &Netns) -> UnicniResult<()> {
        if ns.is_current() || self.namespaces.contains(ns) {
            Ok(())
        } else {
            Err(UnicniError::Namespace {
                path: ns.to_string(),
                message: "No such file or directory (os error 2)".to_string(),
            })
        }
    }

    fn check_failure(&self, operation: &str, name: &str) -> UnicniResult<()> {
        if self
            .failures
            .contains(&(operation.to_string(), name.to_string()))
        {
            return Err(UnicniError::netlink(operation, name, "injected failure"));
        }
        Ok(())
    }

    fn find(&self, ns: &Netns, name: &str) -> Option<&Entry> {
        self.links
            .values()
            .find(|e| &e.netns == ns && e.link.name == name)
    }

    fn taken(&self, ns: &Netns, name: &str) -> bool {
        self.find(ns, name).is_some()
    }

    fn entry_mut(&mut self, ns: &Netns, index: u32) -> UnicniResult<&mut Entry> {
        self.links
            .get_mut(&index)
            .filter(|e| &e.netns == ns)
            .ok_or_else(|| UnicniError::NotFound {
                name: format!("index {index}"),
            })
    }

    fn insert(&mut self, ns: &Netns, name: &str, kind: LinkKind, mtu: u32) -> u32 {
        self.next_index += 1;
        let index = self.next_index;
        let bytes = index.to_be_bytes();
        let link = Link {
            index,
            name: name.to_string(),
            kind,
            mac: vec![0x02, 0x42, bytes[0], bytes[1], bytes[2], bytes[3]],
            mtu,
            master: None,
            up: false,
            promisc: false,
        };
        self.links.insert(
            index,
            Entry {
                link,
                netns: ns.clone(),
                peer: None,
                addrs: Vec::new(),
            },
        );
        index
    }
}

/// A kernel stand-in kept entirely in process memory.
#[derive(Debug)]
pub struct MemoryNetlink {
    state: RefCell<State>,
}

impl Default for MemoryNetlink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetlink {
    /// Create an empty backend holding only the current namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_index: 1,
                ..State::default()
            }),
        }
    }

    /// Make a namespace path resolvable.
    pub fn add_netns(&self, ns: &Netns) {
        if !ns.is_current() {
            self.state.borrow_mut().namespaces.insert(ns.clone());
        }
    }

    /// Add a physical device (e.g. a macvlan parent) to `ns`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken.
    pub fn add_device(&self, ns: &Netns, name: &str) -> UnicniResult<Link> {
        let mut state = self.state.borrow_mut();
        state.check_netns(ns)?;
        if state.taken(ns, name) {
            return Err(UnicniError::AlreadyExists {
                name: name.to_string(),
            });
        }
        let index = state.insert(ns, name, LinkKind::Other(String::new()), 1500);
        let entry = state.entry_mut(ns, index)?;
        entry.link.up = true;
        Ok(entry.link.clone())
    }

    /// Make every later `operation` on `name` fail.
    ///
    /// `operation` is one of `add`, `lookup`, `move`, `delete`, `address`, or a
    /// change name: `up`, `down`, `promisc`, `mtu`, `master`, `rename`.
    pub fn inject_failure(&self, operation: &str, name: &str) {
        self.state
            .borrow_mut()
            .failures
            .insert((operation.to_string(), name.to_string()));
    }

    /// Addresses assigned to `name` in `ns`.
    #[must_use]
    pub fn addresses(&self, ns: &Netns, name: &str) -> Vec<Cidr> {
        self.state
            .borrow()
            .find(ns, name)
            .map(|e| e.addrs.clone())
            .unwrap_or_default()
    }

    /// Name of the veth peer of `name` in `ns`, with the peer's namespace.
    #[must_use]
    pub fn peer_of(&self, ns: &Netns, name: &str) -> Option<(String, Netns)> {
        let state = self.state.borrow();
        let peer = state.find(ns, name)?.peer?;
        state
            .links
            .get(&peer)
            .map(|e| (e.link.name.clone(), e.netns.clone()))
    }

    /// Total number of links across all namespaces.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.state.borrow().links.len()
    }
}

fn change_name(change: &LinkChange) -> &'static str {
    match change {
        LinkChange::Up => "up",
        LinkChange::Down => "down",
        LinkChange::Promisc(_) => "promisc",
        LinkChange::Mtu(_) => "mtu",
        LinkChange::Master(_) => "master",
        LinkChange::Name(_) => "rename",
    }
}

impl Netlink for MemoryNetlink {
    fn link_by_name(&self, ns: &Netns, name: &str) -> UnicniResult<Link> {
        let state = self.state.borrow();
        state.check_netns(ns)?;
        state.check_failure("lookup", name)?;
        state
            .find(ns, name)
            .map(|e| e.link.clone())
            .ok_or_else(|| UnicniError::NotFound {
                name: name.to_string(),
            })
    }

    fn links(&self, ns: &Netns) -> UnicniResult<Vec<Link>> {
        let state = self.state.borrow();
        state.check_netns(ns)?;
        Ok(state
            .links
            .values()
            .filter(|e| &e.netns == ns)
            .map(|e| e.link.clone())
            .collect())
    }

    fn add_link(&self, ns: &Netns, link: &NewLink) -> UnicniResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_netns(ns)?;
        state.check_failure("add", link.name())?;

        match link {
            NewLink::Bridge { name, mtu } => {
                if state.taken(ns, name) {
                    return Err(UnicniError::AlreadyExists { name: name.clone() });
                }
                state.insert(ns, name, LinkKind::Bridge, *mtu);
            }
            NewLink::Veth { name, peer, mtu } => {
                if name == peer || state.taken(ns, name) || state.taken(ns, peer) {
                    return Err(UnicniError::AlreadyExists { name: name.clone() });
                }
                let a = state.insert(ns, name, LinkKind::Veth, *mtu);
                let b = state.insert(ns, peer, LinkKind::Veth, *mtu);
                state.entry_mut(ns, a)?.peer = Some(b);
                state.entry_mut(ns, b)?.peer = Some(a);
            }
            NewLink::Macvlan {
                name,
                parent,
                mtu,
                netns,
                ..
            } => {
                state.check_netns(netns)?;
                if !state.links.get(parent).is_some_and(|e| &e.netns == ns) {
                    return Err(UnicniError::NotFound {
                        name: format!("index {parent}"),
                    });
                }
                if state.taken(netns, name) {
                    return Err(UnicniError::AlreadyExists { name: name.clone() });
                }
                state.insert(netns, name, LinkKind::Macvlan, *mtu);
            }
        }
        Ok(())
    }

    fn set_link(&self, ns: &Netns, index: u32, change: &LinkChange) -> UnicniResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_netns(ns)?;
        let name = state.entry_mut(ns, index)?.link.name.clone();
        state.check_failure(change_name(change), &name)?;

        match change {
            LinkChange::Up => state.entry_mut(ns, index)?.link.up = true,
            LinkChange::Down => state.entry_mut(ns, index)?.link.up = false,
            LinkChange::Promisc(on) => state.entry_mut(ns, index)?.link.promisc = *on,
            LinkChange::Mtu(mtu) => state.entry_mut(ns, index)?.link.mtu = *mtu,
            LinkChange::Master(master) => {
                let is_bridge = state
                    .entry_mut(ns, *master)
                    .map(|e| e.link.kind == LinkKind::Bridge)?;
                if !is_bridge {
                    return Err(UnicniError::netlink("master", name, "not a bridge"));
                }
                state.entry_mut(ns, index)?.link.master = Some(*master);
            }
            LinkChange::Name(new_name) => {
                if state.taken(ns, new_name) {
                    return Err(UnicniError::AlreadyExists {
                        name: new_name.clone(),
                    });
                }
                let entry = state.entry_mut(ns, index)?;
                if entry.link.up {
                    return Err(UnicniError::netlink(
                        "rename",
                        name,
                        "Device or resource busy (os error 16)",
                    ));
                }
                entry.link.name.clone_from(new_name);
            }
        }
        Ok(())
    }

    fn move_link(&self, ns: &Netns, index: u32, target: &Netns) -> UnicniResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_netns(ns)?;
        state.check_netns(target)?;
        let name = state.entry_mut(ns, index)?.link.name.clone();
        state.check_failure("move", &name)?;
        if state.taken(target, &name) {
            return Err(UnicniError::AlreadyExists { name });
        }

        let entry = state.entry_mut(ns, index)?;
        entry.netns = target.clone();
        entry.link.up = false;
        entry.link.master = None;
        Ok(())
    }

    fn delete_link(&self, ns: &Netns, index: u32) -> UnicniResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_netns(ns)?;
        let name = state.entry_mut(ns, index)?.link.name.clone();
        state.check_failure("delete", &name)?;

        let mut gone = vec![index];
        if let Some(peer) = state.links.get(&index).and_then(|e| e.peer) {
            gone.push(peer);
        }
        for idx in &gone {
            state.links.remove(idx);
        }
        for entry in state.links.values_mut() {
            if entry.link.master.is_some_and(|m| gone.contains(&m)) {
                entry.link.master = None;
            }
        }
        Ok(())
    }

    fn add_address(&self, ns: &Netns, index: u32, addr: &Cidr) -> UnicniResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_netns(ns)?;
        let name = state.entry_mut(ns, index)?.link.name.clone();
        state.check_failure("address", &name)?;

        let entry = state.entry_mut(ns, index)?;
        if entry.addrs.contains(addr) {
            return Err(UnicniError::AlreadyExists {
                name: addr.to_string(),
            });
        }
        entry.addrs.push(*addr);
        Ok(())
    }
}
