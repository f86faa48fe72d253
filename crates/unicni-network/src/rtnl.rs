//! Kernel [`Netlink`] backend over rtnetlink.
//!
//! Each operation opens a fresh route socket inside the namespace it targets
//! and drives it on a current-thread runtime, so the socket, the namespace
//! switch and the request all stay on the calling thread.

use std::future::Future;
use std::os::fd::AsRawFd;

use futures::TryStreamExt;
use netlink_packet_route::link::{
    InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage, MacVlanMode,
};
use rtnetlink::{Handle, LinkBridge, LinkMacVlan, LinkUnspec, LinkVeth};
use tokio::runtime::Runtime;
use unicni_common::{UnicniError, UnicniResult};

use crate::addr::Cidr;
use crate::link::{Link, LinkChange, LinkKind, Netlink, NewLink};
use crate::macvlan::MacvlanMode;
use crate::netns::{Netns, with_netns};

/// Netlink backend that talks to the running kernel.
#[derive(Debug)]
pub struct RtNetlink {
    runtime: Runtime,
}

impl RtNetlink {
    /// Create the backend.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the runtime cannot be built.
    #[cfg(target_os = "linux")]
    pub fn new() -> UnicniResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Netlink is Linux-only.
    ///
    /// # Errors
    ///
    /// Always returns [`UnicniError::Unsupported`].
    #[cfg(not(target_os = "linux"))]
    pub fn new() -> UnicniResult<Self> {
        Err(UnicniError::Unsupported {
            feature: "rtnetlink".to_string(),
        })
    }

    fn run<T, F, Fut>(&self, ns: &Netns, op: F) -> UnicniResult<T>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = UnicniResult<T>>,
    {
        with_netns(ns, || {
            self.runtime.block_on(async {
                let (connection, handle, _) = rtnetlink::new_connection()
                    .map_err(|e| UnicniError::netlink("connect", ns.to_string(), e))?;
                tokio::spawn(connection);
                op(handle).await
            })
        })
    }
}

fn map_err(operation: &str, name: &str, err: rtnetlink::Error) -> UnicniError {
    if let rtnetlink::Error::NetlinkError(msg) = &err {
        let code = -msg.raw_code();
        if code == libc::EEXIST {
            return UnicniError::AlreadyExists {
                name: name.to_string(),
            };
        }
        if code == libc::ENODEV {
            return UnicniError::NotFound {
                name: name.to_string(),
            };
        }
    }
    UnicniError::netlink(operation, name, err)
}

const fn kernel_mode(mode: MacvlanMode) -> MacVlanMode {
    match mode {
        MacvlanMode::Bridge => MacVlanMode::Bridge,
        MacvlanMode::Private => MacVlanMode::Private,
        MacvlanMode::Vepa => MacVlanMode::Vepa,
        MacvlanMode::Passthru => MacVlanMode::Passthrough,
    }
}

fn to_link(msg: LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        kind: LinkKind::Other(String::new()),
        mac: Vec::new(),
        mtu: 0,
        master: None,
        up: msg.header.flags.contains(LinkFlags::Up),
        promisc: msg.header.flags.contains(LinkFlags::Promisc),
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Address(mac) => link.mac = mac,
            LinkAttribute::Mtu(mtu) => link.mtu = mtu,
            LinkAttribute::Controller(master) => link.master = Some(master),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        link.kind = match kind {
                            InfoKind::Bridge => LinkKind::Bridge,
                            InfoKind::Veth => LinkKind::Veth,
                            InfoKind::MacVlan => LinkKind::Macvlan,
                            other => LinkKind::Other(other.to_string()),
                        };
                    }
                }
            }
            _ => {}
        }
    }
    link
}

impl Netlink for RtNetlink {
    fn link_by_name(&self, ns: &Netns, name: &str) -> UnicniResult<Link> {
        self.run(ns, |handle| async move {
            let mut links = handle.link().get().match_name(name.to_string()).execute();
            links
                .try_next()
                .await
                .map_err(|e| map_err("get", name, e))?
                .map(to_link)
                .ok_or_else(|| UnicniError::NotFound {
                    name: name.to_string(),
                })
        })
    }

    fn links(&self, ns: &Netns) -> UnicniResult<Vec<Link>> {
        self.run(ns, |handle| async move {
            let mut stream = handle.link().get().execute();
            let mut links = Vec::new();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| map_err("dump", &ns.to_string(), e))?
            {
                links.push(to_link(msg));
            }
            Ok(links)
        })
    }

    fn add_link(&self, ns: &Netns, link: &NewLink) -> UnicniResult<()> {
        let message = match link {
            NewLink::Bridge { name, mtu } => LinkBridge::new(name).mtu(*mtu).build(),
            NewLink::Veth { name, peer, mtu } => LinkVeth::new(name, peer).mtu(*mtu).build(),
            NewLink::Macvlan {
                name,
                parent,
                mode,
                mtu,
                netns,
            } => {
                let builder = LinkMacVlan::new(name, *parent, kernel_mode(*mode)).mtu(*mtu);
                if netns.is_current() {
                    builder.build()
                } else {
                    // The fd only has to stay open until the request is sent.
                    let target = netns.open()?;
                    let message = builder.setns_by_fd(target.as_raw_fd()).build();
                    return self.run(ns, |handle| async move {
                        handle
                            .link()
                            .add(message)
                            .execute()
                            .await
                            .map_err(|e| map_err("add", name, e))?;
                        drop(target);
                        Ok(())
                    });
                }
            }
        };

        let name = link.name();
        self.run(ns, |handle| async move {
            handle
                .link()
                .add(message)
                .execute()
                .await
                .map_err(|e| map_err("add", name, e))
        })
    }

    fn set_link(&self, ns: &Netns, index: u32, change: &LinkChange) -> UnicniResult<()> {
        let builder = LinkUnspec::new_with_index(index);
        let (operation, message) = match change {
            LinkChange::Up => ("up", builder.up().build()),
            LinkChange::Down => ("down", builder.down().build()),
            LinkChange::Promisc(on) => ("promisc", builder.promiscuous(*on).build()),
            LinkChange::Mtu(mtu) => ("mtu", builder.mtu(*mtu).build()),
            LinkChange::Master(master) => ("master", builder.controller(*master).build()),
            LinkChange::Name(name) => ("rename", builder.name(name.clone()).build()),
        };
        let target = match change {
            LinkChange::Name(name) => name.clone(),
            _ => format!("index {index}"),
        };

        self.run(ns, |handle| async move {
            handle
                .link()
                .set(message)
                .execute()
                .await
                .map_err(|e| map_err(operation, &target, e))
        })
    }

    fn move_link(&self, ns: &Netns, index: u32, target: &Netns) -> UnicniResult<()> {
        let fd = target.open()?;
        let message = LinkUnspec::new_with_index(index)
            .setns_by_fd(fd.as_raw_fd())
            .build();

        self.run(ns, |handle| async move {
            handle
                .link()
                .set(message)
                .execute()
                .await
                .map_err(|e| map_err("move", &format!("index {index}"), e))?;
            drop(fd);
            Ok(())
        })
    }

    fn delete_link(&self, ns: &Netns, index: u32) -> UnicniResult<()> {
        self.run(ns, |handle| async move {
            handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(|e| map_err("delete", &format!("index {index}"), e))
        })
    }

    fn add_address(&self, ns: &Netns, index: u32, addr: &Cidr) -> UnicniResult<()> {
        let cidr = *addr;
        self.run(ns, |handle| async move {
            handle
                .address()
                .add(index, cidr.addr, cidr.prefix_len)
                .execute()
                .await
                .map_err(|e| map_err("address", &cidr.to_string(), e))
        })
    }
}
