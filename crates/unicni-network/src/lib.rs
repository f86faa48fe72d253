//! # unicni-network
//!
//! Link primitives and topology orchestration for the unicni plugin.
//!
//! The primitives (bridges, veth pairs, macvlans, addresses) act through the
//! [`Netlink`] trait, which has a kernel backend ([`rtnl::RtNetlink`]) and
//! an in-memory one ([`MemoryNetlink`]).

#![warn(missing_docs)]

pub mod addr;
pub mod bridge;
pub mod link;
pub mod macvlan;
pub mod memory;
pub mod names;
pub mod netns;
pub mod rtnl;
pub mod spec;
pub mod topology;
pub mod veth;

pub use bridge::Bridge;
pub use link::{InterfaceDescriptor, Link, LinkKind, Netlink};
pub use macvlan::MacvlanMode;
pub use memory::MemoryNetlink;
pub use netns::Netns;
pub use spec::{ExternalPortSpec, PortKind, TopologySpec};
pub use topology::{Options, Orchestrator, Teardown};
pub use veth::VethPair;
