//! Topology orchestration.
//!
//! [`Orchestrator::apply`] walks a [`TopologySpec`] through
//! `Start -> ChannelsBuilt -> ExternalPortsBuilt -> Done`. The first hard
//! error moves the run to `Aborted`; with rollback enabled the objects
//! created so far are removed again, newest first, before the error is
//! returned. [`Orchestrator::revert`] is best effort and never stops early.

use std::fmt;

use unicni_common::{NetConf, UnicniError, UnicniResult};

use crate::addr;
use crate::bridge::{self, Bridge};
use crate::link::{InterfaceDescriptor, LinkChange, LinkKind, Netlink};
use crate::macvlan;
use crate::names::check_ifname;
use crate::netns::Netns;
use crate::spec::{PortKind, TopologySpec};
use crate::veth;

/// Tunables for building a topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// MTU of topology bridges.
    pub bridge_mtu: u32,
    /// MTU of veth pairs.
    pub veth_mtu: u32,
    /// MTU of macvlan devices.
    pub macvlan_mtu: u32,
    /// Put bridges into promiscuous mode.
    pub promisc_bridge: bool,
    /// Undo created objects when a build aborts.
    pub rollback_on_failure: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self::from(&NetConf::default())
    }
}

impl From<&NetConf> for Options {
    fn from(conf: &NetConf) -> Self {
        Self {
            bridge_mtu: conf.bridge_mtu,
            veth_mtu: conf.veth_mtu,
            macvlan_mtu: conf.macvlan_mtu,
            promisc_bridge: conf.promisc_bridge,
            rollback_on_failure: conf.rollback_on_failure,
        }
    }
}

/// Progress of a build, reported in the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Nothing built yet.
    Start,
    /// Every system channel is attached.
    ChannelsBuilt,
    /// Every external port is attached.
    ExternalPortsBuilt,
    /// The result is assembled.
    Done,
    /// A hard error stopped the build.
    Aborted(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::ChannelsBuilt => write!(f, "channels-built"),
            Self::ExternalPortsBuilt => write!(f, "external-ports-built"),
            Self::Done => write!(f, "done"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    DeleteLink { name: String, netns: Netns },
    DeleteBridgeIfEmpty { name: String },
}

/// State of one `apply` run.
#[derive(Debug)]
struct Build {
    phase: Phase,
    interfaces: Vec<InterfaceDescriptor>,
    ledger: Vec<Undo>,
}

impl Build {
    fn new() -> Self {
        Self {
            phase: Phase::Start,
            interfaces: Vec::new(),
            ledger: Vec::new(),
        }
    }

    fn advance(&mut self, phase: Phase) {
        tracing::debug!(from = %self.phase, to = %phase, "Topology phase");
        self.phase = phase;
    }

    fn unwind<N: Netlink>(&mut self, nl: &N) {
        while let Some(undo) = self.ledger.pop() {
            let outcome = match &undo {
                Undo::DeleteLink { name, netns } => veth::delete_link_in_netns(nl, name, netns),
                Undo::DeleteBridgeIfEmpty { name } => bridge::delete_if_empty(nl, name).map(|_| ()),
            };
            match outcome {
                Ok(()) => tracing::debug!(?undo, "Rolled back"),
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(?undo, error = %e, "Rollback step failed"),
            }
        }
    }
}

/// Outcome of a teardown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Teardown {
    /// Objects that were deleted.
    pub removed: Vec<String>,
    /// Deletions that failed, with the reason.
    pub failures: Vec<String>,
}

impl Teardown {
    /// Whether every deletion succeeded or had nothing to do.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, what: &str, name: &str, outcome: UnicniResult<bool>) {
        match outcome {
            Ok(true) => self.removed.push(name.to_string()),
            Ok(false) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(what, name, "Already gone");
            }
            Err(e) => {
                tracing::warn!(what, name, error = %e, "Teardown step failed");
                self.failures.push(format!("{what} {name}: {e}"));
            }
        }
    }
}

/// Drives the link primitives to realize or remove a topology.
#[derive(Debug)]
pub struct Orchestrator<'a, N: Netlink> {
    nl: &'a N,
    options: Options,
}

impl<'a, N: Netlink> Orchestrator<'a, N> {
    /// Create an orchestrator over a backend.
    pub const fn new(nl: &'a N, options: Options) -> Self {
        Self { nl, options }
    }

    /// Build every channel and external port of `spec` for the container in `ns`.
    ///
    /// Returns the realized interfaces in creation order: for each bridged
    /// attachment the bridge, the host veth end and the container end; for
    /// each macvlan the container device.
    ///
    /// # Errors
    ///
    /// Returns the first hard failure. Over-long bridge names, promiscuous
    /// mode and address assignment only log.
    pub fn apply(&self, spec: &TopologySpec, ns: &Netns) -> UnicniResult<Vec<InterfaceDescriptor>> {
        tracing::info!(
            credential = %spec.credential,
            group = %spec.group,
            netns = %ns,
            channels = spec.system_channels.len(),
            external_ports = spec.external_ports.len(),
            "Applying topology"
        );

        let mut run = Build::new();
        match self.build(spec, ns, &mut run) {
            Ok(()) => {
                run.advance(Phase::Done);
                Ok(run.interfaces)
            }
            Err(e) => {
                run.advance(Phase::Aborted(e.to_string()));
                if self.options.rollback_on_failure {
                    tracing::warn!(error = %e, steps = run.ledger.len(), "Rolling back partial topology");
                    run.unwind(self.nl);
                } else {
                    tracing::warn!(error = %e, "Leaving partial topology in place");
                }
                Err(e)
            }
        }
    }

    fn build(&self, spec: &TopologySpec, ns: &Netns, run: &mut Build) -> UnicniResult<()> {
        for (channel, port) in &spec.system_channels {
            let bridge_name = spec.channel_bridge_name(channel);
            if let Err(e) = check_ifname(&bridge_name) {
                tracing::warn!(channel = %channel, error = %e, "Skipping system channel");
                continue;
            }
            self.attach_via_bridge(&bridge_name, port, ns, run)?;
        }
        run.advance(Phase::ChannelsBuilt);

        for port in &spec.external_ports {
            match &port.kind {
                PortKind::Macvlan { host_port, mode } => {
                    self.attach_macvlan(host_port, &port.container_port, mode, ns, run)?;
                }
                PortKind::Bridge => {
                    let bridge_name = spec.external_bridge_name(port);
                    if let Err(e) = check_ifname(&bridge_name) {
                        tracing::warn!(port = %port.container_port, error = %e, "Skipping external port");
                        continue;
                    }
                    self.attach_via_bridge(&bridge_name, &port.container_port, ns, run)?;
                }
            }

            if let Some(cidr) = &port.ip_addr {
                if let Err(e) = addr::add_address(self.nl, &port.container_port, cidr, ns) {
                    tracing::warn!(port = %port.container_port, address = %cidr, error = %e, "Failed to assign address");
                }
            }
        }
        run.advance(Phase::ExternalPortsBuilt);

        Ok(())
    }

    fn attach_via_bridge(
        &self,
        bridge_name: &str,
        port: &str,
        ns: &Netns,
        run: &mut Build,
    ) -> UnicniResult<()> {
        let nl = self.nl;

        let ensured = Bridge::ensure(
            nl,
            bridge_name,
            self.options.bridge_mtu,
            self.options.promisc_bridge,
        );
        // Ensure can fail after it created the bridge.
        if !matches!(ensured, Err(UnicniError::WrongDeviceType { .. })) {
            run.ledger.push(Undo::DeleteBridgeIfEmpty {
                name: bridge_name.to_string(),
            });
        }
        let bridge = ensured?;

        self.remove_stale(port, &LinkKind::Veth, ns)?;

        let pair = veth::create_pair_with_random_peer(nl, port, self.options.veth_mtu)?;
        run.ledger.push(Undo::DeleteLink {
            name: pair.peer.name.clone(),
            netns: Netns::Current,
        });

        if let Err(e) = nl.set_link(&Netns::Current, pair.named.index, &LinkChange::Promisc(true)) {
            tracing::warn!(interface = port, error = %e, "Failed to enable promiscuous mode");
        }

        let container = veth::join_netns(nl, port, ns)?;
        bridge.add_interface(nl, &pair.peer)?;

        let bridge = Bridge::get(nl, bridge_name)?;
        let host = nl.link_by_name(&Netns::Current, &pair.peer.name)?;

        tracing::info!(bridge = bridge_name, host = %host.name, container = port, netns = %ns, "Port attached");

        run.interfaces.extend([
            InterfaceDescriptor::new(bridge.link(), &Netns::Current),
            InterfaceDescriptor::new(&host, &Netns::Current),
            InterfaceDescriptor::new(&container, ns),
        ]);
        Ok(())
    }

    fn attach_macvlan(
        &self,
        host_port: &str,
        port: &str,
        mode: &str,
        ns: &Netns,
        run: &mut Build,
    ) -> UnicniResult<()> {
        self.remove_stale(port, &LinkKind::Macvlan, ns)?;

        let link =
            macvlan::create_in_netns(self.nl, host_port, port, mode, self.options.macvlan_mtu, ns)?;
        run.ledger.push(Undo::DeleteLink {
            name: port.to_string(),
            netns: ns.clone(),
        });

        run.interfaces.push(InterfaceDescriptor::new(&link, ns));
        Ok(())
    }

    /// Remove a leftover container port from an earlier ADD for the same container.
    ///
    /// Only a link of the kind this port creates counts as leftover; any other
    /// link with that name belongs to someone else and is [`UnicniError::NameTaken`].
    fn remove_stale(&self, port: &str, kind: &LinkKind, ns: &Netns) -> UnicniResult<()> {
        if ns.is_current() {
            return Ok(());
        }
        let link = match self.nl.link_by_name(ns, port) {
            Ok(link) => link,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if &link.kind != kind {
            tracing::warn!(interface = port, netns = %ns, found = %link.kind, "Container port name is taken");
            return Err(UnicniError::NameTaken {
                name: port.to_string(),
            });
        }
        self.nl.delete_link(ns, link.index)?;
        tracing::info!(interface = port, netns = %ns, "Removed stale container port");
        Ok(())
    }

    /// Remove what [`Orchestrator::apply`] built for `spec`.
    ///
    /// Container ports are deleted inside `ns`, channel bridges only when no
    /// other container still uses them, and per-port bridges always. Every
    /// step runs regardless of earlier failures.
    pub fn revert(&self, spec: &TopologySpec, ns: &Netns) -> Teardown {
        tracing::info!(
            credential = %spec.credential,
            group = %spec.group,
            netns = %ns,
            "Reverting topology"
        );

        let nl = self.nl;
        let mut report = Teardown::default();

        for (channel, port) in &spec.system_channels {
            report.record(
                "link",
                port,
                veth::delete_link_in_netns(nl, port, ns).map(|()| true),
            );

            let bridge_name = spec.channel_bridge_name(channel);
            if check_ifname(&bridge_name).is_err() {
                continue;
            }
            report.record("bridge", &bridge_name, bridge::delete_if_empty(nl, &bridge_name));
        }

        for port in &spec.external_ports {
            report.record(
                "link",
                &port.container_port,
                veth::delete_link_in_netns(nl, &port.container_port, ns).map(|()| true),
            );

            if !port.is_bridge() {
                continue;
            }
            let bridge_name = spec.external_bridge_name(port);
            if check_ifname(&bridge_name).is_err() {
                continue;
            }
            report.record(
                "bridge",
                &bridge_name,
                bridge::delete_bridge(nl, &bridge_name).map(|()| true),
            );
        }

        tracing::info!(
            removed = report.removed.len(),
            failures = report.failures.len(),
            "Topology reverted"
        );
        report
    }

    /// Verify that everything `spec` describes is present.
    ///
    /// # Errors
    ///
    /// Returns the first missing or mistyped object.
    pub fn check(&self, spec: &TopologySpec, ns: &Netns) -> UnicniResult<()> {
        let nl = self.nl;

        for (channel, port) in &spec.system_channels {
            let bridge_name = spec.channel_bridge_name(channel);
            if check_ifname(&bridge_name).is_err() {
                continue;
            }
            Bridge::get(nl, &bridge_name)?;
            nl.link_by_name(ns, port)?;
        }

        for port in &spec.external_ports {
            if port.is_bridge() {
                let bridge_name = spec.external_bridge_name(port);
                if check_ifname(&bridge_name).is_err() {
                    continue;
                }
                Bridge::get(nl, &bridge_name)?;
            }
            nl.link_by_name(ns, &port.container_port)?;
        }

        Ok(())
    }
}
