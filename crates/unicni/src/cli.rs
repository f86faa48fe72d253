//! CLI command definitions and handlers.
//!
//! Without a subcommand the binary acts as a CNI plugin; the subcommands
//! drive the same orchestrator by hand.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, bail};
use unicni_common::{NetConf, UnicniError, UnicniResult};
use unicni_network::names::check_ifname;
use unicni_network::rtnl::RtNetlink;
use unicni_network::{
    InterfaceDescriptor, MacvlanMode, MemoryNetlink, Netlink, Netns, Options, Orchestrator,
    PortKind, Teardown, TopologySpec,
};

use crate::cni::{CniResult, SUPPORTED_VERSIONS};
use crate::logging::LogFormat;

/// Unicni - CNI plugin for annotated network topologies
#[derive(Parser)]
#[command(name = "unicni")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log output format
    #[arg(
        long,
        global = true,
        value_enum,
        env = "UNICNI_LOG_FORMAT",
        default_value_t = LogFormat::Text
    )]
    pub log_format: LogFormat,

    /// Manual command; without one the plugin reads a CNI event.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Manual commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build the topology described by a file
    Apply(TopologyArgs),

    /// Remove the topology described by a file
    Revert(TopologyArgs),

    /// Parse a topology file and show the names it derives
    Validate {
        /// Topology document
        #[arg(short, long)]
        spec: PathBuf,
    },

    /// Show version information
    Version,
}

/// Arguments shared by `apply` and `revert`.
#[derive(Args)]
pub struct TopologyArgs {
    /// Topology document (the annotation value)
    #[arg(short, long)]
    pub spec: PathBuf,

    /// Container network namespace path; the host namespace if omitted
    #[arg(long, default_value = "")]
    pub netns: String,

    /// Network configuration file; defaults apply if omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run against an in-memory kernel instead of netlink
    #[arg(long)]
    pub dry_run: bool,
}

impl TopologyArgs {
    fn load(&self) -> Result<(TopologySpec, NetConf, Netns)> {
        let doc = std::fs::read_to_string(&self.spec)
            .wrap_err_with(|| format!("Failed to read {}", self.spec.display()))?;
        let spec = TopologySpec::from_json(&doc)?;

        let conf = match &self.config {
            Some(path) => {
                let raw = std::fs::read(path)
                    .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
                NetConf::from_slice(&raw)?
            }
            None => NetConf::default(),
        };

        Ok((spec, conf, Netns::new(&self.netns)))
    }
}

impl Commands {
    /// Run the command.
    ///
    /// # Errors
    ///
    /// Returns the failure of the command.
    pub fn execute(self) -> Result<()> {
        match self {
            Self::Apply(args) => apply(&args),
            Self::Revert(args) => revert(&args),
            Self::Validate { spec } => validate(&spec),
            Self::Version => {
                println!("unicni {}", env!("CARGO_PKG_VERSION"));
                println!("CNI versions: {}", SUPPORTED_VERSIONS.join(", "));
                Ok(())
            }
        }
    }
}

/// In-memory kernel with the container namespace and every macvlan parent.
fn simulated(spec: &TopologySpec, ns: &Netns) -> UnicniResult<MemoryNetlink> {
    let nl = MemoryNetlink::new();
    nl.add_netns(ns);
    for port in &spec.external_ports {
        if let PortKind::Macvlan { host_port, .. } = &port.kind {
            match nl.add_device(&Netns::Current, host_port) {
                Ok(_) | Err(UnicniError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(nl)
}

fn build<N: Netlink>(
    nl: &N,
    spec: &TopologySpec,
    conf: &NetConf,
    ns: &Netns,
) -> UnicniResult<Vec<InterfaceDescriptor>> {
    Orchestrator::new(nl, Options::from(conf)).apply(spec, ns)
}

fn apply(args: &TopologyArgs) -> Result<()> {
    let (spec, conf, ns) = args.load()?;

    let interfaces = if args.dry_run {
        build(&simulated(&spec, &ns)?, &spec, &conf, &ns)?
    } else {
        build(&RtNetlink::new()?, &spec, &conf, &ns)?
    };

    let result = CniResult {
        cni_version: conf.cni_version,
        interfaces,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn revert(args: &TopologyArgs) -> Result<()> {
    let (spec, conf, ns) = args.load()?;
    let options = Options::from(&conf);

    let report: Teardown = if args.dry_run {
        // Simulate the teardown of what an apply would have built.
        let nl = simulated(&spec, &ns)?;
        let orch = Orchestrator::new(&nl, options);
        orch.apply(&spec, &ns)?;
        orch.revert(&spec, &ns)
    } else {
        let nl = RtNetlink::new()?;
        Orchestrator::new(&nl, options).revert(&spec, &ns)
    };

    for name in &report.removed {
        println!("removed {name}");
    }
    if !report.is_clean() {
        bail!("Teardown incomplete:\n  {}", report.failures.join("\n  "));
    }
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let doc = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    let spec = TopologySpec::from_json(&doc)?;

    let verdict = |name: &str| match check_ifname(name) {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("skipped: {e}"),
    };

    println!("credential {} group {}", spec.credential, spec.group);
    for (channel, port) in &spec.system_channels {
        let bridge = spec.channel_bridge_name(channel);
        println!("channel {channel}: bridge {bridge} -> {port} ({})", verdict(&bridge));
    }
    for port in &spec.external_ports {
        match &port.kind {
            PortKind::Macvlan { host_port, mode } => {
                let mode: MacvlanMode = mode.parse()?;
                println!("port {}: macvlan on {host_port} ({mode})", port.container_port);
            }
            PortKind::Bridge => {
                let bridge = spec.external_bridge_name(port);
                println!(
                    "port {}: bridge {bridge} ({})",
                    port.container_port,
                    verdict(&bridge)
                );
            }
        }
        if let Some(addr) = &port.ip_addr {
            println!("  address {addr}");
        }
    }
    Ok(())
}
