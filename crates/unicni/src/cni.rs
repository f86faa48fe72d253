//! CNI protocol handling.
//!
//! The container runtime runs the plugin once per lifecycle event with the
//! event described in `CNI_*` environment variables and the network
//! configuration on stdin. The result, or an error object, goes to stdout.

use std::collections::BTreeMap;
use std::str::FromStr;

use miette::Diagnostic;
use serde::Serialize;
use unicni_common::{NetConf, UnicniError, UnicniResult};
use unicni_network::{InterfaceDescriptor, Netlink, Netns, Options, Orchestrator};

use crate::annotations::TopologySource;

/// CNI versions this plugin can answer in.
pub const SUPPORTED_VERSIONS: [&str; 5] = ["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

/// Lifecycle event requested by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    /// Attach the container.
    Add,
    /// Detach the container.
    Del,
    /// Verify the attachment.
    Check,
    /// Report supported versions.
    Version,
}

impl FromStr for CniCommand {
    type Err = UnicniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            other => Err(UnicniError::Config {
                message: format!("Unknown CNI_COMMAND {other:?}"),
            }),
        }
    }
}

/// Event parameters taken from the `CNI_*` environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniEnv {
    /// Requested event.
    pub command: CniCommand,
    /// Container ID.
    pub container_id: String,
    /// Container network namespace; [`Netns::Current`] if unset.
    pub netns: Netns,
    /// Interface name the runtime asked for. Ports are named by the topology
    /// instead, so this is only logged.
    pub ifname: String,
    /// Pod namespace from `CNI_ARGS`.
    pub pod_namespace: Option<String>,
    /// Pod name from `CNI_ARGS`.
    pub pod_name: Option<String>,
}

impl CniEnv {
    /// Read the event from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Config`] if `CNI_COMMAND` is missing or unknown.
    pub fn from_env() -> UnicniResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the event through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Config`] if `CNI_COMMAND` is missing or unknown.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> UnicniResult<Self> {
        let command = lookup("CNI_COMMAND")
            .ok_or_else(|| UnicniError::Config {
                message: "CNI_COMMAND is not set".to_string(),
            })?
            .parse()?;

        let mut args = parse_cni_args(&lookup("CNI_ARGS").unwrap_or_default());

        Ok(Self {
            command,
            container_id: lookup("CNI_CONTAINERID").unwrap_or_default(),
            netns: Netns::new(&lookup("CNI_NETNS").unwrap_or_default()),
            ifname: lookup("CNI_IFNAME").unwrap_or_default(),
            pod_namespace: args.remove("K8S_POD_NAMESPACE"),
            pod_name: args.remove("K8S_POD_NAME"),
        })
    }

    /// Pod namespace and name, when both are known.
    #[must_use]
    pub fn pod(&self) -> Option<(&str, &str)> {
        match (&self.pod_namespace, &self.pod_name) {
            (Some(ns), Some(name)) => Some((ns, name)),
            _ => None,
        }
    }
}

/// Split `K1=V1;K2=V2` into pairs, dropping malformed and empty entries.
fn parse_cni_args(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Successful ADD result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    /// Version the result is expressed in.
    pub cni_version: String,
    /// Interfaces created for the container.
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// Error object returned to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorReply {
    /// Version of the reply.
    pub cni_version: String,
    /// CNI error code.
    pub code: u32,
    /// Error message.
    pub msg: String,
    /// Remediation hint, if any.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniErrorReply {
    /// Build the reply for `err`.
    #[must_use]
    pub fn new(cni_version: &str, err: &UnicniError) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: error_code(err),
            msg: err.to_string(),
            details: err.help().map(|h| h.to_string()).unwrap_or_default(),
        }
    }
}

/// Reply to `VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Version of the reply.
    pub cni_version: String,
    /// Every version the plugin understands.
    pub supported_versions: Vec<&'static str>,
}

impl VersionInfo {
    /// Reply in `cni_version`.
    #[must_use]
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
        }
    }
}

/// Serialized [`VersionInfo`].
///
/// # Errors
///
/// Returns a serialization error.
pub fn version_reply(cni_version: &str) -> UnicniResult<String> {
    Ok(serde_json::to_string(&VersionInfo::new(cni_version))?)
}

/// CNI error code for `err`: the well-known codes where one fits,
/// 100 for plugin failures.
#[must_use]
pub const fn error_code(err: &UnicniError) -> u32 {
    match err {
        UnicniError::Io(_) => 5,
        UnicniError::Serialization(_) => 6,
        UnicniError::Config { .. } => 7,
        UnicniError::Annotation { .. } => 11,
        _ => 100,
    }
}

/// Runs lifecycle events against a backend.
pub struct Plugin<'a, N: Netlink> {
    nl: &'a N,
    source: &'a dyn TopologySource,
    conf: &'a NetConf,
}

impl<'a, N: Netlink> Plugin<'a, N> {
    /// Create a plugin over `nl`, looking topologies up in `source`.
    pub fn new(nl: &'a N, source: &'a dyn TopologySource, conf: &'a NetConf) -> Self {
        Self { nl, source, conf }
    }

    fn orchestrator(&self) -> Orchestrator<'a, N> {
        Orchestrator::new(self.nl, Options::from(self.conf))
    }

    /// Handle one event. Returns what to print on stdout, if anything.
    ///
    /// # Errors
    ///
    /// ADD and CHECK fail on any lookup or build error. DEL never fails;
    /// what cannot be found or removed is logged.
    pub fn handle(&self, env: &CniEnv) -> UnicniResult<Option<String>> {
        tracing::info!(
            command = ?env.command,
            container = %env.container_id,
            netns = %env.netns,
            ifname = %env.ifname,
            "CNI event"
        );

        match env.command {
            CniCommand::Add => self.add(env).map(Some),
            CniCommand::Del => {
                self.del(env);
                Ok(None)
            }
            CniCommand::Check => self.check(env).map(|()| None),
            CniCommand::Version => version_reply(&self.conf.cni_version).map(Some),
        }
    }

    fn add(&self, env: &CniEnv) -> UnicniResult<String> {
        if env.netns.is_current() {
            return Err(UnicniError::Config {
                message: "CNI_NETNS is required for ADD".to_string(),
            });
        }

        let interfaces = match self.lookup(env)? {
            Some(spec) => self.orchestrator().apply(&spec, &env.netns)?,
            None => Vec::new(),
        };

        let result = CniResult {
            cni_version: self.conf.cni_version.clone(),
            interfaces,
        };
        Ok(serde_json::to_string(&result)?)
    }

    fn del(&self, env: &CniEnv) {
        if env.netns.is_current() {
            tracing::warn!(container = %env.container_id, "No network namespace given, nothing to remove");
            return;
        }

        let spec = match self.lookup(env) {
            Ok(Some(spec)) => spec,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve topology, nothing removed");
                return;
            }
        };

        let report = self.orchestrator().revert(&spec, &env.netns);
        if !report.is_clean() {
            tracing::warn!(failures = ?report.failures, "Teardown incomplete");
        }
    }

    fn check(&self, env: &CniEnv) -> UnicniResult<()> {
        match self.lookup(env)? {
            Some(spec) => self.orchestrator().check(&spec, &env.netns),
            None => Ok(()),
        }
    }

    fn lookup(&self, env: &CniEnv) -> UnicniResult<Option<unicni_network::TopologySpec>> {
        let Some((namespace, name)) = env.pod() else {
            tracing::warn!(container = %env.container_id, "CNI_ARGS carries no pod identity");
            return Ok(None);
        };
        self.source.topology(namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use unicni_network::{MemoryNetlink, TopologySpec};

    use super::*;

    struct Fixed(Option<&'static str>);

    impl TopologySource for Fixed {
        fn topology(&self, _namespace: &str, _name: &str) -> UnicniResult<Option<TopologySpec>> {
            self.0.map(TopologySpec::from_json).transpose()
        }
    }

    struct Unreachable;

    impl TopologySource for Unreachable {
        fn topology(&self, _namespace: &str, _name: &str) -> UnicniResult<Option<TopologySpec>> {
            Err(UnicniError::Annotation {
                message: "connection refused".to_string(),
            })
        }
    }

    const CHANNEL: &str = r#"{"credential":"c1","group":"g1","system_channels":{"ctrl":"p0"}}"#;

    fn env(command: &str) -> CniEnv {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CNI_COMMAND", command),
            ("CNI_CONTAINERID", "abc123"),
            ("CNI_NETNS", "/var/run/ns/test"),
            ("CNI_IFNAME", "eth0"),
            (
                "CNI_ARGS",
                "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=v9-simware",
            ),
        ]);
        CniEnv::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap()
    }

    fn backend() -> MemoryNetlink {
        let nl = MemoryNetlink::new();
        nl.add_netns(&Netns::new("/var/run/ns/test"));
        nl
    }

    #[test]
    fn environment_is_parsed() {
        let env = env("ADD");
        assert_eq!(env.command, CniCommand::Add);
        assert_eq!(env.netns, Netns::new("/var/run/ns/test"));
        assert_eq!(env.pod(), Some(("default", "v9-simware")));
    }

    #[test]
    fn missing_or_unknown_command() {
        assert!(matches!(
            CniEnv::from_lookup(|_| None),
            Err(UnicniError::Config { .. })
        ));
        assert!("UPDATE".parse::<CniCommand>().is_err());
    }

    #[test]
    fn cni_args_tolerate_junk() {
        let args = parse_cni_args("A=1;;B;C=;=D;E=5");
        assert_eq!(args.len(), 2);
        assert_eq!(args.get("E").map(String::as_str), Some("5"));
    }

    #[test]
    fn add_reports_interfaces() {
        let nl = backend();
        let conf = NetConf::default();
        let source = Fixed(Some(CHANNEL));

        let out = Plugin::new(&nl, &source, &conf).handle(&env("ADD")).unwrap().unwrap();

        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["cniVersion"], "1.0.0");
        let ifaces = json["interfaces"].as_array().unwrap();
        assert_eq!(ifaces.len(), 3);
        assert_eq!(ifaces[2]["name"], "p0");
        assert_eq!(ifaces[2]["sandbox"], "/var/run/ns/test");
        assert!(ifaces[0].get("sandbox").is_none());
    }

    #[test]
    fn add_without_annotation_is_empty() {
        let nl = backend();
        let conf = NetConf::default();
        let out = Plugin::new(&nl, &Fixed(None), &conf)
            .handle(&env("ADD"))
            .unwrap()
            .unwrap();
        assert_eq!(out, r#"{"cniVersion":"1.0.0","interfaces":[]}"#);
        assert_eq!(nl.link_count(), 0);
    }

    #[test]
    fn add_needs_netns() {
        let nl = backend();
        let conf = NetConf::default();
        let mut env = env("ADD");
        env.netns = Netns::Current;
        let err = Plugin::new(&nl, &Fixed(Some(CHANNEL)), &conf)
            .handle(&env)
            .unwrap_err();
        assert_eq!(error_code(&err), 7);
    }

    #[test]
    fn del_then_check() {
        let nl = backend();
        let conf = NetConf::default();
        let source = Fixed(Some(CHANNEL));
        let plugin = Plugin::new(&nl, &source, &conf);

        plugin.handle(&env("ADD")).unwrap();
        assert_eq!(plugin.handle(&env("CHECK")).unwrap(), None);
        assert_eq!(plugin.handle(&env("DEL")).unwrap(), None);

        assert_eq!(nl.link_count(), 0);
        assert!(plugin.handle(&env("CHECK")).unwrap_err().is_not_found());
    }

    #[test]
    fn del_survives_unreachable_api_server() {
        let nl = backend();
        let conf = NetConf::default();
        assert_eq!(
            Plugin::new(&nl, &Unreachable, &conf).handle(&env("DEL")).unwrap(),
            None
        );
    }

    #[test]
    fn add_fails_on_unreachable_api_server() {
        let nl = backend();
        let conf = NetConf::default();
        let err = Plugin::new(&nl, &Unreachable, &conf)
            .handle(&env("ADD"))
            .unwrap_err();
        let reply = CniErrorReply::new("1.0.0", &err);
        assert_eq!(reply.code, 11);
        assert!(reply.details.contains("apiServer"));
    }

    #[test]
    fn version_lists_supported() {
        let nl = backend();
        let conf = NetConf::default();
        let out = Plugin::new(&nl, &Fixed(None), &conf)
            .handle(&env("VERSION"))
            .unwrap()
            .unwrap();
        assert!(out.contains(r#""supportedVersions":["0.3.0","0.3.1","0.4.0","1.0.0","1.1.0"]"#));
    }

    #[test]
    fn error_reply_shape() {
        let err = UnicniError::InvalidMode {
            mode: "sideways".to_string(),
        };
        let json = serde_json::to_value(CniErrorReply::new("0.4.0", &err)).unwrap();
        assert_eq!(json["code"], 100);
        assert_eq!(json["cniVersion"], "0.4.0");
        assert!(json["msg"].as_str().unwrap().contains("sideways"));
        assert!(json["details"].as_str().unwrap().contains("passthru"));
    }
}
