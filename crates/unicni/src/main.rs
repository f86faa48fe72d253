//! Unicni CLI entry point.

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use unicni::annotations::{AnnotationClient, PodTopologySource};
use unicni::cli::{Cli, Commands};
use unicni::cni::{self, CniCommand, CniEnv, CniErrorReply, Plugin};
use unicni::logging::{self, LogFormat};
use unicni_common::{NetConf, UnicniResult};
use unicni_network::rtnl::RtNetlink;

// Namespace switches are per thread; everything below runs on the main thread.
fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(command) => manual(cli.log_format, command),
        None => plugin(cli.log_format),
    }
}

fn manual(log_format: LogFormat, command: Commands) -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("Failed to install error handler: {e}");
    }
    logging::init(log_format, None);

    match command.execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("Error: {report:?}");
            ExitCode::FAILURE
        }
    }
}

fn plugin(log_format: LogFormat) -> ExitCode {
    let env = CniEnv::from_env();
    // Without a command there is no event to read a configuration for.
    let conf = match &env {
        Ok(env) => read_conf(env.command),
        Err(_) => Ok(NetConf::default()),
    };

    logging::init(
        log_format,
        conf.as_ref().ok().and_then(|c| c.log_level.as_deref()),
    );
    let version = conf
        .as_ref()
        .map_or_else(|_| NetConf::default().cni_version, |c| c.cni_version.clone());

    let outcome = env.and_then(|env| conf.and_then(|conf| dispatch(&env, &conf)));

    match outcome {
        Ok(Some(out)) => {
            println!("{out}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "CNI command failed");
            match serde_json::to_string(&CniErrorReply::new(&version, &e)) {
                Ok(reply) => println!("{reply}"),
                Err(ser) => eprintln!("Failed to encode error reply: {ser}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// Network configuration from stdin. `VERSION` may come without one.
fn read_conf(command: CniCommand) -> UnicniResult<NetConf> {
    let mut raw = Vec::new();
    std::io::stdin().read_to_end(&mut raw)?;

    if command == CniCommand::Version && raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(NetConf::default());
    }
    NetConf::from_slice(&raw)
}

fn dispatch(env: &CniEnv, conf: &NetConf) -> UnicniResult<Option<String>> {
    if env.command == CniCommand::Version {
        return cni::version_reply(&conf.cni_version).map(Some);
    }

    let client = AnnotationClient::new(conf.api_base_url())?;
    let source = PodTopologySource::new(client, conf.annotation_key.clone());
    let nl = RtNetlink::new()?;

    Plugin::new(&nl, &source, conf).handle(env)
}
