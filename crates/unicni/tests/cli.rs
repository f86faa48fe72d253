//! Integration tests for the unicni binary.
use std::error::Error;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn Error>>;

const CONF: &str = r#"{"cniVersion":"0.4.0","name":"union","type":"unicni"}"#;

fn unicni() -> Result<Command, Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("unicni")?;
    for var in [
        "CNI_COMMAND",
        "CNI_CONTAINERID",
        "CNI_NETNS",
        "CNI_IFNAME",
        "CNI_ARGS",
        "UNICNI_LOG",
        "UNICNI_LOG_FORMAT",
        "UNICNI_API_SERVER",
    ] {
        cmd.env_remove(var);
    }
    Ok(cmd)
}

fn spec_file(dir: &TempDir, doc: &str) -> Result<PathBuf, Box<dyn Error>> {
    let path = dir.path().join("topology.json");
    std::fs::write(&path, doc)?;
    Ok(path)
}

#[test]
fn version_subcommand() -> TestResult {
    unicni()?
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("unicni ").and(predicate::str::contains("1.0.0")));
    Ok(())
}

#[test]
fn validate_shows_skipped_channels() -> TestResult {
    let dir = TempDir::new()?;
    let spec = spec_file(
        &dir,
        r#"{"credential":"aaaaaaaaaa","group":"bbbbb","system_channels":{"ctrl":"p0"},
            "external_ports":[{"host_port":"eth0","container_port":"net1","type":"macvlan"}]}"#,
    )?;

    unicni()?
        .args(["validate", "--spec"])
        .arg(&spec)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("aaaaaaaaaa-bbbbb-ctrl")
                .and(predicate::str::contains("skipped"))
                .and(predicate::str::contains("macvlan on eth0 (vepa)")),
        );
    Ok(())
}

#[test]
fn validate_rejects_missing_group() -> TestResult {
    let dir = TempDir::new()?;
    let spec = spec_file(&dir, r#"{"credential":"c1"}"#)?;

    unicni()?
        .args(["validate", "--spec"])
        .arg(&spec)
        .assert()
        .failure()
        .stderr(predicate::str::contains("group"));
    Ok(())
}

#[test]
fn dry_run_apply_prints_interfaces() -> TestResult {
    let dir = TempDir::new()?;
    let spec = spec_file(
        &dir,
        r#"{"credential":"c1","group":"g1","system_channels":{"ctrl":"p0"},
            "external_ports":[{"host_port":"eth0","container_port":"net1","type":"macvlan",
                               "mode":"bridge","ipaddr":"10.0.0.5/24"}]}"#,
    )?;

    unicni()?
        .args(["apply", "--dry-run", "--netns", "/var/run/ns/test", "--spec"])
        .arg(&spec)
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#""name": "c1-g1-ctrl""#)
                .and(predicate::str::contains(r#""name": "p0""#))
                .and(predicate::str::contains(r#""name": "net1""#))
                .and(predicate::str::contains("/var/run/ns/test")),
        );
    Ok(())
}

#[test]
fn dry_run_revert_lists_removals() -> TestResult {
    let dir = TempDir::new()?;
    let spec = spec_file(
        &dir,
        r#"{"credential":"c1","group":"g1","system_channels":{"ctrl":"p0"}}"#,
    )?;

    unicni()?
        .args(["revert", "--dry-run", "--netns", "/var/run/ns/test", "--spec"])
        .arg(&spec)
        .assert()
        .success()
        .stdout(predicate::str::contains("removed p0").and(predicate::str::contains("removed c1-g1-ctrl")));
    Ok(())
}

#[test]
fn cni_version() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "VERSION")
        .write_stdin(CONF)
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#""cniVersion":"0.4.0""#)
                .and(predicate::str::contains("supportedVersions")),
        );
    Ok(())
}

#[test]
fn cni_version_without_config() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "VERSION")
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("supportedVersions"));
    Ok(())
}

#[test]
fn cni_unknown_command() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "UPDATE")
        .write_stdin(CONF)
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""code":7"#));
    Ok(())
}

#[test]
fn cni_bad_config() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "ADD")
        .env("CNI_NETNS", "/var/run/netns/test")
        .write_stdin("not json")
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""code":6"#));
    Ok(())
}

#[test]
fn cni_add_requires_netns() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "ADD")
        .env("CNI_CONTAINERID", "abc123")
        .write_stdin(CONF)
        .assert()
        .failure()
        .stdout(
            predicate::str::contains(r#""code":7"#)
                .and(predicate::str::contains("CNI_NETNS"))
                .and(predicate::str::contains(r#""cniVersion":"0.4.0""#)),
        );
    Ok(())
}

#[test]
fn cni_del_without_pod_identity_is_a_no_op() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "DEL")
        .env("CNI_NETNS", "/var/run/netns/gone")
        .write_stdin(CONF)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    Ok(())
}

#[test]
fn cni_add_with_unreachable_api_server() -> TestResult {
    unicni()?
        .env("CNI_COMMAND", "ADD")
        .env("CNI_NETNS", "/var/run/netns/test")
        .env("CNI_ARGS", "K8S_POD_NAMESPACE=default;K8S_POD_NAME=v9-simware")
        .env("UNICNI_API_SERVER", "http://127.0.0.1:1")
        .write_stdin(CONF)
        .assert()
        .failure()
        .stdout(predicate::str::contains(r#""code":11"#));
    Ok(())
}
