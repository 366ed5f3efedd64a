use anyhow::{Context, Result};

use crate::config::Config;

const BASE_CONFIG: &str = r#"
db: /tmp/relaydb-test
port: 9090
syncSessionLimit: 2
syncSessionPeriod: 1000
merkleDepth: 10
peers:
  - id: relay-1
    host: relay-1.devices.local
    port: 9090
tls:
  clientCertificate: client.crt
  clientKey: client.key
  serverCertificate: server.crt
  serverKey: server.key
  rootCA: ca.crt
"#;

fn write_config(contents: &str) -> Result<(tempfile::TempDir, std::path::PathBuf)> {
    let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
    let path = tmpdir.path().join("config.yaml");
    std::fs::write(&path, contents).context("error writing test config file")?;
    Ok((tmpdir, path))
}

#[test]
fn from_file_parses_a_valid_config() -> Result<()> {
    let (_tmpdir, path) = write_config(BASE_CONFIG)?;

    let config = Config::from_file(&path)?;

    assert_eq!(config.db_path, "/tmp/relaydb-test");
    assert_eq!(config.port, 9090);
    assert_eq!(config.merkle_depth, 10);
    assert_eq!(config.peers.len(), 1);
    assert_eq!(config.peers[0].id, "relay-1");
    assert_eq!(config.tls.root_ca, "ca.crt");
    assert!(config.cloud.is_none());
    Ok(())
}

#[test]
fn from_file_applies_defaults() -> Result<()> {
    let (_tmpdir, path) = write_config(
        r#"
db: /tmp/relaydb-test
port: 9090
tls: {}
"#,
    )?;

    let config = Config::from_file(&path)?;

    assert_eq!(config.sync_session_limit, 2);
    assert_eq!(config.sync_session_period, 1000);
    assert_eq!(config.gc_interval, 300_000);
    assert_eq!(config.gc_purge_age, 600_000);
    assert!(config.peers.is_empty());
    Ok(())
}

#[test]
fn from_file_rejects_out_of_range_merkle_depth() -> Result<()> {
    let (_tmpdir, path) = write_config(
        r#"
db: /tmp/relaydb-test
port: 9090
merkleDepth: 40
tls: {}
"#,
    )?;

    let res = Config::from_file(&path);

    assert!(res.is_err(), "expected config with merkleDepth=40 to be rejected");
    Ok(())
}

#[test]
fn from_file_rejects_zero_sync_session_limit() -> Result<()> {
    let (_tmpdir, path) = write_config(
        r#"
db: /tmp/relaydb-test
port: 9090
syncSessionLimit: 0
tls: {}
"#,
    )?;

    let res = Config::from_file(&path);

    assert!(res.is_err(), "expected config with syncSessionLimit=0 to be rejected");
    Ok(())
}

#[test]
fn from_file_rejects_invalid_peer() -> Result<()> {
    let (_tmpdir, path) = write_config(
        r#"
db: /tmp/relaydb-test
port: 9090
peers:
  - id: relay-1
    host: ""
    port: 9090
tls: {}
"#,
    )?;

    let res = Config::from_file(&path);

    assert!(res.is_err(), "expected config with empty peer host to be rejected");
    Ok(())
}

#[test]
fn from_file_parses_cloud_uplink() -> Result<()> {
    let (_tmpdir, path) = write_config(
        r#"
db: /tmp/relaydb-test
port: 9090
tls: {}
cloud:
  id: relay-77
  host: cloud.example.com
  port: 443
  noValidate: true
"#,
    )?;

    let config = Config::from_file(&path)?;

    let cloud = config.cloud.expect("expected cloud uplink config to be present");
    assert_eq!(cloud.id, "relay-77");
    assert_eq!(cloud.host, "cloud.example.com");
    assert_eq!(cloud.port, 443);
    assert!(cloud.no_validate);
    Ok(())
}
