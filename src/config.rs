//! Runtime configuration.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::bucket::merkle::{MERKLE_DEFAULT_DEPTH, MERKLE_MAX_DEPTH, MERKLE_MIN_DEPTH};

/// Runtime configuration data, loaded from the server's YAML config file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The path to the database on disk.
    #[serde(rename = "db")]
    pub db_path: String,
    /// The port which the server is to use.
    pub port: u16,

    /// The maximum number of concurrent anti-entropy sync sessions.
    #[serde(default = "Config::default_sync_session_limit")]
    pub sync_session_limit: u64,
    /// The number of milliseconds between sync session initiations.
    #[serde(default = "Config::default_sync_session_period")]
    pub sync_session_period: u64,
    /// The maximum number of peers to push a write notification to.
    #[serde(default)]
    pub sync_push_broadcast_limit: u64,

    /// The number of milliseconds between garbage collection passes.
    #[serde(default = "Config::default_gc_interval")]
    pub gc_interval: u64,
    /// The minimum age in milliseconds a tombstone must reach before it may be purged.
    #[serde(default = "Config::default_gc_purge_age")]
    pub gc_purge_age: u64,

    /// The depth of each bucket's merkle tree.
    ///
    /// Deeper trees consume more space but reduce the amount of data transferred during
    /// anti-entropy sync sessions.
    #[serde(default = "Config::default_merkle_depth")]
    pub merkle_depth: u8,

    /// The set of peers to which this node should connect.
    #[serde(default)]
    pub peers: Vec<Peer>,

    /// TLS certificates and keys used for intra-cluster traffic.
    pub tls: TlsFiles,

    /// Optional cloud uplink configuration.
    #[serde(default)]
    pub cloud: Option<Cloud>,
}

/// A peer which this node should maintain a connection to.
#[derive(Clone, Debug, Deserialize)]
pub struct Peer {
    /// The unique ID of the peer.
    pub id: String,
    /// The host at which the peer can be reached.
    pub host: String,
    /// The port at which the peer can be reached.
    pub port: u16,
}

/// File system paths to the TLS certificates and keys used by this node.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsFiles {
    /// The certificate presented when dialing peers.
    #[serde(default)]
    pub client_certificate: String,
    /// The key matching `client_certificate`.
    #[serde(default)]
    pub client_key: String,
    /// The certificate presented to inbound connections.
    #[serde(default)]
    pub server_certificate: String,
    /// The key matching `server_certificate`.
    #[serde(default)]
    pub server_key: String,
    /// The root CA chain used to validate peer certificates.
    #[serde(default)]
    pub root_ca: String,
}

/// Configuration of the optional uplink to a cloud relay.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cloud {
    /// The cluster-assigned ID of this relay.
    pub id: String,
    /// The host of the cloud service.
    pub host: String,
    /// The port of the cloud service.
    pub port: u16,
    /// Disable certificate validation when dialing the cloud service.
    #[serde(default)]
    pub no_validate: bool,
}

impl Config {
    /// Load the config from the YAML file at the given path, validating its contents.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())
            .with_context(|| format!("error reading config file {}", path.as_ref().display()))?;
        let config: Config = serde_yaml::from_slice(&raw).context("error parsing YAML config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded config values.
    fn validate(&self) -> Result<()> {
        if self.db_path.is_empty() {
            bail!("a database path must be specified in the config `db` field");
        }
        if self.merkle_depth < MERKLE_MIN_DEPTH || self.merkle_depth > MERKLE_MAX_DEPTH {
            bail!(
                "invalid merkle depth {}, valid range is {} to {} inclusive",
                self.merkle_depth,
                MERKLE_MIN_DEPTH,
                MERKLE_MAX_DEPTH
            );
        }
        if self.sync_session_limit == 0 {
            bail!("syncSessionLimit must be at least 1");
        }
        if self.sync_session_period == 0 {
            bail!("syncSessionPeriod must be at least 1");
        }
        for peer in self.peers.iter() {
            if peer.id.is_empty() {
                bail!("peer ID is empty");
            }
            if peer.host.is_empty() {
                bail!("the host name is empty for peer {}", peer.id);
            }
            if peer.port == 0 {
                bail!("{} is an invalid port to connect to peer {} at {}", peer.port, peer.id, peer.host);
            }
        }
        Ok(())
    }

    fn default_sync_session_limit() -> u64 {
        2
    }

    fn default_sync_session_period() -> u64 {
        1000
    }

    fn default_gc_interval() -> u64 {
        300_000
    }

    fn default_gc_purge_age() -> u64 {
        600_000
    }

    fn default_merkle_depth() -> u8 {
        MERKLE_DEFAULT_DEPTH
    }

    /// Build an instance for use in tests.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        Ok((
            std::sync::Arc::new(Self {
                db_path: tmpdir.path().to_string_lossy().to_string(),
                port: 9090,
                sync_session_limit: 2,
                sync_session_period: 1000,
                sync_push_broadcast_limit: 0,
                gc_interval: 300_000,
                gc_purge_age: 600_000,
                merkle_depth: 4,
                peers: Vec::new(),
                tls: TlsFiles::default(),
                cloud: None,
            }),
            tmpdir,
        ))
    }
}
