//! Database management.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The DB tree used for the cluster Raft's log, hard state and snapshot.
const TREE_CLUSTER_RAFT: &str = "cluster_raft";
/// The DB tree prefix used for bucket stores.
const TREE_BUCKET_PREFIX: &str = "buckets";
/// The name of the file used to hold the node's ID.
const NODE_ID_FILE_NAME: &str = "node_id";

/// An abstraction over the RelayDB database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.db_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for relaydb database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Fetch this node's ID from disk, or create a new ID if this node is pristine.
    pub async fn get_node_id(&self) -> Result<u64> {
        let node_id_file_path = PathBuf::from(&self.inner.config.db_path).join(NODE_ID_FILE_NAME);
        let node_id_raw = match tokio::fs::read_to_string(&node_id_file_path).await {
            Ok(node_id_raw) => node_id_raw,
            Err(err) => match err.kind() {
                std::io::ErrorKind::NotFound => {
                    let id = loop {
                        let mut hasher = DefaultHasher::default();
                        uuid::Uuid::new_v4().hash(&mut hasher);
                        // Node ID 0 marks an unassigned token slot and may never name a node.
                        let id = hasher.finish();
                        if id != 0 {
                            break id;
                        }
                    };
                    tokio::fs::write(&node_id_file_path, format!("{}", id).as_bytes())
                        .await
                        .context("error writing node ID to disk")?;
                    return Ok(id);
                }
                _ => return Err(err).context("error reading node ID file"),
            },
        };
        let node_id = node_id_raw
            .parse::<u64>()
            .with_context(|| format!("invalid node ID found: {}", node_id_raw))?;
        Ok(node_id)
    }

    /// Get a handle to the DB tree backing the cluster Raft.
    pub async fn get_cluster_raft_tree(&self) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(TREE_CLUSTER_RAFT));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", TREE_CLUSTER_RAFT, err))))?;
        Ok(tree)
    }

    /// Get a handle to the DB tree backing the given bucket.
    pub async fn get_bucket_tree(&self, bucket: &str) -> ShutdownResult<Tree> {
        let name = format!("{}/{}", TREE_BUCKET_PREFIX, bucket);
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))?;
        Ok(tree)
    }
}
