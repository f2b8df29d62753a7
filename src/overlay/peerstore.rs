//! On-disk peer cache (spec §4.4 "record known peers on disk, so the next
//! run skips the tracker when enough cached neighbors remain", §6 "keys
//! file: JSON containing {..., peers: {address → node_id}}").

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::Identifier;

#[derive(Debug, Error)]
pub enum PeerStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed peer cache: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PeerStoreFile {
    peers: HashMap<String, Identifier>,
}

/// Maps known `address -> node_id` pairs, persisted as part of the node's
/// `keys` file sibling (spec §6). Reconnection on startup consults this
/// before falling back to the tracker.
pub struct PeerStore {
    path: PathBuf,
    peers: HashMap<String, Identifier>,
}

impl PeerStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, PeerStoreError> {
        let path = path.into();
        let peers = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<PeerStoreFile>(&bytes)?.peers,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(PeerStore { path, peers })
    }

    pub async fn save(&self) -> Result<(), PeerStoreError> {
        let file = PeerStoreFile { peers: self.peers.clone() };
        let bytes = serde_json::to_vec_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    pub fn remember(&mut self, address: impl Into<String>, node_id: Identifier) {
        self.peers.insert(address.into(), node_id);
    }

    pub fn forget(&mut self, address: &str) {
        self.peers.remove(address);
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&str, &Identifier)> {
        self.peers.iter().map(|(addr, id)| (addr.as_str(), id))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
