//! C9 glue — file indexer boundary (spec §1 Non-goals: the on-disk indexer
//! of user files is an external collaborator). The core does not walk
//! directory trees or decide what's shareable; it only exposes the seam an
//! external indexer drives once it has made that decision: turn bytes into
//! a resource (§4.3 `process`) and announce the result on the pub/sub
//! fabric (§4.7 `publish`).

use std::sync::Arc;

use thiserror::Error;

use crate::ident::Identifier;
use crate::pubsub::{Fabric, PubSubError, PublishOutput};
use crate::resource::{self, ProcessSpecs, ResourceError};
use crate::store::BlockStore;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("pub/sub error: {0}")]
    PubSub(#[from] PubSubError),
}

/// What an external indexer hands the core for one file it has decided to
/// share.
pub struct IndexRequest {
    pub path: String,
    pub specs: ProcessSpecs,
    pub content: Vec<u8>,
}

/// Process `request.content` into a resource and announce its digest under
/// `request.path`. This is the entire core-side contract an external
/// indexer needs; everything upstream (walking a tree, watching for
/// changes, deciding what's shareable) is out of scope.
pub async fn index_and_publish(
    store: &Arc<BlockStore>,
    fabric: &Fabric,
    request: IndexRequest,
) -> Result<Identifier, IndexerError> {
    let digest = resource::process(store, &request.content, request.specs).await?;
    fabric.publish(&request.path, PublishOutput::Targets(vec![digest])).await?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ProcessSpecs;

    #[tokio::test]
    async fn index_and_publish_produces_a_stored_digest() {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let fabric = Fabric::new(store.clone());
        let request = IndexRequest {
            path: "/files/u1/notes.txt".into(),
            specs: ProcessSpecs { name: "notes.txt".into(), r#type: "file".into(), ..Default::default() },
            content: b"hello indexer".to_vec(),
        };
        let digest = index_and_publish(&store, &fabric, request).await.unwrap();
        assert!(store.has_block(&digest).await.unwrap());
    }
}
