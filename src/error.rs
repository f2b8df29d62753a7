//! Crate-wide error taxonomy.
//!
//! Matches the failure classes of spec §7: transient I/O and protocol
//! violations are recovered locally by the subsystem that hits them and
//! never appear here; only integrity and exhaustion failures, plus
//! configuration errors surfaced at startup, propagate as a `CoreError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("block store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("fountain codec error: {0}")]
    Fountain(#[from] crate::fountain::FountainError),

    #[error("resource error: {0}")]
    Resource(#[from] crate::resource::ResourceError),

    #[error("overlay error: {0}")]
    Overlay(#[from] crate::overlay::OverlayError),

    #[error("tunneler error: {0}")]
    Tunneler(#[from] crate::tunneler::TunnelError),

    #[error("network handler error: {0}")]
    Network(#[from] crate::network::NetworkError),

    #[error("pub/sub error: {0}")]
    PubSub(#[from] crate::pubsub::PubSubError),

    #[error("identity error: {0}")]
    Identity(#[from] crate::identity::IdentityError),

    #[error("indexer error: {0}")]
    Indexer(#[from] crate::indexer::IndexerError),

    #[error("runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
