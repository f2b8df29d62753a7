//! Teapotnet core: a peer-to-peer private social network runtime.
//!
//! Layered bottom-up, each module numbered against its own spec section:
//! [`crypto`] and [`ident`] (primitives and the 256-bit identifier space),
//! [`fountain`] (rateless erasure coding), [`store`] (content-addressed
//! block persistence), [`resource`] (typed resources built from blocks),
//! [`overlay`] (routing + DHT over authenticated node links), [`tunneler`]
//! (authenticated tunnels between user identities), [`network`] (the coded,
//! congestion-controlled per-link transport), [`pubsub`] (board/directory
//! synchronization), and the thin glue in [`identity`], [`addressbook`],
//! [`indexer`] and [`runtime`] that ties it all into one running node.

pub mod addressbook;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fountain;
pub mod ident;
pub mod identity;
pub mod indexer;
pub mod network;
pub mod overlay;
pub mod pubsub;
pub mod resource;
pub mod runtime;
pub mod store;
pub mod tunneler;

pub use config::Config;
pub use error::{CoreError, Result};
pub use ident::Identifier;
pub use runtime::Runtime;
