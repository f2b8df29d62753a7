//! C5 — overlay network (spec §4.4): routing plane over authenticated
//! node-to-node links, plus a Kademlia-flavored DHT layered on the block
//! store's `map` table.

pub mod backend;
pub mod dht;
pub mod message;
pub mod peerstore;
pub mod tracker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::ident::Identifier;
use crate::store::{BlockStore, StoreError, ValueKind};

pub use backend::{BackendError, Link};
pub use message::{MessageError, MessageType, OverlayMessage};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no route to {0}: no neighbors")]
    NoRoute(Identifier),
    #[error("peer cache error: {0}")]
    PeerStore(#[from] peerstore::PeerStoreError),
    #[error("tracker error: {0}")]
    Tracker(#[from] tracker::TrackerError),
}

/// A message delivered to `self` (destination reached, or link-local
/// traffic), handed off to higher layers (tunneler, pub/sub, application
/// callers) via [`Overlay::inbound`].
pub type Inbound = mpsc::UnboundedReceiver<OverlayMessage>;

/// Routing and DHT core for one node (spec §4.4). Two concurrent transport
/// backends register their accepted/connected links here via
/// [`Overlay::register_handler`]; this struct never dials sockets itself.
pub struct Overlay {
    self_id: Identifier,
    store: Arc<BlockStore>,
    handlers: RwLock<HashMap<Identifier, Arc<dyn Link>>>,
    pending: dht::PendingRetrieves,
    inbound_tx: mpsc::UnboundedSender<OverlayMessage>,
}

impl Overlay {
    pub fn new(self_id: Identifier, store: Arc<BlockStore>) -> (Arc<Self>, Inbound) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let overlay = Arc::new(Overlay {
            self_id,
            store,
            handlers: RwLock::new(HashMap::new()),
            pending: dht::PendingRetrieves::new(),
            inbound_tx,
        });
        (overlay, inbound_rx)
    }

    pub fn self_id(&self) -> Identifier {
        self.self_id
    }

    // ─── Handler table (spec §4.4, §5 "hottest structure") ────────────────

    /// Register a newly authenticated link. Replaces and stops any existing
    /// handler for the same node id (spec "at most one registered handler
    /// per node id; the older is stopped") — the caller is responsible for
    /// actually tearing the old link down once it observes the replacement.
    pub async fn register_handler(&self, link: Arc<dyn Link>) -> Option<Arc<dyn Link>> {
        self.handlers.write().await.insert(link.remote_node(), link)
    }

    pub async fn unregister_handler(&self, node_id: &Identifier) -> Option<Arc<dyn Link>> {
        self.handlers.write().await.remove(node_id)
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_neighbor(&self, node_id: &Identifier) -> bool {
        self.handlers.read().await.contains_key(node_id)
    }

    async fn neighbor_ids(&self) -> Vec<Identifier> {
        self.handlers.read().await.keys().copied().collect()
    }

    // ─── Routing (spec §4.4 "Routing", P3) ─────────────────────────────────

    /// Route `message` one hop further. `previous_hop` is the neighbor the
    /// message just arrived from (`None` if locally originated), excluded
    /// from forwarding candidates to avoid sending it straight back.
    pub async fn route(&self, mut message: OverlayMessage, previous_hop: Option<Identifier>) -> Result<(), OverlayError> {
        let Some(destination) = message.destination else {
            // Link-local traffic with no destination is only meaningful to
            // the peer that sent it; nothing further to route.
            return Ok(());
        };

        if destination == self.self_id {
            let _ = self.inbound_tx.send(message);
            return Ok(());
        }

        if !message.decrement_ttl() {
            log::debug!("overlay: dropping zero-ttl message to {destination}");
            return Ok(());
        }

        if let Some(link) = self.handlers.read().await.get(&destination) {
            return Ok(link.send(&message).await?);
        }

        let neighbors = self.neighbor_ids().await;
        let mut candidates: Vec<Identifier> =
            neighbors.into_iter().filter(|id| Some(*id) != previous_hop).collect();
        if candidates.is_empty() {
            return Err(OverlayError::NoRoute(destination));
        }
        crate::ident::sort_by_distance(&mut candidates, &destination);

        // Pick one of the two closest non-deterministically to diffuse load
        // (spec §4.4 "random coin flip").
        let pick = if candidates.len() >= 2 && rand::thread_rng().gen_bool(0.5) { 1 } else { 0 };
        let next_hop = candidates[pick];

        let link = self.handlers.read().await.get(&next_hop).cloned();
        match link {
            Some(link) => Ok(link.send(&message).await?),
            None => Err(OverlayError::NoRoute(destination)),
        }
    }

    /// Send a message directly to `destination` if it's a known neighbor;
    /// otherwise go through [`Overlay::route`].
    pub async fn send(&self, message: OverlayMessage) -> Result<(), OverlayError> {
        self.route(message, None).await
    }

    /// Process an inbound frame received on `from`'s link: dispatches
    /// protocol messages handled entirely within the overlay (DHT, path
    /// folding, ping/pong) and forwards anything else via [`Overlay::route`].
    pub async fn handle_inbound(&self, message: OverlayMessage, from: Identifier) -> Result<(), OverlayError> {
        match message.message_type {
            MessageType::Dummy => Ok(()),
            MessageType::Offer => self.handle_offer(message, from).await,
            MessageType::Suggest => self.handle_suggest(message).await,
            MessageType::Store => self.handle_store(message, from).await,
            MessageType::Retrieve => self.handle_retrieve(message, from).await,
            MessageType::Value => self.handle_value(message).await,
            MessageType::Ping => {
                if message.destination == Some(self.self_id) {
                    self.handle_ping(message, from).await
                } else {
                    self.route(message, Some(from)).await
                }
            }
            _ => self.route(message, Some(from)).await,
        }
    }

    // ─── Path folding (spec §4.4 "Path-folding") ───────────────────────────

    async fn handle_offer(&self, message: OverlayMessage, from: Identifier) -> Result<(), OverlayError> {
        let payload: message::OfferPayload = message::decode_payload(&message.content)?;
        let source = message.source.unwrap_or(from);

        let neighbors = self.neighbor_ids().await;
        for neighbor in neighbors {
            if neighbor == from {
                continue;
            }
            if neighbor.distance(&source) < self.self_id.distance(&source) {
                let suggest = OverlayMessage::new(
                    MessageType::Suggest,
                    self.self_id,
                    neighbor,
                    message::encode_payload(&message::SuggestPayload { source, addresses: payload.addresses.clone() }),
                );
                self.route(suggest, None).await?;
            }
        }
        Ok(())
    }

    async fn handle_suggest(&self, message: OverlayMessage) -> Result<(), OverlayError> {
        let payload: message::SuggestPayload = message::decode_payload(&message.content)?;
        if self.is_neighbor(&payload.source).await || payload.source == self.self_id {
            return Ok(());
        }
        log::debug!("overlay: suggested unknown node {} at {:?}; connect is the caller's job", payload.source, payload.addresses);
        // Establishing the outbound connection is the stream/datagram
        // backend's job; the overlay only surfaces the opportunity via the
        // inbound queue for whatever component owns dialing.
        let _ = self.inbound_tx.send(message);
        Ok(())
    }

    /// Broadcast an `Offer` to all current neighbors (spec §4.4
    /// "Periodically a node broadcasts Offer(addresses)").
    pub async fn broadcast_offer(&self, addresses: Vec<String>) -> Result<(), OverlayError> {
        let payload = message::encode_payload(&message::OfferPayload { addresses });
        for neighbor in self.neighbor_ids().await {
            let offer = OverlayMessage::new(MessageType::Offer, self.self_id, neighbor, payload.clone());
            self.route(offer, None).await?;
        }
        Ok(())
    }

    // ─── DHT (spec §4.4 "DHT") ──────────────────────────────────────────────

    /// `store(key, value)`: persist locally as `Distributed`, then forward
    /// to the `N_STORE` closest known node ids.
    pub async fn dht_store(&self, key: Identifier, value: Identifier) -> Result<(), OverlayError> {
        self.store.store_value(&key, &value, ValueKind::Distributed).await?;
        let neighbors = self.neighbor_ids().await;
        let targets = dht::closest_nodes(&neighbors, self.self_id, &key, dht::N_STORE);
        let payload = message::encode_payload(&message::StorePayload { key, value });
        for target in targets {
            if target == self.self_id {
                continue;
            }
            let msg = OverlayMessage::new(MessageType::Store, self.self_id, target, payload.clone());
            self.route(msg, None).await?;
        }
        Ok(())
    }

    async fn handle_store(&self, message: OverlayMessage, from: Identifier) -> Result<(), OverlayError> {
        if message.destination != Some(self.self_id) {
            return self.route(message, Some(from)).await;
        }
        let payload: message::StorePayload = message::decode_payload(&message.content)?;
        self.store.store_value(&payload.key, &payload.value, ValueKind::Distributed).await?;
        Ok(())
    }

    /// `retrieve(key)`: send a `Retrieve` to each of the `N_STORE` closest
    /// known node ids (mirroring `dht_store`'s own targeting) and wait up to
    /// `timeout` for `Value` responses, coalescing with any concurrent
    /// retrieve of the same key (spec §5 "at most once per key").
    pub async fn dht_retrieve(&self, key: Identifier, timeout: Duration) -> Result<Vec<Identifier>, OverlayError> {
        let local = self.store.retrieve_value(&key).await?;
        if !local.is_empty() {
            return Ok(local);
        }
        let neighbors = self.neighbor_ids().await;
        let targets = dht::closest_nodes(&neighbors, self.self_id, &key, dht::N_STORE);
        let payload = message::encode_payload(&message::RetrievePayload { key });
        for target in targets {
            if target == self.self_id {
                continue;
            }
            let msg = OverlayMessage::new(MessageType::Retrieve, self.self_id, target, payload.clone());
            self.route(msg, None).await?;
        }
        Ok(self.pending.wait(key, timeout).await)
    }

    async fn handle_retrieve(&self, message: OverlayMessage, from: Identifier) -> Result<(), OverlayError> {
        if message.destination != Some(self.self_id) {
            return self.route(message, Some(from)).await;
        }
        let payload: message::RetrievePayload = message::decode_payload(&message.content)?;
        let values = self.store.retrieve_value(&payload.key).await?;
        let Some(source) = message.source else { return Ok(()) };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        for value in values {
            let reply = message::encode_payload(&message::ValuePayload { key: payload.key, value, timestamp: now });
            let msg = OverlayMessage::new(MessageType::Value, self.self_id, source, reply);
            self.route(msg, None).await?;
        }
        Ok(())
    }

    async fn handle_value(&self, message: OverlayMessage) -> Result<(), OverlayError> {
        let payload: message::ValuePayload = message::decode_payload(&message.content)?;
        self.store.store_value(&payload.key, &payload.value, ValueKind::Distributed).await?;
        self.pending.deliver(payload.key, payload.value).await;
        // Also surface on the inbound queue so higher layers observe the
        // Value message itself (spec §4.4 "the queued messages are also
        // pushed into the incoming queue").
        let _ = self.inbound_tx.send(message);
        Ok(())
    }

    async fn handle_ping(&self, message: OverlayMessage, _from: Identifier) -> Result<(), OverlayError> {
        let Some(source) = message.source else { return Ok(()) };
        let pong = OverlayMessage::new(MessageType::Pong, self.self_id, source, message.content);
        self.route(pong, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::backend::duplex;
    use super::*;
    use std::time::Duration;

    async fn node(id: Identifier) -> Arc<Overlay> {
        let store = Arc::new(BlockStore::open_in_memory_for_tests().await.unwrap());
        let (overlay, _inbound) = Overlay::new(id, store);
        overlay
    }

    fn id(byte: u8) -> Identifier {
        Identifier([byte; 32])
    }

    #[tokio::test]
    async fn direct_neighbor_delivers_locally() {
        let a = node(id(1)).await;
        let (link_a, link_b) = duplex::pair(id(1), id(2));
        a.register_handler(Arc::new(link_a)).await;

        let ping = OverlayMessage::new(MessageType::Ping, id(1), id(2), b"hello".to_vec());
        a.route(ping, None).await.unwrap();
        let received = link_b.recv().await.unwrap();
        assert_eq!(received.content, b"hello");
    }

    #[tokio::test]
    async fn three_hop_ping_pong_via_relay() {
        // Topology: A <-> C <-> B (no direct A <-> B link), matching scenario 2.
        let a = node(id(0xAA)).await;
        let c = node(id(0xCC)).await;
        let b = node(id(0xBB)).await;

        let (link_a_to_c, link_c_to_a) = duplex::pair(id(0xAA), id(0xCC));
        let (link_c_to_b, link_b_to_c) = duplex::pair(id(0xCC), id(0xBB));
        a.register_handler(Arc::new(link_a_to_c)).await;
        c.register_handler(Arc::new(link_c_to_a)).await;
        c.register_handler(Arc::new(link_c_to_b)).await;
        b.register_handler(Arc::new(link_b_to_c)).await;

        let ping = OverlayMessage::new(MessageType::Ping, id(0xAA), id(0xBB), b"ping-1".to_vec());
        a.route(ping, None).await.unwrap();

        // c relays: the c<->a link_a_to_c counterpart receives the frame.
        let c_link_handlers = c.handlers.read().await;
        let inbound_on_c = c_link_handlers.get(&id(0xAA)).unwrap().recv().await.unwrap();
        drop(c_link_handlers);
        c.handle_inbound(inbound_on_c, id(0xAA)).await.unwrap();

        let b_link_handlers = b.handlers.read().await;
        let inbound_on_b = b_link_handlers.get(&id(0xCC)).unwrap().recv().await.unwrap();
        drop(b_link_handlers);
        assert_eq!(inbound_on_b.content, b"ping-1");
        assert_eq!(inbound_on_b.destination, Some(id(0xBB)));
    }

    #[tokio::test]
    async fn zero_ttl_message_is_dropped_without_forward() {
        let a = node(id(1)).await;
        let (link_a, _link_b) = duplex::pair(id(1), id(2));
        a.register_handler(Arc::new(link_a)).await;

        let mut msg = OverlayMessage::new(MessageType::Ping, id(1), id(2), vec![]);
        msg.ttl = 0;
        // destination != self, ttl already 0: route() must drop, not send.
        a.route(msg, None).await.unwrap();
        // No panic and no send attempted; nothing else to assert without a
        // recv() timeout helper, so this test mainly guards against panics.
    }

    #[tokio::test]
    async fn dht_store_then_local_retrieve_finds_value() {
        let a = node(id(1)).await;
        let key = crate::crypto::system_hash(b"k");
        let value = crate::crypto::system_hash(b"v");
        a.dht_store(key, value).await.unwrap();
        let found = a.dht_retrieve(key, Duration::from_millis(50)).await.unwrap();
        assert_eq!(found, vec![value]);
    }
}
