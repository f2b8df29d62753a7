//! C8 — pub/sub fabric (spec §4.7): publishers and subscribers matched by
//! path prefix, synchronized across links with `subscribe`/`publish`
//! flow-channel records (spec §6 "Flow-channel record", §4.6 "Flow
//! channel").
//!
//! Production wiring runs these records over a `network::Handler`'s flow
//! channel (`Channel::Flow`); this module only depends on the small
//! [`FlowSink`] seam so it can be exercised against an in-memory duplex the
//! same way every other transport-adjacent module in this crate is.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::crypto;
use crate::ident::Identifier;
use crate::resource::Mail;
use crate::store::{BlockStore, StoreError, ValueKind};

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed flow record: {0}")]
    Record(String),
}

// ─── Flow-channel record framing (spec §4.6/§6) ────────────────────────────

/// `type_cstring ∥ json_payload_cstring`: one command on a link's flow
/// channel. The core recognizes `subscribe` and `publish`; everything else
/// (application command types) is opaque and passed through unparsed by
/// callers that don't recognize it (spec §9 "Unknown types log a warning
/// and are ignored").
#[derive(Clone, Debug)]
pub struct FlowRecord {
    pub record_type: String,
    pub payload_json: String,
}

impl FlowRecord {
    pub fn new<T: Serialize>(record_type: &str, payload: &T) -> Self {
        FlowRecord {
            record_type: record_type.to_string(),
            payload_json: serde_json::to_string(payload)
                .expect("pub/sub payloads are always serializable"),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.record_type.len() + self.payload_json.len() + 2);
        out.extend_from_slice(self.record_type.as_bytes());
        out.push(0);
        out.extend_from_slice(self.payload_json.as_bytes());
        out.push(0);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PubSubError> {
        let nul_at = bytes.iter().position(|&b| b == 0).ok_or_else(|| PubSubError::Record("missing type terminator".into()))?;
        let record_type = String::from_utf8_lossy(&bytes[..nul_at]).into_owned();
        let rest = &bytes[nul_at + 1..];
        let payload_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let payload_json = String::from_utf8_lossy(&rest[..payload_end]).into_owned();
        Ok(FlowRecord { record_type, payload_json })
    }

    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> Result<T, PubSubError> {
        serde_json::from_str(&self.payload_json).map_err(|e| PubSubError::Record(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishPayload {
    pub path: String,
    #[serde(default)]
    pub targets: Vec<Identifier>,
    #[serde(default)]
    pub message: Option<Mail>,
}

// ─── Core types (spec §4.7 "Two dual concepts") ────────────────────────────

#[derive(Clone, Debug)]
pub enum PublishOutput {
    Targets(Vec<Identifier>),
    Mail(Box<Mail>),
}

/// Owns a prefix and, given a sub-path, returns what's published under it
/// (spec §4.7 "Publisher").
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn query(&self, sub_path: &str) -> Option<PublishOutput>;
}

/// Owns a prefix and receives `(locator, output)` notifications (spec §4.7
/// "Subscriber").
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn notify(&self, locator: &str, output: PublishOutput);
}

/// Identifies one link the fabric can push records to: `(local_user,
/// remote_user, node)`, matching `network::Handler`'s own addressing
/// (spec §4.6 "each handler serves one link").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub local: Identifier,
    pub remote: Identifier,
    pub node: Identifier,
}

#[async_trait]
pub trait FlowSink: Send + Sync {
    fn link_key(&self) -> LinkKey;
    async fn send_record(&self, record: FlowRecord) -> Result<(), PubSubError>;
}

// ─── Prefix index (spec §4.7 "Matching") ───────────────────────────────────

fn canonicalize(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Prefixes of `path`, longest first, down to the root `/` (spec "popping
/// `/`-separated segments from the right").
fn prefixes_longest_first(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    (0..=segments.len())
        .rev()
        .map(|i| if i == 0 { "/".to_string() } else { format!("/{}", segments[..i].join("/")) })
        .collect()
}

struct PrefixIndex<T> {
    entries: RwLock<HashMap<String, Vec<T>>>,
}

impl<T: Clone> PrefixIndex<T> {
    fn new() -> Self {
        PrefixIndex { entries: RwLock::new(HashMap::new()) }
    }

    async fn register(&self, prefix: &str, entry: T) {
        self.entries.write().await.entry(canonicalize(prefix)).or_default().push(entry);
    }

    async fn unregister_where(&self, prefix: &str, keep: impl Fn(&T) -> bool) {
        if let Some(v) = self.entries.write().await.get_mut(&canonicalize(prefix)) {
            v.retain(keep);
        }
    }

    /// Longest-prefix match: walk prefixes from most to least specific and
    /// stop at the first non-empty set (spec "stopping at the first
    /// non-empty match set").
    async fn longest_match(&self, path: &str) -> (String, Vec<T>) {
        let entries = self.entries.read().await;
        for prefix in prefixes_longest_first(path) {
            if let Some(v) = entries.get(&prefix) {
                if !v.is_empty() {
                    return (prefix, v.clone());
                }
            }
        }
        (String::new(), Vec::new())
    }
}

struct RemoteSubscriberEntry {
    link: Arc<dyn FlowSink>,
}

/// The pub/sub fabric (spec §4.7): one instance per node, shared by
/// whatever owns resources worth announcing (boards, directory indexes).
pub struct Fabric {
    store: Arc<BlockStore>,
    publishers: PrefixIndex<Arc<dyn Publisher>>,
    subscribers: PrefixIndex<Arc<dyn Subscriber>>,
    remote_subscribers: PrefixIndex<RemoteSubscriberEntry>,
    trusted: RwLock<HashSet<(Identifier, Identifier)>>,
    delivered: RwLock<HashSet<(Identifier, Identifier, String, Identifier)>>,
}

impl Fabric {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Fabric {
            store,
            publishers: PrefixIndex::new(),
            subscribers: PrefixIndex::new(),
            remote_subscribers: PrefixIndex::new(),
            trusted: RwLock::new(HashSet::new()),
            delivered: RwLock::new(HashSet::new()),
        }
    }

    // ─── Trust gate (spec §4.7 "Trust gate") ──────────────────────────────

    /// Called by the AddressBook when a `Listener` is registered for
    /// `(remote, local)` (spec §4.8 `register_listener`); until this is
    /// called, `subscribe`/`publish` traffic on that pair is dropped.
    pub async fn trust(&self, remote: Identifier, local: Identifier) {
        self.trusted.write().await.insert((remote, local));
    }

    pub async fn untrust(&self, remote: Identifier, local: Identifier) {
        self.trusted.write().await.remove(&(remote, local));
    }

    pub async fn is_trusted(&self, remote: Identifier, local: Identifier) -> bool {
        self.trusted.read().await.contains(&(remote, local))
    }

    // ─── Local registration ────────────────────────────────────────────────

    pub async fn register_publisher(&self, prefix: &str, publisher: Arc<dyn Publisher>) {
        self.publishers.register(prefix, publisher).await;
    }

    pub async fn register_subscriber(&self, prefix: &str, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.register(prefix, subscriber).await;
    }

    /// Answer a query by consulting the longest-matching local publisher
    /// with the remainder of `path` past the matched prefix.
    pub async fn query(&self, path: &str) -> Option<PublishOutput> {
        let (prefix, publishers) = self.publishers.longest_match(path).await;
        let sub_path = path.strip_prefix(&prefix).unwrap_or(path).trim_start_matches('/');
        for publisher in publishers {
            if let Some(output) = publisher.query(sub_path).await {
                return Some(output);
            }
        }
        None
    }

    // ─── Local announce → remote propagation ───────────────────────────────

    /// Local code announces `output` newly available under `path`: notify
    /// matching local subscribers, then forward a `publish` record to every
    /// trusted remote subscriber registered on a matching prefix.
    pub async fn publish(&self, path: &str, output: PublishOutput) -> Result<(), PubSubError> {
        self.notify_local(path, output.clone()).await;
        self.forward_to_remote(path, &output, None).await
    }

    async fn notify_local(&self, path: &str, output: PublishOutput) {
        let (_, subs) = self.subscribers.longest_match(path).await;
        for sub in subs {
            sub.notify(path, output.clone()).await;
        }
    }

    async fn forward_to_remote(
        &self,
        path: &str,
        output: &PublishOutput,
        origin: Option<LinkKey>,
    ) -> Result<(), PubSubError> {
        let (_, remotes) = self.remote_subscribers.longest_match(path).await;
        let payload = match output {
            PublishOutput::Targets(targets) => PublishPayload { path: path.to_string(), targets: targets.clone(), message: None },
            PublishOutput::Mail(mail) => PublishPayload { path: path.to_string(), targets: Vec::new(), message: Some((**mail).clone()) },
        };
        let record = FlowRecord::new("publish", &payload);
        for remote in remotes {
            // Anti-loop: never bounce a publish straight back to the link
            // it arrived on (spec §4.7 "Anti-loop").
            if Some(remote.link.link_key()) == origin {
                continue;
            }
            remote.link.send_record(record.clone()).await?;
        }
        Ok(())
    }

    // ─── Remote fabric: inbound subscribe/publish (spec §4.7 "Remote fabric") ─

    /// Handle an inbound `subscribe{path}` record. Dropped if `link`'s
    /// `(remote, local)` pair is not trusted.
    pub async fn handle_subscribe(&self, link: Arc<dyn FlowSink>, payload: SubscribePayload) {
        let key = link.link_key();
        if !self.is_trusted(key.remote, key.local).await {
            log::warn!("pubsub: dropping subscribe({}) from untrusted link {:?}", payload.path, key);
            return;
        }
        self.remote_subscribers.register(&payload.path, RemoteSubscriberEntry { link }).await;
    }

    pub async fn handle_unsubscribe(&self, link_key: LinkKey, path: &str) {
        self.remote_subscribers.unregister_where(path, |e| e.link.link_key() != link_key).await;
    }

    /// Handle an inbound `publish{path, targets?, message?}` record (spec
    /// §4.7): cache targets/node mappings, deliver to local subscribers
    /// (deduped per `(path, target)` for idempotence, spec I2), and
    /// re-propagate to other trusted remote subscribers.
    pub async fn handle_publish(&self, from: LinkKey, payload: PublishPayload) -> Result<(), PubSubError> {
        if !self.is_trusted(from.remote, from.local).await {
            log::warn!("pubsub: dropping publish({}) from untrusted link {:?}", payload.path, from);
            return Ok(());
        }

        let path_key = crypto::system_hash(payload.path.as_bytes());
        let mut fresh_targets = Vec::new();
        for target in &payload.targets {
            self.store.store_value(&path_key, target, ValueKind::Temporary).await?;
            self.store.store_value(target, &from.node, ValueKind::Temporary).await?;

            let dedup_key = (from.remote, from.local, payload.path.clone(), *target);
            if self.delivered.write().await.insert(dedup_key) {
                fresh_targets.push(*target);
            }
        }

        if let Some(mail) = &payload.message {
            let mail_digest = mail.digest().map_err(|e| PubSubError::Record(e.to_string()))?;
            let dedup_key = (from.remote, from.local, payload.path.clone(), mail_digest);
            if self.delivered.write().await.insert(dedup_key) {
                self.notify_local(&payload.path, PublishOutput::Mail(Box::new(mail.clone()))).await;
            }
        } else if !fresh_targets.is_empty() {
            self.notify_local(&payload.path, PublishOutput::Targets(fresh_targets)).await;
        }

        let output = match &payload.message {
            Some(mail) => PublishOutput::Mail(Box::new(mail.clone())),
            None => PublishOutput::Targets(payload.targets.clone()),
        };
        self.forward_to_remote(&payload.path, &output, Some(from)).await
    }
}
